use anyhow::{Context, Result};
use axum::{routing::get, Router};
use chrono::{DateTime, Utc};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::sync::Arc;

use crate::config::SourceDef;
use crate::orchestrator::SyncRunResult;
use crate::status::StatusTracker;

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder. Fails if one is already installed.
    pub fn install() -> Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("prometheus: install recorder")?;
        ensure_described();
        Ok(Self { handle })
    }

    /// `/metrics` in the Prometheus exposition format. Status gauges are refreshed on every
    /// scrape so age-type series stay current between runs.
    pub fn router(&self, status: Arc<StatusTracker>, sources: Vec<SourceDef>) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                let status = status.clone();
                let sources = sources.clone();
                async move {
                    refresh_status_gauges(&status, &sources, Utc::now());
                    h.render()
                }
            }),
        )
    }
}

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("branding_sync_runs_total", "Finished sync runs.");
        describe_counter!("branding_sync_runs_success_total", "Sync runs without a run-level error.");
        describe_counter!("branding_sync_runs_failure_total", "Sync runs with a run-level error.");
        describe_counter!("branding_items_fetched_total", "Items returned by source adapters.");
        describe_counter!("branding_articles_uploaded_total", "Articles written to the store.");
        describe_counter!(
            "branding_duplicate_skipped_batch_total",
            "Duplicates dropped within one batch or one multi-source run."
        );
        describe_counter!(
            "branding_duplicate_skipped_store_total",
            "Items skipped because the store already holds their URL."
        );
        describe_counter!(
            "branding_dedupe_check_unavailable_total",
            "Items skipped because the existence check failed."
        );
        describe_counter!("branding_malformed_url_total", "Items skipped for an unparseable URL.");
        describe_counter!("branding_insert_failures_total", "Items whose insert failed.");
        describe_counter!("branding_notifications_total", "Notification deliveries by channel and outcome.");
        describe_histogram!("branding_sync_run_duration_ms", "Wall time of one sync run in milliseconds.");
        describe_gauge!("branding_source_last_run_timestamp", "Unix ts of the last run per source.");
        describe_gauge!(
            "branding_source_last_success_timestamp",
            "Unix ts of the last successful run per source (0 = never)."
        );
        describe_gauge!(
            "branding_source_last_success_age_seconds",
            "Seconds since the last successful run (since process start if none)."
        );
        describe_gauge!(
            "branding_source_consecutive_zero_runs",
            "Successful runs in a row that inserted nothing."
        );
    });
}

pub fn record_run(r: &SyncRunResult) {
    let source = r.source_id.to_string();
    let trigger = r.trigger.to_string();
    counter!("branding_sync_runs_total", "source" => source.clone(), "trigger" => trigger).increment(1);
    match &r.error {
        None => counter!("branding_sync_runs_success_total", "source" => source.clone()).increment(1),
        Some(e) => {
            let kind = serde_json::to_value(e)
                .ok()
                .and_then(|v| v["kind"].as_str().map(str::to_string))
                .unwrap_or_else(|| "unknown".to_string());
            counter!("branding_sync_runs_failure_total", "source" => source.clone(), "kind" => kind).increment(1);
        }
    }
    let add = |name: &'static str, n: usize| {
        if n > 0 {
            counter!(name, "source" => source.clone()).increment(n as u64);
        }
    };
    add("branding_items_fetched_total", r.items_fetched);
    add("branding_articles_uploaded_total", r.items_inserted);
    add("branding_duplicate_skipped_batch_total", r.duplicates_in_batch);
    add("branding_duplicate_skipped_store_total", r.duplicates_in_store);
    add("branding_dedupe_check_unavailable_total", r.existence_check_failed);
    add("branding_malformed_url_total", r.items_malformed);
    add("branding_insert_failures_total", r.items_insert_failed);

    let ms = (r.finished_at - r.started_at).num_milliseconds().max(0) as f64;
    histogram!("branding_sync_run_duration_ms", "source" => source.clone()).record(ms);
    gauge!("branding_source_last_run_timestamp", "source" => source).set(r.started_at.timestamp() as f64);
}

pub fn refresh_status_gauges(status: &StatusTracker, sources: &[SourceDef], now: DateTime<Utc>) {
    for def in sources {
        let source = def.id.to_string();
        let st = status.get(&def.id);
        let last_success = st.as_ref().and_then(|s| s.last_success_at);
        let age_from = last_success.unwrap_or_else(|| status.process_started());
        gauge!("branding_source_last_success_timestamp", "source" => source.clone())
            .set(last_success.map(|t| t.timestamp()).unwrap_or(0) as f64);
        gauge!("branding_source_last_success_age_seconds", "source" => source.clone())
            .set((now - age_from).num_seconds().max(0) as f64);
        gauge!("branding_source_consecutive_zero_runs", "source" => source)
            .set(st.map(|s| s.consecutive_zero_new_runs).unwrap_or(0) as f64);
    }
}

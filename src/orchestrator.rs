//! Per-source sync runs: fetch, canonicalize, batch-dedupe, existence-check, insert.
//!
//! Runs of the same source are serialized by a per-source async mutex that is held for the
//! whole run, status update and alert bookkeeping included. Different sources run concurrently.
//! Notifications go out after the mutex is released.

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::alerts::{AlertEvent, AlertPolicy};
use crate::config::{SourceDef, SyncConfig};
use crate::error::{ItemError, Retryable, RunError, StoreError};
use crate::ingest::canonical::{CanonicalKey, Canonicalizer};
use crate::ingest::dedup::{dedupe_batch_counted, RunScope};
use crate::ingest::existence::{check_one, filter_existing, lookup_for, SkipReason};
use crate::ingest::types::{Article, FetchWindow, SourceAdapter, SourceId};
use crate::notify::{Notification, NotifierMux};
use crate::retry::{with_retry, RetryPolicy};
use crate::status::StatusTracker;
use crate::store::{StoreClient, StoredRecord};

/// What started a run. Shows up in logs, metrics labels and alert texts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RunTrigger {
    Manual,
    ScheduledDaily,
    ScheduledWeekly,
    Watchdog,
    Other(String),
}

impl RunTrigger {
    pub fn as_str(&self) -> &str {
        match self {
            RunTrigger::Manual => "manual",
            RunTrigger::ScheduledDaily => "scheduled_daily",
            RunTrigger::ScheduledWeekly => "scheduled_weekly",
            RunTrigger::Watchdog => "watchdog",
            RunTrigger::Other(s) => s,
        }
    }
}

impl fmt::Display for RunTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for RunTrigger {
    fn from(s: &str) -> Self {
        match s {
            "manual" => RunTrigger::Manual,
            "scheduled_daily" => RunTrigger::ScheduledDaily,
            "scheduled_weekly" => RunTrigger::ScheduledWeekly,
            "watchdog" => RunTrigger::Watchdog,
            other => RunTrigger::Other(other.to_string()),
        }
    }
}

impl Serialize for RunTrigger {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub trigger: RunTrigger,
    /// Fetch window is `[today - lookback_days, today]` in the configured timezone.
    pub lookback_days: u32,
    /// Suppress the "articles were added" summary. Alerts are never silenced.
    pub silent: bool,
}

impl RunOptions {
    pub fn manual(lookback_days: u32) -> Self {
        Self {
            trigger: RunTrigger::Manual,
            lookback_days,
            silent: false,
        }
    }

    pub fn scheduled(trigger: RunTrigger, lookback_days: u32) -> Self {
        Self {
            trigger,
            lookback_days,
            silent: false,
        }
    }

    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Fetching,
    Canonicalizing,
    BatchDeduping,
    ExistenceChecking,
    Inserting,
    Done,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncRunResult {
    pub source_id: SourceId,
    pub trigger: RunTrigger,
    pub lookback_days: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub items_fetched: usize,
    pub items_malformed: usize,
    pub items_after_batch_dedupe: usize,
    pub items_after_existence_check: usize,
    pub items_inserted: usize,
    pub items_insert_failed: usize,
    pub duplicates_in_batch: usize,
    pub duplicates_in_store: usize,
    pub existence_check_failed: usize,
    pub error: Option<RunError>,
    pub final_state: RunState,
    pub cancelled: bool,
}

impl SyncRunResult {
    pub fn new(source_id: SourceId, opts: &RunOptions, started_at: DateTime<Utc>) -> Self {
        Self {
            source_id,
            trigger: opts.trigger.clone(),
            lookback_days: opts.lookback_days,
            started_at,
            finished_at: started_at,
            items_fetched: 0,
            items_malformed: 0,
            items_after_batch_dedupe: 0,
            items_after_existence_check: 0,
            items_inserted: 0,
            items_insert_failed: 0,
            duplicates_in_batch: 0,
            duplicates_in_store: 0,
            existence_check_failed: 0,
            error: None,
            final_state: RunState::Fetching,
            cancelled: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && !self.cancelled
    }

    /// `inserted <= after_existence_check <= after_batch_dedupe <= fetched`
    pub fn counts_consistent(&self) -> bool {
        self.items_inserted <= self.items_after_existence_check
            && self.items_after_existence_check <= self.items_after_batch_dedupe
            && self.items_after_batch_dedupe <= self.items_fetched
    }

    fn fail(&mut self, error: RunError) {
        self.error = Some(error);
        self.final_state = RunState::Failed;
    }

    fn cancel(&mut self) {
        self.cancelled = true;
        self.final_state = RunState::Cancelled;
    }
}

/// Outcome of a multi-source run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncBatchReport {
    pub results: Vec<SyncRunResult>,
    pub total_inserted: usize,
}

impl SyncBatchReport {
    pub fn from_results(results: Vec<SyncRunResult>) -> Self {
        let total_inserted = results.iter().map(|r| r.items_inserted).sum();
        Self {
            results,
            total_inserted,
        }
    }

    /// `source: error` lines for every failed run.
    pub fn errors(&self) -> Vec<String> {
        self.results
            .iter()
            .filter_map(|r| r.error.as_ref().map(|e| format!("{}: {e}", r.source_id)))
            .collect()
    }

    pub fn get(&self, source_id: &str) -> Option<&SyncRunResult> {
        self.results.iter().find(|r| r.source_id.as_str() == source_id)
    }
}

/// Which sources a run covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSelection {
    All,
    Only(Vec<SourceId>),
}

impl FromStr for SourceSelection {
    type Err = std::convert::Infallible;

    /// `all` (or nothing) selects every source; otherwise a comma or space separated id list.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ids: Vec<SourceId> = s
            .split(|c: char| c == ',' || c.is_whitespace())
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(SourceId::from)
            .collect();
        if ids.is_empty() || ids.iter().any(|id| id.as_str().eq_ignore_ascii_case("all")) {
            Ok(SourceSelection::All)
        } else {
            Ok(SourceSelection::Only(ids))
        }
    }
}

struct SourceSlot {
    def: SourceDef,
    adapter: Option<Arc<dyn SourceAdapter>>,
    guard: tokio::sync::Mutex<()>,
}

pub struct Orchestrator {
    slots: Vec<SourceSlot>,
    store: Arc<dyn StoreClient>,
    notifier: NotifierMux,
    status: Arc<StatusTracker>,
    alerts: AlertPolicy,
    canonicalizer: Canonicalizer,
    fetch_policy: RetryPolicy,
    check_policy: RetryPolicy,
    insert_policy: RetryPolicy,
}

impl Orchestrator {
    pub fn new(
        sources: Vec<SourceDef>,
        store: Arc<dyn StoreClient>,
        notifier: NotifierMux,
        status: Arc<StatusTracker>,
        alerts: AlertPolicy,
    ) -> Self {
        crate::metrics::ensure_described();
        let slots = sources
            .into_iter()
            .map(|def| SourceSlot {
                def,
                adapter: None,
                guard: tokio::sync::Mutex::new(()),
            })
            .collect();
        Self {
            slots,
            store,
            notifier,
            status,
            alerts,
            canonicalizer: Canonicalizer::default(),
            fetch_policy: RetryPolicy::default(),
            check_policy: RetryPolicy::default(),
            insert_policy: RetryPolicy::default(),
        }
    }

    pub fn from_config(
        cfg: &SyncConfig,
        store: Arc<dyn StoreClient>,
        notifier: NotifierMux,
        status: Arc<StatusTracker>,
    ) -> Result<Self> {
        let policy = cfg.http.retry_policy();
        Ok(Self::new(cfg.sources.clone(), store, notifier, status, AlertPolicy::from_config(cfg)?)
            .with_canonicalizer(cfg.canonical.canonicalizer())
            .with_retry_policies(policy, policy, policy))
    }

    /// Register the adapter of a configured source; unknown ids are ignored with a warning.
    pub fn with_adapter(mut self, source_id: &SourceId, adapter: Arc<dyn SourceAdapter>) -> Self {
        match self.slots.iter_mut().find(|s| &s.def.id == source_id) {
            Some(slot) => slot.adapter = Some(adapter),
            None => tracing::warn!(source = %source_id, "adapter for unconfigured source ignored"),
        }
        self
    }

    pub fn with_canonicalizer(mut self, canonicalizer: Canonicalizer) -> Self {
        self.canonicalizer = canonicalizer;
        self
    }

    pub fn with_retry_policies(mut self, fetch: RetryPolicy, check: RetryPolicy, insert: RetryPolicy) -> Self {
        self.fetch_policy = fetch;
        self.check_policy = check;
        self.insert_policy = insert;
        self
    }

    /// Configured sources in registry order.
    pub fn sources(&self) -> Vec<SourceDef> {
        self.slots.iter().map(|s| s.def.clone()).collect()
    }

    pub fn source(&self, id: &SourceId) -> Option<&SourceDef> {
        self.slot(id).map(|s| &s.def)
    }

    pub fn status(&self) -> &Arc<StatusTracker> {
        &self.status
    }

    pub fn store(&self) -> &Arc<dyn StoreClient> {
        &self.store
    }

    pub fn alert_policy(&self) -> &AlertPolicy {
        &self.alerts
    }

    fn slot(&self, id: &SourceId) -> Option<&SourceSlot> {
        self.slots.iter().find(|s| &s.def.id == id)
    }

    /// One source, one run. Manual and scheduled triggers both land here.
    pub async fn run_sync(&self, source_id: &SourceId, opts: &RunOptions, cancel: &CancellationToken) -> SyncRunResult {
        self.run_scoped(source_id, opts, cancel, None).await
    }

    /// Several sources concurrently, sharing one run scope. Per-source summaries are silenced;
    /// one aggregate summary and one failure digest go out instead.
    pub async fn run_many(
        &self,
        selection: &SourceSelection,
        opts: &RunOptions,
        cancel: &CancellationToken,
    ) -> SyncBatchReport {
        let ids: Vec<SourceId> = match selection {
            SourceSelection::All => self.slots.iter().map(|s| s.def.id.clone()).collect(),
            SourceSelection::Only(ids) => ids.clone(),
        };
        let scope = RunScope::new();
        let per_source = opts.clone().silent();
        let runs = ids
            .iter()
            .map(|id| self.run_scoped(id, &per_source, cancel, Some(&scope)));
        let report = SyncBatchReport::from_results(join_all(runs).await);

        if !opts.silent {
            if report.total_inserted > 0 {
                let text = match report.results.as_slice() {
                    [only] => format!(
                        "Articles were added to the database ({} from {}).",
                        only.items_inserted,
                        self.display_name(&only.source_id)
                    ),
                    _ => format!(
                        "Articles were added to the database ({} across all sources).",
                        report.total_inserted
                    ),
                };
                self.notifier.notify(&Notification::summary(text)).await;
            }
            let errors = report.errors();
            if !errors.is_empty() {
                let summary = errors.iter().take(3).cloned().collect::<Vec<_>>().join("; ");
                self.notifier
                    .notify(&Notification::alert(format!("One or more syncs failed: {summary}")))
                    .await;
            }
        }
        report
    }

    /// Zero-new rule over every configured source. Sources with a run in flight are skipped;
    /// their run evaluates the rule itself.
    pub async fn sweep_zero_new(&self, now: DateTime<Utc>) -> Vec<AlertEvent> {
        let mut events = Vec::new();
        for slot in &self.slots {
            let Ok(_guard) = slot.guard.try_lock() else {
                continue;
            };
            let status = self.status.get(&slot.def.id);
            let found = self.alerts.sweep(
                std::iter::once(&slot.def),
                |_| status.clone(),
                self.status.process_started(),
                now,
            );
            for ev in &found {
                self.status.mark_zero_alert(ev.source_id(), now);
            }
            events.extend(found);
        }
        for ev in &events {
            tracing::info!(source = %ev.source_id(), kind = ev.kind(), trigger = "watchdog", "alert_emitted");
            self.notifier.notify(&Notification::alert(ev.message())).await;
        }
        events
    }

    fn display_name(&self, id: &SourceId) -> String {
        self.source(id).map(|d| d.name.clone()).unwrap_or_else(|| id.to_string())
    }

    async fn run_scoped(
        &self,
        source_id: &SourceId,
        opts: &RunOptions,
        cancel: &CancellationToken,
        scope: Option<&RunScope>,
    ) -> SyncRunResult {
        let Some(slot) = self.slot(source_id) else {
            let mut result = SyncRunResult::new(source_id.clone(), opts, Utc::now());
            result.fail(RunError::UnknownSource {
                source_id: source_id.to_string(),
            });
            tracing::warn!(source = %source_id, trigger = %opts.trigger, "sync_unknown_source");
            return result;
        };

        let (result, events) = {
            let _guard = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let mut r = SyncRunResult::new(source_id.clone(), opts, Utc::now());
                    r.cancel();
                    return r;
                }
                g = slot.guard.lock() => g,
            };

            let mut result = SyncRunResult::new(source_id.clone(), opts, Utc::now());
            tracing::info!(
                source = %source_id,
                trigger = %opts.trigger,
                days = opts.lookback_days,
                "sync_started"
            );
            self.execute(slot, opts, cancel, scope, &mut result).await;
            result.finished_at = Utc::now();

            if result.cancelled {
                tracing::info!(source = %source_id, trigger = %opts.trigger, "sync_cancelled");
                return result;
            }
            debug_assert!(result.counts_consistent(), "count invariant broken: {result:?}");

            let snapshot = self.status.record(&result);
            crate::metrics::record_run(&result);
            let events = self.alerts.evaluate(
                &slot.def,
                &result,
                snapshot.as_ref(),
                self.status.process_started(),
                result.finished_at,
            );
            for ev in &events {
                if matches!(ev, AlertEvent::ZeroNew { .. }) {
                    self.status.mark_zero_alert(source_id, result.finished_at);
                }
            }
            log_finished(&result);
            (result, events)
        };

        for ev in &events {
            tracing::info!(source = %source_id, kind = ev.kind(), trigger = %opts.trigger, "alert_emitted");
            self.notifier.notify(&Notification::alert(ev.message())).await;
        }
        if !opts.silent && result.items_inserted > 0 {
            let text = format!(
                "Articles were added to the database ({} from {}).",
                result.items_inserted, slot.def.name
            );
            self.notifier.notify(&Notification::summary(text)).await;
        }
        result
    }

    async fn execute(
        &self,
        slot: &SourceSlot,
        opts: &RunOptions,
        cancel: &CancellationToken,
        scope: Option<&RunScope>,
        result: &mut SyncRunResult,
    ) {
        let source = &slot.def.id;

        // FETCHING
        result.final_state = RunState::Fetching;
        let Some(adapter) = slot.adapter.clone() else {
            result.fail(RunError::FetchFailed {
                message: format!("no adapter registered for source `{source}`"),
            });
            return;
        };
        let today = Utc::now().with_timezone(&self.alerts.tz).date_naive();
        let window = FetchWindow::lookback_in(today, opts.lookback_days, self.alerts.tz);
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                result.cancel();
                return;
            }
            r = with_retry(&self.fetch_policy, "fetch", || adapter.fetch_recent(window)) => r,
        };
        let raw = match fetched {
            Ok(v) => v,
            Err(e) => {
                result.items_fetched = 0;
                result.fail(RunError::FetchFailed {
                    message: format!("{e:#}"),
                });
                return;
            }
        };
        result.items_fetched = raw.len();

        // CANONICALIZING
        result.final_state = RunState::Canonicalizing;
        let mut articles = Vec::with_capacity(raw.len());
        for item in raw {
            match self.canonicalizer.canonicalize(&item.url) {
                Ok(key) => articles.push(Article::from_raw(item, key)),
                Err(e) => {
                    let err = ItemError::from(e);
                    result.items_malformed += 1;
                    tracing::warn!(source = %source, kind = err.kind(), error = %err, title = %item.title, "item_skipped");
                }
            }
        }

        // BATCH_DEDUPING
        result.final_state = RunState::BatchDeduping;
        let (mut batch, counts) = dedupe_batch_counted(articles);
        let mut runtime_dupes = 0usize;
        if let Some(scope) = scope {
            batch.retain(|a| {
                let fresh = scope.claim(&a.canonical_url);
                if !fresh {
                    runtime_dupes += 1;
                    tracing::debug!(source = %source, url = %a.canonical_url, "duplicate_skipped_runtime");
                }
                fresh
            });
        }
        let claimed: Vec<CanonicalKey> = if scope.is_some() {
            batch.iter().map(|a| a.canonical_url.clone()).collect()
        } else {
            Vec::new()
        };
        let release_all = |result: &mut SyncRunResult| {
            if let Some(scope) = scope {
                scope.release(claimed.iter());
            }
            result.cancel();
        };
        result.duplicates_in_batch = counts.total() + runtime_dupes;
        result.items_after_batch_dedupe = batch.len();
        if cancel.is_cancelled() {
            release_all(result);
            return;
        }

        // EXISTENCE_CHECKING
        result.final_state = RunState::ExistenceChecking;
        let report = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                release_all(result);
                return;
            }
            r = filter_existing(&*self.store, &self.canonicalizer, batch, &self.check_policy) => r,
        };
        result.duplicates_in_store = report.duplicates();
        result.existence_check_failed = report.failures();
        result.items_after_existence_check = report.kept.len();
        if cancel.is_cancelled() {
            release_all(result);
            return;
        }
        if let Some(scope) = scope {
            // unverified items stay available to a sibling source
            scope.release(
                report
                    .skipped
                    .iter()
                    .filter(|s| matches!(s.reason, SkipReason::ExistenceCheckFailed { .. }))
                    .map(|s| &s.article.canonical_url),
            );
        }
        if report.all_failed() {
            let message = report
                .last_failure()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "every existence check failed".to_string());
            result.fail(RunError::StoreUnreachable { message });
            return;
        }

        // INSERTING: from here on the run completes even if cancelled
        result.final_state = RunState::Inserting;
        let mut last_error: Option<StoreError> = None;
        for article in &report.kept {
            match self.insert_one(article).await {
                Ok(record) => {
                    result.items_inserted += 1;
                    tracing::info!(source = %source, url = %article.canonical_url, id = %record.id, "article_inserted");
                }
                Err(e) => {
                    let err = ItemError::InsertFailed {
                        url: article.canonical_url.to_string(),
                        source: e.clone(),
                    };
                    result.items_insert_failed += 1;
                    tracing::warn!(source = %source, kind = err.kind(), error = %err, "item_skipped");
                    if let Some(scope) = scope {
                        scope.release([&article.canonical_url]);
                    }
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if result.items_inserted == 0 => result.fail(RunError::InsertFailed {
                failed: result.items_insert_failed,
                last_error: e.to_string(),
            }),
            _ => result.final_state = RunState::Done,
        }
    }

    /// Inserts are not blindly retried: after a transient failure the item is looked up again
    /// and only re-inserted when it is still absent.
    async fn insert_one(&self, article: &Article) -> Result<StoredRecord, StoreError> {
        let max_attempts = self.insert_policy.retries.saturating_add(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let outcome = match tokio::time::timeout(self.insert_policy.timeout, self.store.insert(article)).await {
                Ok(r) => r,
                Err(_) => Err(StoreError::timed_out(self.insert_policy.timeout)),
            };
            let err = match outcome {
                Ok(record) => return Ok(record),
                Err(e) if e.is_transient() && attempt < max_attempts => e,
                Err(e) => return Err(e),
            };

            tracing::warn!(
                url = %article.canonical_url,
                attempt,
                error = %err,
                "insert_transient_failure"
            );
            let delay = self.insert_policy.backoff(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let lookup = lookup_for(&self.canonicalizer, article);
            match check_one(&*self.store, &lookup, &self.check_policy).await {
                Ok(Some(record)) => {
                    tracing::info!(url = %article.canonical_url, "insert_confirmed_after_failure");
                    return Ok(record);
                }
                Ok(None) => continue,
                Err(check_err) => {
                    tracing::warn!(url = %article.canonical_url, error = %check_err, "insert_unverifiable");
                    return Err(err);
                }
            }
        }
    }
}

fn log_finished(r: &SyncRunResult) {
    let duration_ms = (r.finished_at - r.started_at).num_milliseconds();
    match &r.error {
        None => tracing::info!(
            source = %r.source_id,
            trigger = %r.trigger,
            fetched = r.items_fetched,
            malformed = r.items_malformed,
            after_batch_dedupe = r.items_after_batch_dedupe,
            after_existence_check = r.items_after_existence_check,
            inserted = r.items_inserted,
            insert_failed = r.items_insert_failed,
            existence_check_failed = r.existence_check_failed,
            duration_ms,
            "sync_finished"
        ),
        Some(e) => tracing::error!(
            source = %r.source_id,
            trigger = %r.trigger,
            fetched = r.items_fetched,
            error = %e,
            duration_ms,
            "sync_failed"
        ),
    }
}

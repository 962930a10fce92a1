use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use crate::config::{DigestCfg, SyncConfig};
use crate::orchestrator::{Orchestrator, RunOptions, SourceSelection, SyncBatchReport};
use crate::report;
use crate::status::{SourceStatus, StatusTotals};

pub const HEALTH_TEXT: &str = "Branding Scraper is Live and Healthy";
const API_KEY_HEADER: &str = "x-api-key";
const MAX_SYNC_DAYS: u32 = 365;
const DEFAULT_SEARCH_LIMIT: usize = 20;
const DEFAULT_EXPORT_LIMIT: usize = 100;

#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<Orchestrator>,
    digest: DigestCfg,
    default_days: u32,
    command_token: Option<String>,
    cancel: CancellationToken,
}

impl AppState {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        cfg: &SyncConfig,
        command_token: Option<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            orchestrator,
            digest: cfg.digest.clone(),
            default_days: cfg.schedule.daily_lookback_days,
            command_token,
            cancel,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .route("/sync", post(sync))
        .route("/status", get(status_text))
        .route("/status.json", get(status_json))
        .route("/recent", get(recent))
        .route("/digest", get(digest))
        .route("/search", get(search))
        .route("/export", get(export))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

async fn health() -> &'static str {
    HEALTH_TEXT
}

type ApiResult<T> = Result<T, (StatusCode, String)>;

fn store_failed(e: impl std::fmt::Display) -> (StatusCode, String) {
    tracing::warn!(error = %e, "store read failed");
    (StatusCode::BAD_GATEWAY, format!("Store request failed: {e}"))
}

#[derive(Debug, Default, Deserialize)]
struct SyncReq {
    /// `all`, a single id, or a comma separated list.
    #[serde(default)]
    sources: Option<String>,
    #[serde(default)]
    days: Option<u32>,
}

#[derive(Serialize)]
struct SyncResp {
    reply: String,
    #[serde(flatten)]
    report: SyncBatchReport,
}

async fn sync(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<SyncResp>> {
    if let Some(expected) = state.command_token.as_deref() {
        let given = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok());
        if given != Some(expected) {
            return Err((StatusCode::UNAUTHORIZED, "missing or invalid x-api-key".into()));
        }
    }

    // an empty body means "all sources, default window"
    let req: SyncReq = if body.iter().all(u8::is_ascii_whitespace) {
        SyncReq::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid JSON body: {e}")))?
    };
    let days = req.days.unwrap_or(state.default_days);
    if !(1..=MAX_SYNC_DAYS).contains(&days) {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("days must be between 1 and {MAX_SYNC_DAYS}"),
        ));
    }
    let selection: SourceSelection = req
        .sources
        .as_deref()
        .unwrap_or("all")
        .parse()
        .unwrap_or(SourceSelection::All);

    let report = state
        .orchestrator
        .run_many(&selection, &RunOptions::manual(days), &state.cancel)
        .await;
    Ok(Json(SyncResp {
        reply: report::sync_reply(&report),
        report,
    }))
}

async fn status_text(State(state): State<AppState>) -> String {
    let orch = &state.orchestrator;
    let st = orch.status();
    report::trim_for_chat(&report::status_report(
        &orch.sources(),
        &st.get_all(),
        &st.totals(),
        st.process_started(),
        Utc::now(),
    ))
}

#[derive(Serialize)]
struct StatusOut {
    uptime_secs: i64,
    totals: StatusTotals,
    sources: Vec<SourceStatus>,
}

async fn status_json(State(state): State<AppState>) -> Json<StatusOut> {
    let st = state.orchestrator.status();
    Json(StatusOut {
        uptime_secs: (Utc::now() - st.process_started()).num_seconds().max(0),
        totals: st.totals(),
        sources: st.get_all(),
    })
}

#[derive(Deserialize)]
struct LimitQ {
    limit: Option<usize>,
}

async fn recent(State(state): State<AppState>, Query(q): Query<LimitQ>) -> ApiResult<String> {
    let limit = q.limit.unwrap_or(10).clamp(1, 50);
    let rows = state.orchestrator.store().recent(limit).await.map_err(store_failed)?;
    Ok(report::trim_for_chat(&report::recent_report(&rows, limit)))
}

#[derive(Deserialize)]
struct DigestQ {
    days: Option<u32>,
}

async fn digest(State(state): State<AppState>, Query(q): Query<DigestQ>) -> ApiResult<String> {
    let days = q.days.unwrap_or(state.digest.lookback_days).clamp(1, MAX_SYNC_DAYS);
    let tz = state.orchestrator.alert_policy().tz;
    let since = Utc::now().with_timezone(&tz).date_naive() - ChronoDuration::days(i64::from(days));
    let rows = state
        .orchestrator
        .store()
        .published_since(since, DEFAULT_EXPORT_LIMIT)
        .await
        .map_err(store_failed)?;
    Ok(report::trim_for_chat(&report::digest_report(
        &rows,
        &state.orchestrator.sources(),
        days,
        state.digest.top_per_source,
    )))
}

#[derive(Deserialize)]
struct SearchQ {
    q: Option<String>,
    limit: Option<usize>,
}

async fn search(State(state): State<AppState>, Query(q): Query<SearchQ>) -> ApiResult<String> {
    let term = q.q.as_deref().map(str::trim).unwrap_or_default();
    if term.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Usage: /search?q=<keyword>".into()));
    }
    let limit = q.limit.unwrap_or(DEFAULT_SEARCH_LIMIT).clamp(1, 50);
    let rows = state.orchestrator.store().search(term, limit).await.map_err(store_failed)?;
    Ok(report::trim_for_chat(&report::search_report(term, &rows)))
}

#[derive(Deserialize)]
struct ExportQ {
    format: Option<String>,
    limit: Option<usize>,
}

async fn export(State(state): State<AppState>, Query(q): Query<ExportQ>) -> ApiResult<Response> {
    let limit = q.limit.unwrap_or(DEFAULT_EXPORT_LIMIT).clamp(1, DEFAULT_EXPORT_LIMIT);
    let format = q.format.as_deref().unwrap_or("csv").to_ascii_lowercase();
    if format != "csv" && format != "md" && format != "markdown" {
        return Err((StatusCode::BAD_REQUEST, "format must be csv or md".into()));
    }
    let rows = state.orchestrator.store().recent(limit).await.map_err(store_failed)?;
    let rsp = if format == "csv" {
        (
            [
                (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
                (header::CONTENT_DISPOSITION, "attachment; filename=\"branding_export.csv\""),
            ],
            report::csv_export(&rows),
        )
            .into_response()
    } else {
        (
            [
                (header::CONTENT_TYPE, "text/markdown; charset=utf-8"),
                (header::CONTENT_DISPOSITION, "attachment; filename=\"branding_export.md\""),
            ],
            report::markdown_export("Branding export", &rows),
        )
            .into_response()
    };
    Ok(rsp)
}

//! Error taxonomy for the sync pipeline.
//!
//! Item-level errors (`MalformedUrl`, `ItemError`) never abort a run. `RunError` is the single
//! run-fatal outcome recorded on a `SyncRunResult`. `FetchError` and `StoreError` are what the
//! adapters and store clients return; both say whether a retry can help via [`Retryable`].

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Something a retry loop can reason about.
pub trait Retryable: Sized {
    /// True for timeouts, connection failures, 429 and 5xx responses.
    fn is_transient(&self) -> bool;
    /// Constructs the error used when a single attempt exceeds its timeout.
    fn timed_out(after: Duration) -> Self;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("malformed url `{url}`: {reason}")]
pub struct MalformedUrl {
    pub url: String,
    pub reason: String,
}

impl MalformedUrl {
    pub fn new(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reason: reason.into(),
        }
    }
}

/// Failure of a source adapter's `fetch_recent`.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transient fetch error: {0:#}")]
    Transient(anyhow::Error),
    #[error("{0:#}")]
    Permanent(anyhow::Error),
    #[error("fetch timed out after {0:?}")]
    TimedOut(Duration),
}

impl FetchError {
    /// Classifies a reqwest failure: timeouts, connect errors and 429/5xx are transient.
    pub fn from_reqwest(e: reqwest::Error) -> Self {
        let transient = e.is_timeout()
            || e.is_connect()
            || e
                .status()
                .is_some_and(|s| s.is_server_error() || s.as_u16() == 429);
        if transient {
            FetchError::Transient(e.into())
        } else {
            FetchError::Permanent(e.into())
        }
    }
}

impl Retryable for FetchError {
    fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_) | FetchError::TimedOut(_))
    }

    fn timed_out(after: Duration) -> Self {
        FetchError::TimedOut(after)
    }
}

/// Failure of a store client call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("store rejected request (status {status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("unexpected store response: {0}")]
    Decode(String),
    #[error("store not configured")]
    NotConfigured,
}

impl StoreError {
    pub fn from_reqwest(e: &reqwest::Error) -> Self {
        if e.is_timeout() {
            StoreError::Timeout(Duration::ZERO)
        } else if e.is_decode() {
            StoreError::Decode(e.to_string())
        } else {
            StoreError::Unavailable(e.to_string())
        }
    }

    /// Maps a non-success HTTP status; 429 and 5xx are treated as unavailability.
    pub fn from_status(status: u16, message: String) -> Self {
        if status == 429 || status >= 500 {
            StoreError::Unavailable(format!("status {status}: {message}"))
        } else {
            StoreError::Rejected { status, message }
        }
    }
}

impl Retryable for StoreError {
    fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout(_))
    }

    fn timed_out(after: Duration) -> Self {
        StoreError::Timeout(after)
    }
}

/// Per-item failure; logged and counted, never propagated.
#[derive(Debug, Clone, Error)]
pub enum ItemError {
    #[error(transparent)]
    MalformedUrl(#[from] MalformedUrl),
    #[error("existence check failed for {url}: {source}")]
    ExistenceCheckFailed { url: String, source: StoreError },
    #[error("insert failed for {url}: {source}")]
    InsertFailed { url: String, source: StoreError },
}

impl ItemError {
    pub fn kind(&self) -> &'static str {
        match self {
            ItemError::MalformedUrl(_) => "malformed_url",
            ItemError::ExistenceCheckFailed { .. } => "existence_check_failed",
            ItemError::InsertFailed { .. } => "insert_failed",
        }
    }
}

/// Run-fatal outcome. Any value here triggers a failure alert.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunError {
    #[error("fetch failed: {message}")]
    FetchFailed { message: String },
    #[error("store unreachable: {message}")]
    StoreUnreachable { message: String },
    #[error("all {failed} inserts failed; last error: {last_error}")]
    InsertFailed { failed: usize, last_error: String },
    #[error("unknown source `{source_id}`")]
    UnknownSource { source_id: String },
}

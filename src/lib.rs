// src/lib.rs
// Public library surface for the binaries and integration tests.

pub mod alerts;
pub mod api;
pub mod config;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod metrics;
pub mod notify;
pub mod orchestrator;
pub mod report;
pub mod retry;
pub mod status;
pub mod store;

// ---- Re-exports for stable public API ----
pub use crate::alerts::{AlertEvent, AlertPolicy, ZeroNewMode};
pub use crate::api::{router, AppState};
pub use crate::config::{Secrets, SourceDef, SyncConfig};
pub use crate::error::{FetchError, RunError, StoreError};
pub use crate::ingest::types::{Article, FetchWindow, RawArticle, SourceAdapter, SourceId};
pub use crate::notify::{Notification, NotifierMux};
pub use crate::orchestrator::{Orchestrator, RunOptions, RunTrigger, SourceSelection, SyncBatchReport, SyncRunResult};
pub use crate::status::StatusTracker;
pub use crate::store::{InMemoryStore, NotionStore, StoreClient, StoredRecord};

use std::sync::Arc;

/// Store from secrets: Notion when configured, otherwise an in-memory store (with a warning).
pub fn build_store(cfg: &SyncConfig, secrets: &Secrets, client: reqwest::Client) -> Arc<dyn StoreClient> {
    match NotionStore::from_secrets(secrets, client) {
        Some(store) => Arc::new(store.with_sources(&cfg.sources).with_timeout(cfg.http.timeout())),
        None => {
            tracing::warn!("NOTION_TOKEN / NOTION_DATABASE_ID not set; using an in-memory store");
            let names = cfg.sources.iter().map(|s| (s.id.clone(), s.name.clone()));
            Arc::new(InMemoryStore::new(cfg.canonical.canonicalizer()).with_source_names(names))
        }
    }
}

/// Orchestrator with one feed adapter per source that has a feed URL.
pub fn build_orchestrator(
    cfg: &SyncConfig,
    store: Arc<dyn StoreClient>,
    notifier: NotifierMux,
    client: reqwest::Client,
) -> anyhow::Result<Orchestrator> {
    let status = Arc::new(StatusTracker::new());
    let mut orch = Orchestrator::from_config(cfg, store, notifier, status)?;
    for (id, adapter) in ingest::providers::build_adapters(cfg, client) {
        orch = orch.with_adapter(&id, adapter);
    }
    Ok(orch)
}

/// Shared outbound client: configured timeout and user agent.
pub fn http_client(cfg: &SyncConfig) -> anyhow::Result<reqwest::Client> {
    use anyhow::Context;
    reqwest::Client::builder()
        .timeout(cfg.http.timeout())
        .user_agent(cfg.http.user_agent.clone())
        .build()
        .context("building http client")
}

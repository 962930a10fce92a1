//! Branding sync service: binary entrypoint.
//! Boots the Axum command API, the scheduler and the zero-new watchdog.

use std::sync::Arc;

use anyhow::Context;
use shuttle_axum::ShuttleAxum;
use tokio_util::sync::CancellationToken;

use branding_sync::{
    api, build_orchestrator, build_store, http_client, ingest::scheduler::Scheduler, logging, metrics::Metrics,
    NotifierMux, Secrets, SyncConfig,
};

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    logging::init();

    let cfg = SyncConfig::load_default().context("loading sync config")?;
    let secrets = Secrets::from_env();
    let client = http_client(&cfg)?;

    let store = build_store(&cfg, &secrets, client.clone());
    let notifier = NotifierMux::from_secrets(&secrets, client.clone(), cfg.http.timeout());
    tracing::info!(channels = ?notifier.channel_names(), store = store.name(), "pipeline wired");

    let orch = Arc::new(build_orchestrator(&cfg, store, notifier, client)?);
    let cancel = CancellationToken::new();

    let scheduler = Scheduler::from_config(&cfg)?;
    let _jobs = scheduler.spawn(orch.clone(), cancel.clone());

    let mut router = api::router(api::AppState::new(
        orch.clone(),
        &cfg,
        secrets.command_token.clone(),
        cancel,
    ));
    match Metrics::install() {
        Ok(m) => router = router.merge(m.router(orch.status().clone(), orch.sources())),
        Err(e) => tracing::warn!(error = %e, "metrics disabled"),
    }

    Ok(router.into())
}

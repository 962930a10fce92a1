//! One-shot sync from the command line: same pipeline as the service, no scheduler, no HTTP.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use branding_sync::notify::LogNotifier;
use branding_sync::{
    build_orchestrator, build_store, http_client, logging, report, InMemoryStore, NotifierMux, RunOptions, Secrets,
    SourceSelection, StoreClient, SyncConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Run one sync pass and print the result")]
struct Cli {
    /// `all`, one source id, or a comma separated list
    #[arg(short, long, default_value = "all")]
    sources: String,

    /// Lookback window in days
    #[arg(short, long, default_value_t = 2, value_parser = clap::value_parser!(u32).range(1..=365))]
    days: u32,

    /// Optional path to a sync.toml (otherwise $SYNC_CONFIG_PATH, then config/sync.toml)
    #[arg(short, long, env = "SYNC_CONFIG_PATH")]
    config: Option<std::path::PathBuf>,

    /// Write into a throwaway in-memory store and log notifications instead of sending them
    #[arg(long)]
    dry_run: bool,

    /// Print the full run report as JSON
    #[arg(long)]
    json: bool,
}

/// Dry runs announce what they would have sent through the log.
fn dry_run_notifier() -> NotifierMux {
    NotifierMux::default().with(Arc::new(LogNotifier))
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    logging::init();
    let cli = Cli::parse();

    let cfg = match &cli.config {
        Some(p) => {
            let mut cfg = SyncConfig::load_from(p)?;
            cfg.apply_env_overrides()?;
            cfg.validate()?;
            cfg
        }
        None => SyncConfig::load_default()?,
    };
    let client = http_client(&cfg)?;

    let (store, notifier): (Arc<dyn StoreClient>, NotifierMux) = if cli.dry_run {
        let names = cfg.sources.iter().map(|s| (s.id.clone(), s.name.clone()));
        (
            Arc::new(InMemoryStore::new(cfg.canonical.canonicalizer()).with_source_names(names)),
            dry_run_notifier(),
        )
    } else {
        let secrets = Secrets::from_env();
        (
            build_store(&cfg, &secrets, client.clone()),
            NotifierMux::from_secrets(&secrets, client.clone(), cfg.http.timeout()),
        )
    };

    let orch = build_orchestrator(&cfg, store, notifier, client)?;
    let selection: SourceSelection = cli.sources.parse().unwrap_or(SourceSelection::All);
    let report = orch
        .run_many(&selection, &RunOptions::manual(cli.days), &CancellationToken::new())
        .await;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report).context("serializing report")?);
    } else {
        for r in &report.results {
            println!(
                "{:<20} fetched={:<3} inserted={:<3} dup_batch={:<3} dup_store={:<3} check_failed={:<3} error={}",
                r.source_id.as_str(),
                r.items_fetched,
                r.items_inserted,
                r.duplicates_in_batch,
                r.duplicates_in_store,
                r.existence_check_failed,
                r.error.as_ref().map(|e| e.to_string()).unwrap_or_else(|| "-".into())
            );
        }
        println!("{}", report::sync_reply(&report));
    }

    if report.errors().is_empty() {
        Ok(())
    } else {
        std::process::exit(1)
    }
}

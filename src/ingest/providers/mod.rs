pub mod feed;

pub use feed::FeedSource;

use std::sync::Arc;

use crate::config::SyncConfig;
use crate::ingest::types::{SourceAdapter, SourceId};

/// One feed adapter per source that has a `feed_url`. Sources without one get no adapter
/// and their runs fail with a fetch error until one is wired in.
pub fn build_adapters(cfg: &SyncConfig, client: reqwest::Client) -> Vec<(SourceId, Arc<dyn SourceAdapter>)> {
    cfg.sources
        .iter()
        .filter_map(|def| {
            let url = def.feed_url.as_deref()?.trim();
            if url.is_empty() {
                return None;
            }
            let adapter: Arc<dyn SourceAdapter> =
                Arc::new(FeedSource::from_url(def.id.clone(), def.name.clone(), url, client.clone()));
            Some((def.id.clone(), adapter))
        })
        .collect()
}

//! Destination collection for synced articles.
//!
//! The pipeline only needs `find_by_canonical_url` and `insert`; the remaining read calls feed
//! the command interface (recent entries, digest, search, export).

pub mod memory;
pub mod notion;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::ingest::canonical::CanonicalKey;
use crate::ingest::types::Article;

pub use memory::InMemoryStore;
pub use notion::NotionStore;

/// One record as read back from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: String,
    pub title: String,
    pub url: String,
    /// Source display name, e.g. "Brand New".
    pub source: String,
    pub date: Option<String>,
    pub created_time: Option<String>,
}

impl StoredRecord {
    /// Case-insensitive substring match over title, url, source and date.
    pub fn matches(&self, term: &str) -> bool {
        let needle = term.trim().to_lowercase();
        if needle.is_empty() {
            return false;
        }
        let haystack = format!(
            "{} {} {} {}",
            self.title,
            self.url,
            self.source,
            self.date.as_deref().unwrap_or_default()
        )
        .to_lowercase();
        haystack.contains(&needle)
    }
}

/// Everything needed to look up an article that may have been stored under an older,
/// non-canonical spelling of its URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlLookup {
    pub key: CanonicalKey,
    /// Candidate spellings, canonical first.
    pub variants: Vec<String>,
}

impl UrlLookup {
    pub fn exact(key: CanonicalKey) -> Self {
        let variants = vec![key.to_string()];
        Self { key, variants }
    }
}

#[async_trait::async_trait]
pub trait StoreClient: Send + Sync {
    /// Any record whose URL canonicalizes to `lookup.key`.
    async fn find_by_canonical_url(&self, lookup: &UrlLookup) -> Result<Option<StoredRecord>, StoreError>;

    async fn insert(&self, article: &Article) -> Result<StoredRecord, StoreError>;

    /// Newest records first, by creation time.
    async fn recent(&self, limit: usize) -> Result<Vec<StoredRecord>, StoreError>;

    /// Records published on or after `since`, newest first.
    async fn published_since(&self, since: NaiveDate, limit: usize) -> Result<Vec<StoredRecord>, StoreError>;

    async fn search(&self, term: &str, limit: usize) -> Result<Vec<StoredRecord>, StoreError>;

    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_is_case_insensitive_and_ignores_blank_terms() {
        let r = StoredRecord {
            id: "1".into(),
            title: "Packaging refresh for Acme".into(),
            url: "https://example.com/acme".into(),
            source: "Brand New".into(),
            date: Some("2025-02-01".into()),
            created_time: None,
        };
        assert!(r.matches("PACKAGING"));
        assert!(r.matches("brand new"));
        assert!(r.matches("2025-02"));
        assert!(!r.matches("   "));
        assert!(!r.matches("forbes"));
    }
}

// src/ingest/existence.rs
use crate::error::{ItemError, StoreError};
use crate::ingest::canonical::Canonicalizer;
use crate::ingest::types::Article;
use crate::retry::{with_retry, RetryPolicy};
use crate::store::{StoreClient, StoredRecord, UrlLookup};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The store already holds a record for this canonical URL.
    DuplicateFound { record_url: String },
    /// The lookup failed even after retries; the item is not inserted.
    ExistenceCheckFailed { error: StoreError },
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::DuplicateFound { .. } => "duplicate_found",
            SkipReason::ExistenceCheckFailed { .. } => "existence_check_failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Skipped {
    pub article: Article,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Default)]
pub struct ExistenceReport {
    pub kept: Vec<Article>,
    pub skipped: Vec<Skipped>,
}

impl ExistenceReport {
    pub fn duplicates(&self) -> usize {
        self.skipped
            .iter()
            .filter(|s| matches!(s.reason, SkipReason::DuplicateFound { .. }))
            .count()
    }

    pub fn failures(&self) -> usize {
        self.skipped
            .iter()
            .filter(|s| matches!(s.reason, SkipReason::ExistenceCheckFailed { .. }))
            .count()
    }

    /// Every lookup of a non-empty batch failed.
    pub fn all_failed(&self) -> bool {
        let checked = self.kept.len() + self.skipped.len();
        checked > 0 && self.failures() == checked
    }

    pub fn last_failure(&self) -> Option<&StoreError> {
        self.skipped.iter().rev().find_map(|s| match &s.reason {
            SkipReason::ExistenceCheckFailed { error } => Some(error),
            SkipReason::DuplicateFound { .. } => None,
        })
    }
}

pub fn lookup_for(canonicalizer: &Canonicalizer, article: &Article) -> UrlLookup {
    UrlLookup {
        key: article.canonical_url.clone(),
        variants: canonicalizer.lookup_variants(&article.raw_url, &article.canonical_url),
    }
}

/// One retried lookup.
pub async fn check_one(
    store: &dyn StoreClient,
    lookup: &UrlLookup,
    policy: &RetryPolicy,
) -> Result<Option<StoredRecord>, StoreError> {
    with_retry(policy, "existence_check", || store.find_by_canonical_url(lookup)).await
}

/// Split `articles` into those absent from the store and those to skip.
///
/// Lookups run one after another in input order; `kept` preserves that order. A lookup that
/// still fails after retries skips the item, it never falls through to insert.
pub async fn filter_existing(
    store: &dyn StoreClient,
    canonicalizer: &Canonicalizer,
    articles: Vec<Article>,
    policy: &RetryPolicy,
) -> ExistenceReport {
    let mut report = ExistenceReport {
        kept: Vec::with_capacity(articles.len()),
        skipped: Vec::new(),
    };

    for article in articles {
        let lookup = lookup_for(canonicalizer, &article);
        match check_one(store, &lookup, policy).await {
            Ok(None) => report.kept.push(article),
            Ok(Some(record)) => {
                tracing::info!(
                    source = %article.source_id,
                    url = %article.canonical_url,
                    stored_url = %record.url,
                    "duplicate_skipped_store"
                );
                report.skipped.push(Skipped {
                    article,
                    reason: SkipReason::DuplicateFound { record_url: record.url },
                });
            }
            Err(error) => {
                let err = ItemError::ExistenceCheckFailed {
                    url: article.canonical_url.to_string(),
                    source: error.clone(),
                };
                tracing::warn!(
                    source = %article.source_id,
                    kind = err.kind(),
                    error = %err,
                    "item_skipped"
                );
                report.skipped.push(Skipped {
                    article,
                    reason: SkipReason::ExistenceCheckFailed { error },
                });
            }
        }
    }
    report
}

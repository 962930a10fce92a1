// src/ingest/dedup.rs
use std::collections::HashSet;
use std::sync::Mutex;

use crate::ingest::canonical::CanonicalKey;
use crate::ingest::normalize_title;
use crate::ingest::types::Article;

/// Why a later item of a batch was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateReason {
    UrlInBatch,
    TitleDateInBatch,
}

impl DuplicateReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DuplicateReason::UrlInBatch => "url_in_batch",
            DuplicateReason::TitleDateInBatch => "title_date_in_batch",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupCounts {
    pub url_in_batch: usize,
    pub title_date_in_batch: usize,
}

impl DedupCounts {
    pub fn total(&self) -> usize {
        self.url_in_batch + self.title_date_in_batch
    }
}

/// Keep the first occurrence of every canonical URL; survivors stay in first-seen order.
pub fn dedupe_batch(articles: Vec<Article>) -> Vec<Article> {
    dedupe_batch_counted(articles).0
}

/// Same as [`dedupe_batch`], also reporting what was dropped and why.
///
/// A secondary key (source, publication date, folded title) catches the same story
/// published under two URLs in one listing. Untitled items never match on it.
pub fn dedupe_batch_counted(articles: Vec<Article>) -> (Vec<Article>, DedupCounts) {
    let mut seen_urls: HashSet<CanonicalKey> = HashSet::with_capacity(articles.len());
    let mut seen_content: HashSet<(String, Option<String>, String)> = HashSet::new();
    let mut keep = Vec::with_capacity(articles.len());
    let mut counts = DedupCounts::default();

    for article in articles {
        let title = normalize_title(&article.title);
        let content_key = (!title.is_empty())
            .then(|| (article.source_id.to_string(), article.date_string(), title));

        let reason = if seen_urls.contains(&article.canonical_url) {
            Some(DuplicateReason::UrlInBatch)
        } else if content_key.as_ref().is_some_and(|k| seen_content.contains(k)) {
            Some(DuplicateReason::TitleDateInBatch)
        } else {
            None
        };

        if let Some(reason) = reason {
            match reason {
                DuplicateReason::UrlInBatch => counts.url_in_batch += 1,
                DuplicateReason::TitleDateInBatch => counts.title_date_in_batch += 1,
            }
            tracing::debug!(
                source = %article.source_id,
                reason = reason.as_str(),
                url = %article.canonical_url,
                title = %article.title,
                "duplicate_skipped_batch"
            );
            continue;
        }

        seen_urls.insert(article.canonical_url.clone());
        if let Some(k) = content_key {
            seen_content.insert(k);
        }
        keep.push(article);
    }

    (keep, counts)
}

/// Canonical keys claimed during one multi-source run, so the same story surfacing from
/// two sources in one "sync all" is only inserted once.
#[derive(Debug, Default)]
pub struct RunScope {
    claimed: Mutex<HashSet<CanonicalKey>>,
}

impl RunScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if the key was not yet claimed in this scope.
    pub fn claim(&self, key: &CanonicalKey) -> bool {
        self.claimed
            .lock()
            .expect("run scope mutex poisoned")
            .insert(key.clone())
    }

    /// Give keys back, e.g. when a run is cancelled before inserting.
    pub fn release<'a>(&self, keys: impl IntoIterator<Item = &'a CanonicalKey>) {
        let mut g = self.claimed.lock().expect("run scope mutex poisoned");
        for k in keys {
            g.remove(k);
        }
    }

    pub fn len(&self) -> usize {
        self.claimed.lock().expect("run scope mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

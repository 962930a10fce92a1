// src/store/memory.rs
use chrono::{NaiveDate, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{StoreClient, StoredRecord, UrlLookup};
use crate::error::StoreError;
use crate::ingest::canonical::Canonicalizer;
use crate::ingest::types::{Article, SourceId};

/// Store kept in process memory. Used by tests and dry runs.
///
/// Lookups canonicalize the stored URLs on the fly, so records seeded with
/// non-canonical URLs still match. Failures can be injected per operation.
pub struct InMemoryStore {
    canonicalizer: Canonicalizer,
    source_names: HashMap<SourceId, String>,
    records: Mutex<Vec<StoredRecord>>,
    lookup_failure: Mutex<Option<StoreError>>,
    lookup_failures_for: Mutex<HashSet<String>>,
    insert_failure: Mutex<Option<StoreError>>,
    insert_failures_for: Mutex<HashSet<String>>,
    lookups: AtomicUsize,
    inserts: AtomicUsize,
    next_id: AtomicUsize,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new(Canonicalizer::default())
    }
}

impl InMemoryStore {
    pub fn new(canonicalizer: Canonicalizer) -> Self {
        Self {
            canonicalizer,
            source_names: HashMap::new(),
            records: Mutex::new(Vec::new()),
            lookup_failure: Mutex::new(None),
            lookup_failures_for: Mutex::new(HashSet::new()),
            insert_failure: Mutex::new(None),
            insert_failures_for: Mutex::new(HashSet::new()),
            lookups: AtomicUsize::new(0),
            inserts: AtomicUsize::new(0),
            next_id: AtomicUsize::new(1),
        }
    }

    /// Display names written into `StoredRecord::source` on insert.
    pub fn with_source_names(mut self, names: impl IntoIterator<Item = (SourceId, String)>) -> Self {
        self.source_names = names.into_iter().collect();
        self
    }

    pub fn seed(&self, records: impl IntoIterator<Item = StoredRecord>) {
        self.lock_records().extend(records);
    }

    pub fn records(&self) -> Vec<StoredRecord> {
        self.lock_records().clone()
    }

    pub fn len(&self) -> usize {
        self.lock_records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every lookup fails with `err` (or succeeds again with `None`).
    pub fn fail_lookups(&self, err: Option<StoreError>) {
        *self.lookup_failure.lock().expect("store mutex poisoned") = err;
    }

    /// Lookups for this canonical URL fail with `Unavailable`.
    pub fn fail_lookup_for(&self, canonical_url: &str) {
        self.lookup_failures_for
            .lock()
            .expect("store mutex poisoned")
            .insert(canonical_url.to_string());
    }

    pub fn fail_inserts(&self, err: Option<StoreError>) {
        *self.insert_failure.lock().expect("store mutex poisoned") = err;
    }

    /// Inserts of this canonical URL are rejected.
    pub fn fail_insert_for(&self, canonical_url: &str) {
        self.insert_failures_for
            .lock()
            .expect("store mutex poisoned")
            .insert(canonical_url.to_string());
    }

    pub fn lookup_calls(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn insert_calls(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }

    fn lock_records(&self) -> std::sync::MutexGuard<'_, Vec<StoredRecord>> {
        self.records.lock().expect("store mutex poisoned")
    }
}

#[async_trait::async_trait]
impl StoreClient for InMemoryStore {
    async fn find_by_canonical_url(&self, lookup: &UrlLookup) -> Result<Option<StoredRecord>, StoreError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.lookup_failure.lock().expect("store mutex poisoned").clone() {
            return Err(err);
        }
        if self
            .lookup_failures_for
            .lock()
            .expect("store mutex poisoned")
            .contains(lookup.key.as_str())
        {
            return Err(StoreError::Unavailable(format!("injected failure for {}", lookup.key)));
        }

        let records = self.lock_records();
        let found = records.iter().find(|r| {
            lookup.variants.iter().any(|v| v == &r.url)
                || self
                    .canonicalizer
                    .canonicalize(&r.url)
                    .is_ok_and(|k| k == lookup.key)
        });
        Ok(found.cloned())
    }

    async fn insert(&self, article: &Article) -> Result<StoredRecord, StoreError> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.insert_failure.lock().expect("store mutex poisoned").clone() {
            return Err(err);
        }
        if self
            .insert_failures_for
            .lock()
            .expect("store mutex poisoned")
            .contains(article.canonical_url.as_str())
        {
            return Err(StoreError::Rejected {
                status: 400,
                message: format!("injected rejection for {}", article.canonical_url),
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let record = StoredRecord {
            id: format!("mem-{id}"),
            title: article.title.clone(),
            url: article.canonical_url.to_string(),
            source: self
                .source_names
                .get(&article.source_id)
                .cloned()
                .unwrap_or_else(|| article.source_id.to_string()),
            date: article.date_string(),
            created_time: Some(Utc::now().to_rfc3339()),
        };
        self.lock_records().push(record.clone());
        Ok(record)
    }

    async fn recent(&self, limit: usize) -> Result<Vec<StoredRecord>, StoreError> {
        // insertion order doubles as creation order
        Ok(self.lock_records().iter().rev().take(limit).cloned().collect())
    }

    async fn published_since(&self, since: NaiveDate, limit: usize) -> Result<Vec<StoredRecord>, StoreError> {
        let mut out: Vec<StoredRecord> = self
            .lock_records()
            .iter()
            .filter(|r| {
                r.date
                    .as_deref()
                    .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
                    .is_some_and(|d| d >= since)
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| b.date.cmp(&a.date));
        out.truncate(limit);
        Ok(out)
    }

    async fn search(&self, term: &str, limit: usize) -> Result<Vec<StoredRecord>, StoreError> {
        Ok(self
            .lock_records()
            .iter()
            .rev()
            .filter(|r| r.matches(term))
            .take(limit)
            .cloned()
            .collect())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

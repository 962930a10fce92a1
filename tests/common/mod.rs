// tests/common/mod.rs
//
// Shared fixtures for the integration tests: a scripted source adapter, a store wrapper that
// loses insert acknowledgements, and an orchestrator wired with zero-delay retries.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};

use branding_sync::alerts::AlertPolicy;
use branding_sync::config::sync::default_sources;
use branding_sync::error::{FetchError, StoreError};
use branding_sync::ingest::types::{Article, FetchWindow, RawArticle, SourceAdapter, SourceId};
use branding_sync::notify::{Notifier, NotifierMux, RecordingNotifier};
use branding_sync::orchestrator::Orchestrator;
use branding_sync::retry::RetryPolicy;
use branding_sync::status::StatusTracker;
use branding_sync::store::{InMemoryStore, StoreClient, StoredRecord, UrlLookup};

pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        timeout: Duration::from_secs(2),
        retries: 1,
        base_delay: Duration::ZERO,
    }
}

pub fn article(source: &str, title: &str, url: &str) -> RawArticle {
    RawArticle::new(source, title, url).published(Utc::now())
}

enum Script {
    Items(Vec<RawArticle>),
    Fail(&'static str),
}

/// Adapter returning a fixed batch (or a fixed error), optionally after a delay.
/// Tracks how many fetches overlap.
pub struct StaticSource {
    script: Mutex<Script>,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl StaticSource {
    pub fn new(items: Vec<RawArticle>) -> Self {
        Self {
            script: Mutex::new(Script::Items(items)),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn failing(message: &'static str) -> Self {
        let s = Self::new(Vec::new());
        *s.script.lock().unwrap() = Script::Fail(message);
        s
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_items(&self, items: Vec<RawArticle>) {
        *self.script.lock().unwrap() = Script::Items(items);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceAdapter for StaticSource {
    async fn fetch_recent(&self, _window: FetchWindow) -> Result<Vec<RawArticle>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        match &*self.script.lock().unwrap() {
            Script::Items(v) => Ok(v.clone()),
            Script::Fail(m) => Err(FetchError::Permanent(anyhow::anyhow!(*m))),
        }
    }

    fn name(&self) -> &str {
        "static"
    }
}

/// Writes through to the inner store but reports the first `n` inserts as timed out,
/// like a store that committed the page and then dropped the connection.
pub struct LostAckStore {
    pub inner: Arc<InMemoryStore>,
    lose: AtomicUsize,
}

impl LostAckStore {
    pub fn new(inner: Arc<InMemoryStore>, lose_first: usize) -> Self {
        Self {
            inner,
            lose: AtomicUsize::new(lose_first),
        }
    }
}

#[async_trait]
impl StoreClient for LostAckStore {
    async fn find_by_canonical_url(&self, lookup: &UrlLookup) -> Result<Option<StoredRecord>, StoreError> {
        self.inner.find_by_canonical_url(lookup).await
    }

    async fn insert(&self, article: &Article) -> Result<StoredRecord, StoreError> {
        let rec = self.inner.insert(article).await?;
        let lost = self
            .lose
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if lost {
            return Err(StoreError::Timeout(Duration::from_secs(20)));
        }
        Ok(rec)
    }

    async fn recent(&self, limit: usize) -> Result<Vec<StoredRecord>, StoreError> {
        self.inner.recent(limit).await
    }

    async fn published_since(&self, since: NaiveDate, limit: usize) -> Result<Vec<StoredRecord>, StoreError> {
        self.inner.published_since(since, limit).await
    }

    async fn search(&self, term: &str, limit: usize) -> Result<Vec<StoredRecord>, StoreError> {
        self.inner.search(term, limit).await
    }

    fn name(&self) -> &'static str {
        "lost-ack"
    }
}

pub fn memory_store() -> Arc<InMemoryStore> {
    let names = default_sources().into_iter().map(|s| (s.id, s.name));
    Arc::new(InMemoryStore::default().with_source_names(names))
}

pub struct Harness {
    pub orch: Orchestrator,
    pub store: Arc<InMemoryStore>,
    pub notes: Arc<RecordingNotifier>,
    pub status: Arc<StatusTracker>,
}

/// Orchestrator over the default registry with the given adapters and zero-delay retries.
pub fn harness(adapters: Vec<(&str, Arc<dyn SourceAdapter>)>) -> Harness {
    harness_with(adapters, memory_store(), Arc::new(StatusTracker::new()))
}

pub fn harness_with(
    adapters: Vec<(&str, Arc<dyn SourceAdapter>)>,
    store: Arc<InMemoryStore>,
    status: Arc<StatusTracker>,
) -> Harness {
    let notes = Arc::new(RecordingNotifier::new());
    let orch = orchestrator_over(store.clone(), adapters, notes.clone(), status.clone());
    Harness {
        orch,
        store,
        notes,
        status,
    }
}

pub fn orchestrator_over(
    store: Arc<dyn StoreClient>,
    adapters: Vec<(&str, Arc<dyn SourceAdapter>)>,
    notes: Arc<RecordingNotifier>,
    status: Arc<StatusTracker>,
) -> Orchestrator {
    let mut orch = Orchestrator::new(
        default_sources(),
        store,
        NotifierMux::new(vec![notes as Arc<dyn Notifier>]),
        status,
        AlertPolicy::default(),
    )
    .with_retry_policies(fast_policy(), fast_policy(), fast_policy());
    for (id, adapter) in adapters {
        orch = orch.with_adapter(&SourceId::from(id), adapter);
    }
    orch
}

pub fn adapter(src: &Arc<StaticSource>) -> Arc<dyn SourceAdapter> {
    src.clone()
}

// src/status.rs
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::ingest::types::SourceId;
use crate::orchestrator::SyncRunResult;

/// Per-source bookkeeping. Created on first run, never removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceStatus {
    pub source_id: SourceId,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_added_count: usize,
    /// Items of the last successful run already present in the store.
    pub last_duplicates_in_store: usize,
    /// Items of the last successful run skipped because the store lookup failed.
    pub last_existence_check_failed: usize,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub consecutive_zero_new_runs: u32,
    pub consecutive_failures: u32,
    pub first_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_non_zero_at: Option<DateTime<Utc>>,
    pub last_zero_alert_at: Option<DateTime<Utc>>,
    pub total_runs: u64,
    pub total_added: u64,
    pub total_failures: u64,
}

impl SourceStatus {
    pub fn new(source_id: SourceId) -> Self {
        Self {
            source_id,
            last_success_at: None,
            last_added_count: 0,
            last_duplicates_in_store: 0,
            last_existence_check_failed: 0,
            last_error: None,
            last_error_at: None,
            consecutive_zero_new_runs: 0,
            consecutive_failures: 0,
            first_run_at: None,
            last_run_at: None,
            last_non_zero_at: None,
            last_zero_alert_at: None,
            total_runs: 0,
            total_added: 0,
            total_failures: 0,
        }
    }

    /// Whole days since the last run that inserted something (or since `process_started`).
    pub fn consecutive_zero_new_days(&self, now: DateTime<Utc>, process_started: DateTime<Utc>) -> i64 {
        let baseline = self.last_non_zero_at.unwrap_or(process_started);
        (now - baseline).num_days().max(0)
    }

    fn apply(&mut self, result: &SyncRunResult) {
        self.total_runs += 1;
        self.last_run_at = Some(result.started_at);
        self.first_run_at.get_or_insert(result.started_at);
        self.total_added += result.items_inserted as u64;

        match &result.error {
            None => {
                self.last_success_at = Some(result.finished_at);
                self.last_added_count = result.items_inserted;
                self.last_duplicates_in_store = result.duplicates_in_store;
                self.last_existence_check_failed = result.existence_check_failed;
                self.last_error = None;
                self.consecutive_failures = 0;
                if result.items_inserted > 0 {
                    self.consecutive_zero_new_runs = 0;
                    self.last_non_zero_at = Some(result.finished_at);
                } else {
                    self.consecutive_zero_new_runs += 1;
                }
            }
            Some(err) => {
                self.last_error = Some(err.to_string());
                self.last_error_at = Some(result.finished_at);
                self.consecutive_failures += 1;
                self.total_failures += 1;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusTotals {
    pub runs: u64,
    pub successes: u64,
    pub failures: u64,
    pub inserted: u64,
}

/// Process-wide status container. Each record is replaced under one write lock, so readers
/// never see a half-applied run.
#[derive(Debug)]
pub struct StatusTracker {
    started_at: DateTime<Utc>,
    inner: RwLock<HashMap<SourceId, SourceStatus>>,
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::started_at(Utc::now())
    }

    /// Tracker whose process start is `at`; lets tests control the zero-new baseline.
    pub fn started_at(at: DateTime<Utc>) -> Self {
        Self {
            started_at: at,
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn process_started(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Apply a finished run; returns the updated snapshot. Cancelled runs leave no trace.
    pub fn record(&self, result: &SyncRunResult) -> Option<SourceStatus> {
        if result.cancelled {
            return None;
        }
        let mut guard = self.inner.write().expect("status lock poisoned");
        let entry = guard
            .entry(result.source_id.clone())
            .or_insert_with(|| SourceStatus::new(result.source_id.clone()));
        entry.apply(result);
        Some(entry.clone())
    }

    pub fn get(&self, source_id: &SourceId) -> Option<SourceStatus> {
        self.inner
            .read()
            .expect("status lock poisoned")
            .get(source_id)
            .cloned()
    }

    /// All known entries, ordered by source id.
    pub fn get_all(&self) -> Vec<SourceStatus> {
        let mut all: Vec<SourceStatus> = self
            .inner
            .read()
            .expect("status lock poisoned")
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        all
    }

    pub fn totals(&self) -> StatusTotals {
        let guard = self.inner.read().expect("status lock poisoned");
        guard.values().fold(StatusTotals::default(), |mut t, s| {
            t.runs += s.total_runs;
            t.failures += s.total_failures;
            t.successes += s.total_runs - s.total_failures;
            t.inserted += s.total_added;
            t
        })
    }

    /// Remember that a zero-new alert went out. Creates the entry for sources that never ran.
    pub fn mark_zero_alert(&self, source_id: &SourceId, at: DateTime<Utc>) {
        let mut guard = self.inner.write().expect("status lock poisoned");
        guard
            .entry(source_id.clone())
            .or_insert_with(|| SourceStatus::new(source_id.clone()))
            .last_zero_alert_at = Some(at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RunError;
    use crate::orchestrator::RunOptions;
    use chrono::{Duration, TimeZone};

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, h, 0, 0).unwrap()
    }

    fn run(id: &str, inserted: usize, error: Option<RunError>, h: u32) -> SyncRunResult {
        let mut r = SyncRunResult::new(SourceId::from(id), &RunOptions::manual(2), at(h));
        r.finished_at = at(h) + Duration::minutes(1);
        r.items_inserted = inserted;
        r.error = error;
        r
    }

    #[test]
    fn success_then_failure_keeps_last_success() {
        let tracker = StatusTracker::started_at(at(0));
        tracker.record(&run("a", 3, None, 1));
        let s = tracker
            .record(&run("a", 0, Some(RunError::FetchFailed { message: "down".into() }), 2))
            .unwrap();
        assert_eq!(s.last_success_at, Some(at(1) + Duration::minutes(1)));
        assert_eq!(s.last_added_count, 3);
        assert_eq!(s.last_error.as_deref(), Some("fetch failed: down"));
        assert_eq!(s.consecutive_failures, 1);
        assert_eq!(s.total_runs, 2);
        assert_eq!(s.first_run_at, Some(at(1)));
    }

    #[test]
    fn zero_runs_count_up_and_reset_on_insert() {
        let tracker = StatusTracker::started_at(at(0));
        tracker.record(&run("a", 0, None, 1));
        let s = tracker.record(&run("a", 0, None, 2)).unwrap();
        assert_eq!(s.consecutive_zero_new_runs, 2);
        assert_eq!(s.last_non_zero_at, None);
        let s = tracker.record(&run("a", 1, None, 3)).unwrap();
        assert_eq!(s.consecutive_zero_new_runs, 0);
        assert!(s.last_non_zero_at.is_some());
    }

    #[test]
    fn success_clears_last_error() {
        let tracker = StatusTracker::started_at(at(0));
        tracker.record(&run("a", 0, Some(RunError::FetchFailed { message: "x".into() }), 1));
        let s = tracker.record(&run("a", 0, None, 2)).unwrap();
        assert!(s.last_error.is_none());
        assert!(s.last_error_at.is_some());
        assert_eq!(s.consecutive_failures, 0);
    }

    #[test]
    fn skip_counts_of_the_last_success_are_kept() {
        let tracker = StatusTracker::started_at(at(0));
        let mut r = run("a", 1, None, 1);
        r.duplicates_in_store = 4;
        r.existence_check_failed = 2;
        let s = tracker.record(&r).unwrap();
        assert_eq!((s.last_duplicates_in_store, s.last_existence_check_failed), (4, 2));

        // a failed run does not overwrite them
        let s = tracker
            .record(&run("a", 0, Some(RunError::FetchFailed { message: "x".into() }), 2))
            .unwrap();
        assert_eq!(s.last_existence_check_failed, 2);

        let s = tracker.record(&run("a", 0, None, 3)).unwrap();
        assert_eq!((s.last_duplicates_in_store, s.last_existence_check_failed), (0, 0));
    }

    #[test]
    fn cancelled_runs_are_not_recorded() {
        let tracker = StatusTracker::new();
        let mut r = run("a", 0, None, 1);
        r.cancelled = true;
        assert!(tracker.record(&r).is_none());
        assert!(tracker.get(&SourceId::from("a")).is_none());
    }

    #[test]
    fn totals_and_zero_days() {
        let tracker = StatusTracker::started_at(at(0));
        tracker.record(&run("a", 2, None, 1));
        tracker.record(&run("b", 0, Some(RunError::FetchFailed { message: "x".into() }), 1));
        let t = tracker.totals();
        assert_eq!(
            t,
            StatusTotals {
                runs: 2,
                successes: 1,
                failures: 1,
                inserted: 2
            }
        );
        let b = tracker.get(&SourceId::from("b")).unwrap();
        assert_eq!(b.consecutive_zero_new_days(at(0) + Duration::days(3), at(0)), 3);
        assert_eq!(tracker.get_all().len(), 2);
    }

    #[test]
    fn mark_zero_alert_creates_missing_entries() {
        let tracker = StatusTracker::new();
        let id = SourceId::from("never-ran");
        tracker.mark_zero_alert(&id, at(5));
        let s = tracker.get(&id).unwrap();
        assert_eq!(s.last_zero_alert_at, Some(at(5)));
        assert_eq!(s.total_runs, 0);
    }
}

//! Failure and zero-new-articles alert policy.
//!
//! Everything here is pure: callers pass the current time and the status snapshot, and get back
//! the alerts that should go out. Delivery and suppression bookkeeping are the orchestrator's job.

use anyhow::Result;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::config::{ScheduleClass, SourceDef, SyncConfig};
use crate::error::RunError;
use crate::ingest::types::SourceId;
use crate::orchestrator::{RunTrigger, SyncRunResult};
use crate::status::SourceStatus;

const MAX_ERROR_CHARS: usize = 220;

/// How "days without new articles" are counted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZeroNewMode {
    /// Difference of local calendar dates.
    #[default]
    Calendar,
    /// Whole 24h periods elapsed.
    Elapsed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertEvent {
    RunFailed {
        source_id: SourceId,
        source_name: String,
        error: RunError,
        lookback_days: u32,
        trigger: RunTrigger,
    },
    ZeroNew {
        source_id: SourceId,
        source_name: String,
        days: i64,
        threshold: u32,
        trigger: RunTrigger,
    },
    /// The run succeeded but some items were skipped because their store lookup failed.
    ExistenceCheckSkipped {
        source_id: SourceId,
        source_name: String,
        skipped: usize,
        trigger: RunTrigger,
    },
}

impl AlertEvent {
    pub fn source_id(&self) -> &SourceId {
        match self {
            AlertEvent::RunFailed { source_id, .. }
            | AlertEvent::ZeroNew { source_id, .. }
            | AlertEvent::ExistenceCheckSkipped { source_id, .. } => source_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AlertEvent::RunFailed { .. } => "run_failed",
            AlertEvent::ZeroNew { .. } => "zero_new",
            AlertEvent::ExistenceCheckSkipped { .. } => "existence_check_skipped",
        }
    }

    pub fn message(&self) -> String {
        match self {
            AlertEvent::RunFailed {
                source_name,
                error,
                lookback_days,
                trigger,
                ..
            } => {
                let err: String = error.to_string().chars().take(MAX_ERROR_CHARS).collect();
                format!("ALERT: Sync failed for {source_name} (days={lookback_days}, trigger={trigger}). Error: {err}")
            }
            AlertEvent::ZeroNew {
                source_name,
                days,
                threshold,
                trigger,
                ..
            } => format!(
                "ALERT: {source_name} has produced zero new articles for {days} days. (threshold={threshold}, trigger={trigger})"
            ),
            AlertEvent::ExistenceCheckSkipped {
                source_name,
                skipped,
                trigger,
                ..
            } => format!(
                "ALERT: Duplicate check failed for {skipped} item(s) from {source_name}; they were skipped, not inserted. (trigger={trigger})"
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlertPolicy {
    pub daily_days: u32,
    pub weekly_days: u32,
    pub mode: ZeroNewMode,
    /// Zone used for calendar-day counting.
    pub tz: Tz,
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self {
            daily_days: 2,
            weekly_days: 14,
            mode: ZeroNewMode::Calendar,
            tz: chrono_tz::Asia::Damascus,
        }
    }
}

impl AlertPolicy {
    pub fn from_config(cfg: &SyncConfig) -> Result<Self> {
        Ok(Self {
            daily_days: cfg.alerts.zero_new_days_daily,
            weekly_days: cfg.alerts.zero_new_days_weekly,
            mode: cfg.alerts.zero_new_mode,
            tz: cfg.tz()?,
        })
    }

    pub fn threshold(&self, class: ScheduleClass) -> u32 {
        match class {
            ScheduleClass::Daily => self.daily_days,
            ScheduleClass::Weekly => self.weekly_days,
        }
    }

    pub fn days_between(&self, baseline: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
        let days = match self.mode {
            ZeroNewMode::Calendar => {
                let from = baseline.with_timezone(&self.tz).date_naive();
                let to = now.with_timezone(&self.tz).date_naive();
                (to - from).num_days()
            }
            ZeroNewMode::Elapsed => (now - baseline).num_days(),
        };
        days.max(0)
    }

    /// Zero-new rule alone. The quiet period starts at the last run that inserted something,
    /// or at process start for sources that never did. One alert per quiet period.
    pub fn zero_new_check(
        &self,
        source: &SourceDef,
        status: Option<&SourceStatus>,
        process_started: DateTime<Utc>,
        now: DateTime<Utc>,
        trigger: &RunTrigger,
    ) -> Option<AlertEvent> {
        let baseline = status
            .and_then(|s| s.last_non_zero_at)
            .unwrap_or(process_started);
        let already_alerted = status
            .and_then(|s| s.last_zero_alert_at)
            .is_some_and(|at| at >= baseline);
        if already_alerted {
            return None;
        }

        let threshold = self.threshold(source.class);
        let days = self.days_between(baseline, now);
        (days >= i64::from(threshold)).then(|| AlertEvent::ZeroNew {
            source_id: source.id.clone(),
            source_name: source.name.clone(),
            days,
            threshold,
            trigger: trigger.clone(),
        })
    }

    /// Alerts owed after one finished run. `status` is the snapshot after recording `result`.
    pub fn evaluate(
        &self,
        source: &SourceDef,
        result: &SyncRunResult,
        status: Option<&SourceStatus>,
        process_started: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Vec<AlertEvent> {
        if result.cancelled {
            return Vec::new();
        }
        let mut out = Vec::new();
        match &result.error {
            Some(error) => out.push(AlertEvent::RunFailed {
                source_id: source.id.clone(),
                source_name: source.name.clone(),
                error: error.clone(),
                lookback_days: result.lookback_days,
                trigger: result.trigger.clone(),
            }),
            None if result.existence_check_failed > 0 => out.push(AlertEvent::ExistenceCheckSkipped {
                source_id: source.id.clone(),
                source_name: source.name.clone(),
                skipped: result.existence_check_failed,
                trigger: result.trigger.clone(),
            }),
            None => {}
        }
        if result.items_inserted == 0 {
            out.extend(self.zero_new_check(source, status, process_started, now, &result.trigger));
        }
        out
    }

    /// Zero-new rule over every configured source, whether it ran or not.
    pub fn sweep<'a, F>(
        &self,
        sources: impl IntoIterator<Item = &'a SourceDef>,
        status_of: F,
        process_started: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Vec<AlertEvent>
    where
        F: Fn(&SourceId) -> Option<SourceStatus>,
    {
        let trigger = RunTrigger::Watchdog;
        sources
            .into_iter()
            .filter_map(|def| {
                let status = status_of(&def.id);
                self.zero_new_check(def, status.as_ref(), process_started, now, &trigger)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::sync::default_sources;
    use crate::orchestrator::RunOptions;
    use chrono::{Duration, TimeZone};

    fn t(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, d, h, 0, 0).unwrap()
    }

    fn daily() -> SourceDef {
        default_sources().remove(0)
    }

    fn weekly() -> SourceDef {
        default_sources().remove(1)
    }

    fn status_with_non_zero(at: DateTime<Utc>) -> SourceStatus {
        let mut s = SourceStatus::new(daily().id);
        s.last_non_zero_at = Some(at);
        s
    }

    fn zero_result(source: &SourceDef, now: DateTime<Utc>) -> SyncRunResult {
        SyncRunResult::new(source.id.clone(), &RunOptions::manual(2), now)
    }

    #[test]
    fn daily_threshold_fires_after_three_days_not_after_one() {
        let policy = AlertPolicy::default();
        let src = daily();
        let now = t(10, 12);
        let start = t(1, 0);

        let stale = status_with_non_zero(now - Duration::days(3));
        let r = zero_result(&src, now);
        let ev = policy.evaluate(&src, &r, Some(&stale), start, now);
        assert_eq!(ev.len(), 1);
        assert!(matches!(ev[0], AlertEvent::ZeroNew { days: 3, threshold: 2, .. }));

        let fresh = status_with_non_zero(now - Duration::days(1));
        assert!(policy.evaluate(&src, &r, Some(&fresh), start, now).is_empty());
    }

    #[test]
    fn weekly_class_uses_its_own_threshold() {
        let policy = AlertPolicy::default();
        let src = weekly();
        let now = t(20, 12);
        let st = status_with_non_zero(now - Duration::days(5));
        assert!(policy
            .zero_new_check(&src, Some(&st), t(1, 0), now, &RunTrigger::Manual)
            .is_none());
        let st = status_with_non_zero(now - Duration::days(14));
        assert!(policy
            .zero_new_check(&src, Some(&st), t(1, 0), now, &RunTrigger::Manual)
            .is_some());
    }

    #[test]
    fn calendar_and_elapsed_modes_differ_across_midnight() {
        let calendar = AlertPolicy {
            tz: chrono_tz::UTC,
            ..AlertPolicy::default()
        };
        let elapsed = AlertPolicy {
            mode: ZeroNewMode::Elapsed,
            ..calendar.clone()
        };
        // 23:00 on the 1st to 01:00 on the 3rd: two calendar days, one full day
        let (from, to) = (t(1, 23), t(3, 1));
        assert_eq!(calendar.days_between(from, to), 2);
        assert_eq!(elapsed.days_between(from, to), 1);
    }

    #[test]
    fn alert_is_sent_once_per_quiet_period() {
        let policy = AlertPolicy::default();
        let src = daily();
        let now = t(10, 12);
        let mut st = status_with_non_zero(t(5, 12));
        st.last_zero_alert_at = Some(t(8, 12));
        assert!(policy
            .zero_new_check(&src, Some(&st), t(1, 0), now, &RunTrigger::Manual)
            .is_none());

        // a later non-zero run opens a new period
        st.last_non_zero_at = Some(t(9, 0));
        assert!(policy
            .zero_new_check(&src, Some(&st), t(1, 0), t(12, 12), &RunTrigger::Manual)
            .is_some());
    }

    #[test]
    fn never_run_sources_count_from_process_start() {
        let policy = AlertPolicy::default();
        let sources = default_sources();
        let started = t(1, 0);
        let ev = policy.sweep(&sources, |_| None, started, t(4, 12));
        // only the daily source crossed its 2-day threshold
        assert_eq!(ev.len(), 1);
        assert_eq!(ev[0].source_id().as_str(), "brand-new");
        assert!(ev[0].message().contains("trigger=watchdog"));
    }

    #[test]
    fn failures_always_alert_and_message_matches_wording() {
        let policy = AlertPolicy::default();
        let src = weekly();
        let now = t(10, 12);
        let mut r = zero_result(&src, now);
        r.error = Some(RunError::FetchFailed {
            message: "x".repeat(500),
        });
        let st = status_with_non_zero(now);
        let ev = policy.evaluate(&src, &r, Some(&st), t(1, 0), now);
        assert_eq!(ev.len(), 1);
        let msg = ev[0].message();
        assert!(msg.starts_with("ALERT: Sync failed for Branding Journal (days=2, trigger=manual). Error: fetch failed: "));
        assert!(msg.len() < 320);
    }

    #[test]
    fn skipped_lookups_alert_even_when_items_were_added() {
        let policy = AlertPolicy::default();
        let src = daily();
        let now = t(10, 12);
        let mut r = zero_result(&src, now);
        r.items_inserted = 1;
        r.existence_check_failed = 3;
        let ev = policy.evaluate(&src, &r, None, t(1, 0), now);
        assert_eq!(ev.len(), 1);
        assert_eq!(ev[0].kind(), "existence_check_skipped");
        assert!(ev[0].message().starts_with("ALERT: Duplicate check failed for 3 item(s) from "));

        r.existence_check_failed = 0;
        assert!(policy.evaluate(&src, &r, None, t(1, 0), now).is_empty());
    }

    #[test]
    fn cancelled_runs_never_alert() {
        let policy = AlertPolicy::default();
        let src = daily();
        let mut r = zero_result(&src, t(10, 0));
        r.cancelled = true;
        r.error = Some(RunError::FetchFailed { message: "x".into() });
        assert!(policy.evaluate(&src, &r, None, t(1, 0), t(10, 0)).is_empty());
    }
}

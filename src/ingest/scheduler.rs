// src/ingest/scheduler.rs
use anyhow::Result;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, LocalResult, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use metrics::{counter, gauge};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{ScheduleClass, SyncConfig};
use crate::ingest::types::SourceId;
use crate::orchestrator::{Orchestrator, RunOptions, RunTrigger, SourceSelection};

/// Wall-clock cadence in the scheduler's timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Daily { at: NaiveTime },
    Weekly { weekday: Weekday, at: NaiveTime },
}

impl Cadence {
    /// First fire time strictly after `now`.
    ///
    /// A local time that falls in a DST gap fires at the first instant after the gap; one that
    /// occurs twice fires on its first occurrence only.
    pub fn next_fire_after(&self, now: DateTime<Utc>, tz: &Tz) -> DateTime<Utc> {
        let today = now.with_timezone(tz).date_naive();
        for offset in 0..=8 {
            let day = today + ChronoDuration::days(offset);
            let at = match self {
                Cadence::Daily { at } => *at,
                Cadence::Weekly { weekday, at } if day.weekday() == *weekday => *at,
                Cadence::Weekly { .. } => continue,
            };
            if let Some(fire) = resolve_local(tz, day, at) {
                if fire > now {
                    return fire;
                }
            }
        }
        // unreachable for any real zone; keep the loop alive anyway
        now + ChronoDuration::days(1)
    }
}

fn resolve_local(tz: &Tz, day: NaiveDate, at: NaiveTime) -> Option<DateTime<Utc>> {
    let naive = day.and_time(at);
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(t) => Some(t.with_timezone(&Utc)),
        LocalResult::Ambiguous(first, _) => Some(first.with_timezone(&Utc)),
        LocalResult::None => {
            // gap: walk forward minute by minute; no zone skips more than a few hours
            (1..=24 * 60).find_map(|m| {
                tz.from_local_datetime(&(naive + ChronoDuration::minutes(m)))
                    .earliest()
                    .map(|t| t.with_timezone(&Utc))
            })
        }
    }
}

/// One scheduled job: which sources, how far back, and what to call it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    pub name: &'static str,
    pub cadence: Cadence,
    pub sources: Vec<SourceId>,
    pub lookback_days: u32,
    pub run_trigger: RunTrigger,
}

/// Fires triggers and the zero-new watchdog. Owns no sync logic.
#[derive(Debug, Clone)]
pub struct Scheduler {
    pub tz: Tz,
    pub triggers: Vec<Trigger>,
    pub watchdog_every: Duration,
}

impl Scheduler {
    pub fn from_config(cfg: &SyncConfig) -> Result<Self> {
        let tz = cfg.tz()?;
        let by_class = |class: ScheduleClass| -> Vec<SourceId> {
            cfg.sources
                .iter()
                .filter(|s| s.class == class)
                .map(|s| s.id.clone())
                .collect()
        };

        let mut triggers = Vec::new();
        if cfg.schedule.enabled {
            let daily = by_class(ScheduleClass::Daily);
            if !daily.is_empty() {
                triggers.push(Trigger {
                    name: "daily",
                    cadence: Cadence::Daily {
                        at: cfg.schedule.daily_time()?,
                    },
                    sources: daily,
                    lookback_days: cfg.schedule.daily_lookback_days,
                    run_trigger: RunTrigger::ScheduledDaily,
                });
            }
            let weekly = by_class(ScheduleClass::Weekly);
            if !weekly.is_empty() {
                triggers.push(Trigger {
                    name: "weekly",
                    cadence: Cadence::Weekly {
                        weekday: cfg.schedule.weekday()?,
                        at: cfg.schedule.weekly_time()?,
                    },
                    sources: weekly,
                    lookback_days: cfg.schedule.weekly_lookback_days,
                    run_trigger: RunTrigger::ScheduledWeekly,
                });
            }
        }

        Ok(Self {
            tz,
            triggers,
            watchdog_every: Duration::from_secs(cfg.alerts.watchdog_minutes * 60),
        })
    }

    /// One task per trigger plus the watchdog. All of them stop when `cancel` fires.
    pub fn spawn(self, orch: Arc<Orchestrator>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles: Vec<JoinHandle<()>> = self
            .triggers
            .into_iter()
            .map(|t| tokio::spawn(trigger_loop(t, self.tz, orch.clone(), cancel.clone())))
            .collect();
        handles.push(tokio::spawn(watchdog_loop(self.watchdog_every, orch, cancel)));
        handles
    }
}

async fn trigger_loop(trigger: Trigger, tz: Tz, orch: Arc<Orchestrator>, cancel: CancellationToken) {
    loop {
        let now = Utc::now();
        let next = trigger.cadence.next_fire_after(now, &tz);
        tracing::info!(trigger = trigger.name, next_fire = %next, "scheduled");
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }

        let selection = SourceSelection::Only(trigger.sources.clone());
        let opts = RunOptions::scheduled(trigger.run_trigger.clone(), trigger.lookback_days);
        let report = orch.run_many(&selection, &opts, &cancel).await;

        counter!("branding_scheduler_fires_total", "trigger" => trigger.name).increment(1);
        gauge!("branding_scheduler_last_fire_timestamp", "trigger" => trigger.name).set(Utc::now().timestamp() as f64);
        tracing::info!(
            trigger = trigger.name,
            inserted = report.total_inserted,
            failed = report.errors().len(),
            "scheduled run finished"
        );
    }
    tracing::info!(trigger = trigger.name, "scheduler stopped");
}

async fn watchdog_loop(every: Duration, orch: Arc<Orchestrator>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // first tick completes immediately; nothing can be overdue at boot
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let fired = orch.sweep_zero_new(Utc::now()).await;
                if !fired.is_empty() {
                    tracing::info!(alerts = fired.len(), "zero-new watchdog fired");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn daily_fires_today_or_tomorrow() {
        let tz: Tz = "Asia/Tokyo".parse().unwrap();
        let c = Cadence::Daily { at: hm(6, 0) };
        // 20:00 UTC on the 1st is 05:00 JST on the 2nd
        assert_eq!(c.next_fire_after(utc(2025, 3, 1, 20, 0), &tz), utc(2025, 3, 1, 21, 0));
        // exactly at fire time moves to the next day
        assert_eq!(c.next_fire_after(utc(2025, 3, 1, 21, 0), &tz), utc(2025, 3, 2, 21, 0));
    }

    #[test]
    fn weekly_picks_the_configured_weekday() {
        let tz: Tz = "Asia/Tokyo".parse().unwrap();
        let c = Cadence::Weekly {
            weekday: Weekday::Sun,
            at: hm(6, 0),
        };
        // Wed 2025-03-05 noon JST -> Sun 2025-03-09 06:00 JST
        let next = c.next_fire_after(utc(2025, 3, 5, 3, 0), &tz);
        assert_eq!(next, utc(2025, 3, 8, 21, 0));
        assert_eq!(next.with_timezone(&tz).weekday(), Weekday::Sun);
    }

    #[test]
    fn dst_gap_fires_after_the_gap() {
        let tz: Tz = "America/New_York".parse().unwrap();
        // 2025-03-09 02:30 local does not exist; clocks jump 02:00 -> 03:00 EDT (07:00 UTC)
        let c = Cadence::Daily { at: hm(2, 30) };
        assert_eq!(c.next_fire_after(utc(2025, 3, 9, 5, 0), &tz), utc(2025, 3, 9, 7, 0));
    }

    #[test]
    fn dst_overlap_fires_once() {
        let tz: Tz = "America/New_York".parse().unwrap();
        // 2025-11-02 01:30 happens twice: 05:30 UTC (EDT) and 06:30 UTC (EST)
        let c = Cadence::Daily { at: hm(1, 30) };
        let first = c.next_fire_after(utc(2025, 11, 2, 4, 0), &tz);
        assert_eq!(first, utc(2025, 11, 2, 5, 30));
        let second = c.next_fire_after(first, &tz);
        assert_eq!(second, utc(2025, 11, 3, 6, 30));
    }

    #[test]
    fn from_config_splits_sources_by_class() {
        let cfg = SyncConfig::default();
        let s = Scheduler::from_config(&cfg).unwrap();
        assert_eq!(s.triggers.len(), 2);
        assert_eq!(s.triggers[0].sources, vec![SourceId::from("brand-new")]);
        assert_eq!(s.triggers[0].lookback_days, 2);
        assert_eq!(s.triggers[1].sources.len(), 5);
        assert_eq!(s.triggers[1].lookback_days, 8);
        assert_eq!(s.watchdog_every, Duration::from_secs(3600));

        let mut off = SyncConfig::default();
        off.schedule.enabled = false;
        assert!(Scheduler::from_config(&off).unwrap().triggers.is_empty());
    }
}

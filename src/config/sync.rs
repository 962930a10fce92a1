// src/config/sync.rs
use anyhow::{anyhow, bail, Context, Result};
use chrono::{NaiveTime, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::alerts::ZeroNewMode;
use crate::ingest::canonical::{Canonicalizer, DEFAULT_TRACKING_PARAMS, DEFAULT_TRACKING_PREFIXES};
use crate::ingest::types::SourceId;
use crate::retry::RetryPolicy;

pub const ENV_CONFIG_PATH: &str = "SYNC_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "config/sync.toml";

/// Which scheduled trigger a source belongs to; also picks its zero-new threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleClass {
    Daily,
    Weekly,
}

impl ScheduleClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleClass::Daily => "daily",
            ScheduleClass::Weekly => "weekly",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDef {
    pub id: SourceId,
    /// Display name used in messages and reports.
    pub name: String,
    /// "Blog Name" select option in the store.
    pub blog_name: String,
    pub class: ScheduleClass,
    #[serde(default)]
    pub feed_url: Option<String>,
}

impl SourceDef {
    fn new(id: &str, name: &str, blog_name: &str, class: ScheduleClass) -> Self {
        Self {
            id: SourceId::from(id),
            name: name.to_string(),
            blog_name: blog_name.to_string(),
            class,
            feed_url: None,
        }
    }
}

pub fn default_sources() -> Vec<SourceDef> {
    use ScheduleClass::*;
    vec![
        SourceDef::new("brand-new", "Brand New", "underconsideration", Daily),
        SourceDef::new("branding-journal", "Branding Journal", "Branding Journal", Weekly),
        SourceDef::new("branding-mag", "Branding Mag", "Brand Mag", Weekly),
        SourceDef::new("bpando", "BP&O", "Bpando", Weekly),
        SourceDef::new("the-drum", "The Drum", "The Drum", Weekly),
        SourceDef::new("forbes-cmo", "Forbes CMO Network", "Forbes CMO Network", Weekly),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpCfg {
    pub timeout_secs: u64,
    pub retries: u32,
    pub retry_delay_ms: u64,
    pub user_agent: String,
}

impl Default for HttpCfg {
    fn default() -> Self {
        Self {
            timeout_secs: 20,
            retries: 2,
            retry_delay_ms: 2000,
            user_agent: concat!("branding-sync/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl HttpCfg {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            timeout: self.timeout(),
            retries: self.retries,
            base_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsCfg {
    pub zero_new_days_daily: u32,
    pub zero_new_days_weekly: u32,
    pub zero_new_mode: ZeroNewMode,
    pub watchdog_minutes: u64,
}

impl Default for AlertsCfg {
    fn default() -> Self {
        Self {
            zero_new_days_daily: 2,
            zero_new_days_weekly: 14,
            zero_new_mode: ZeroNewMode::Calendar,
            watchdog_minutes: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleCfg {
    pub enabled: bool,
    /// `HH:MM` local time.
    pub daily_at: String,
    pub daily_lookback_days: u32,
    /// `sun`, `Sunday`, ...
    pub weekly_day: String,
    pub weekly_at: String,
    pub weekly_lookback_days: u32,
}

impl Default for ScheduleCfg {
    fn default() -> Self {
        Self {
            enabled: true,
            daily_at: "06:00".into(),
            daily_lookback_days: 2,
            weekly_day: "sun".into(),
            weekly_at: "06:00".into(),
            weekly_lookback_days: 8,
        }
    }
}

impl ScheduleCfg {
    pub fn daily_time(&self) -> Result<NaiveTime> {
        parse_hhmm(&self.daily_at).context("schedule.daily_at")
    }

    pub fn weekly_time(&self) -> Result<NaiveTime> {
        parse_hhmm(&self.weekly_at).context("schedule.weekly_at")
    }

    pub fn weekday(&self) -> Result<Weekday> {
        self.weekly_day
            .trim()
            .parse::<Weekday>()
            .map_err(|_| anyhow!("schedule.weekly_day: unknown weekday `{}`", self.weekly_day))
    }
}

fn parse_hhmm(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").with_context(|| format!("invalid time `{s}`, expected HH:MM"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DigestCfg {
    pub lookback_days: u32,
    pub top_per_source: usize,
}

impl Default for DigestCfg {
    fn default() -> Self {
        Self {
            lookback_days: 7,
            top_per_source: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CanonicalCfg {
    pub tracking_params: Vec<String>,
    pub tracking_prefixes: Vec<String>,
}

impl Default for CanonicalCfg {
    fn default() -> Self {
        Self {
            tracking_params: DEFAULT_TRACKING_PARAMS.iter().map(|s| s.to_string()).collect(),
            tracking_prefixes: DEFAULT_TRACKING_PREFIXES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl CanonicalCfg {
    pub fn canonicalizer(&self) -> Canonicalizer {
        Canonicalizer::new(self.tracking_params.clone(), self.tracking_prefixes.clone())
    }
}

/// Everything the pipeline needs that is not a secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// IANA name, e.g. `Asia/Damascus`.
    pub timezone: String,
    pub http: HttpCfg,
    pub alerts: AlertsCfg,
    pub schedule: ScheduleCfg,
    pub digest: DigestCfg,
    pub canonical: CanonicalCfg,
    pub sources: Vec<SourceDef>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            timezone: "Asia/Damascus".into(),
            http: HttpCfg::default(),
            alerts: AlertsCfg::default(),
            schedule: ScheduleCfg::default(),
            digest: DigestCfg::default(),
            canonical: CanonicalCfg::default(),
            sources: default_sources(),
        }
    }
}

impl SyncConfig {
    /// Parse a TOML file. No env overrides, no validation.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading sync config from {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Resolve using env var + fallbacks, then apply env overrides and validate:
    /// 1) $SYNC_CONFIG_PATH
    /// 2) config/sync.toml
    /// 3) built-in defaults
    pub fn load_default() -> Result<Self> {
        let mut cfg = if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                bail!("{ENV_CONFIG_PATH} points to non-existent path {}", pb.display());
            }
            Self::load_from(&pb)?
        } else {
            let p = PathBuf::from(DEFAULT_CONFIG_PATH);
            if p.exists() {
                Self::load_from(&p)?
            } else {
                Self::default()
            }
        };
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(v) = env_parse::<u32>("ZERO_NEW_ALERT_DAYS_DAILY")? {
            self.alerts.zero_new_days_daily = v;
        }
        if let Some(v) = env_parse::<u32>("ZERO_NEW_ALERT_DAYS_WEEKLY")? {
            self.alerts.zero_new_days_weekly = v;
        }
        if let Some(v) = env_parse::<u64>("HTTP_TIMEOUT_SECONDS")? {
            self.http.timeout_secs = v;
        }
        if let Some(v) = env_parse::<u32>("HTTP_RETRIES")? {
            self.http.retries = v;
        }
        if let Some(v) = env_parse::<u64>("HTTP_RETRY_DELAY_MS")? {
            self.http.retry_delay_ms = v;
        }
        if let Some(v) = env_parse::<u32>("DIGEST_LOOKBACK_DAYS")? {
            self.digest.lookback_days = v;
        }
        if let Some(v) = env_parse::<usize>("DIGEST_TOP_PER_SOURCE")? {
            self.digest.top_per_source = v;
        }
        if let Some(v) = env_nonempty("SYNC_TIMEZONE") {
            self.timezone = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.tz()?;
        if self.alerts.zero_new_days_daily == 0 || self.alerts.zero_new_days_weekly == 0 {
            bail!("zero-new alert thresholds must be at least 1 day");
        }
        if self.http.timeout_secs == 0 {
            bail!("http.timeout_secs must be positive");
        }
        if self.schedule.daily_lookback_days == 0 || self.schedule.weekly_lookback_days == 0 {
            bail!("schedule lookback days must be at least 1");
        }
        if self.alerts.watchdog_minutes == 0 {
            bail!("alerts.watchdog_minutes must be positive");
        }
        self.schedule.daily_time()?;
        self.schedule.weekly_time()?;
        self.schedule.weekday()?;

        let mut ids = HashSet::new();
        for s in &self.sources {
            if s.id.as_str().trim().is_empty() {
                bail!("source with empty id");
            }
            if s.id.as_str() == "all" {
                bail!("`all` is reserved and cannot be a source id");
            }
            if !ids.insert(s.id.clone()) {
                bail!("duplicate source id `{}`", s.id);
            }
        }
        Ok(())
    }

    pub fn tz(&self) -> Result<Tz> {
        self.timezone
            .trim()
            .parse::<Tz>()
            .map_err(|_| anyhow!("unknown timezone `{}`", self.timezone))
    }

    pub fn source(&self, id: &SourceId) -> Option<&SourceDef> {
        self.sources.iter().find(|s| &s.id == id)
    }

    pub fn zero_new_threshold(&self, class: ScheduleClass) -> u32 {
        match class {
            ScheduleClass::Daily => self.alerts.zero_new_days_daily,
            ScheduleClass::Weekly => self.alerts.zero_new_days_weekly,
        }
    }
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match env_nonempty(name) {
        None => Ok(None),
        Some(v) => v
            .parse::<T>()
            .map(Some)
            .map_err(|_| anyhow!("{name}: cannot parse `{v}`")),
    }
}

/// Credentials and endpoints read from the environment (`.env` in dev).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Secrets {
    pub notion_token: Option<String>,
    pub notion_database_id: Option<String>,
    pub telegram_token: Option<String>,
    pub chat_id: Option<String>,
    pub discord_webhook_url: Option<String>,
    pub command_token: Option<String>,
}

impl Secrets {
    pub fn from_env() -> Self {
        Self {
            notion_token: env_nonempty("NOTION_TOKEN"),
            notion_database_id: env_nonempty("NOTION_DATABASE_ID"),
            telegram_token: env_nonempty("TELEGRAM_TOKEN"),
            chat_id: env_nonempty("CHAT_ID"),
            discord_webhook_url: env_nonempty("DISCORD_WEBHOOK_URL"),
            command_token: env_nonempty("COMMAND_TOKEN"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    const OVERRIDES: &[&str] = &[
        "ZERO_NEW_ALERT_DAYS_DAILY",
        "ZERO_NEW_ALERT_DAYS_WEEKLY",
        "HTTP_TIMEOUT_SECONDS",
        "HTTP_RETRIES",
        "HTTP_RETRY_DELAY_MS",
        "DIGEST_LOOKBACK_DAYS",
        "DIGEST_TOP_PER_SOURCE",
        "SYNC_TIMEZONE",
    ];

    fn clear_env() {
        env::remove_var(ENV_CONFIG_PATH);
        for k in OVERRIDES {
            env::remove_var(k);
        }
    }

    #[test]
    fn defaults_mirror_the_deployed_registry() {
        let cfg = SyncConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.sources.len(), 6);
        let daily: Vec<_> = cfg
            .sources
            .iter()
            .filter(|s| s.class == ScheduleClass::Daily)
            .map(|s| s.id.as_str())
            .collect();
        assert_eq!(daily, vec!["brand-new"]);
        assert_eq!(cfg.zero_new_threshold(ScheduleClass::Daily), 2);
        assert_eq!(cfg.zero_new_threshold(ScheduleClass::Weekly), 14);
        assert_eq!(cfg.tz().unwrap(), chrono_tz::Asia::Damascus);
        assert_eq!(cfg.schedule.weekday().unwrap(), Weekday::Sun);
    }

    #[test]
    fn partial_toml_keeps_defaults_for_missing_tables() {
        let cfg = SyncConfig::from_toml_str(
            r#"
            timezone = "Europe/Prague"
            [alerts]
            zero_new_days_weekly = 10
            zero_new_mode = "elapsed"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.timezone, "Europe/Prague");
        assert_eq!(cfg.alerts.zero_new_days_weekly, 10);
        assert_eq!(cfg.alerts.zero_new_days_daily, 2);
        assert_eq!(cfg.alerts.zero_new_mode, ZeroNewMode::Elapsed);
        assert_eq!(cfg.http.timeout_secs, 20);
        assert_eq!(cfg.sources.len(), 6);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut cfg = SyncConfig::default();
        cfg.timezone = "Mars/Olympus".into();
        assert!(cfg.validate().is_err());

        let mut cfg = SyncConfig::default();
        cfg.alerts.zero_new_days_daily = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = SyncConfig::default();
        cfg.schedule.daily_at = "25:99".into();
        assert!(cfg.validate().is_err());

        let mut cfg = SyncConfig::default();
        let dup = cfg.sources[0].clone();
        cfg.sources.push(dup);
        assert!(cfg.validate().is_err());
    }

    #[serial_test::serial]
    #[test]
    fn default_uses_env_then_fallbacks() {
        let old = env::current_dir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        env::set_current_dir(tmp.path()).unwrap();
        clear_env();

        // nothing on disk: built-in defaults
        let cfg = SyncConfig::load_default().unwrap();
        assert_eq!(cfg, SyncConfig::default());

        // config/sync.toml in cwd
        fs::create_dir_all(tmp.path().join("config")).unwrap();
        fs::write(tmp.path().join(DEFAULT_CONFIG_PATH), "timezone = \"UTC\"\n").unwrap();
        assert_eq!(SyncConfig::load_default().unwrap().timezone, "UTC");

        // env path wins
        let p = tmp.path().join("other.toml");
        fs::write(&p, "timezone = \"Asia/Tokyo\"\n").unwrap();
        env::set_var(ENV_CONFIG_PATH, p.display().to_string());
        assert_eq!(SyncConfig::load_default().unwrap().timezone, "Asia/Tokyo");

        // and a dangling env path is an error
        env::set_var(ENV_CONFIG_PATH, tmp.path().join("missing.toml").display().to_string());
        assert!(SyncConfig::load_default().is_err());

        clear_env();
        env::set_current_dir(&old).unwrap();
    }

    #[serial_test::serial]
    #[test]
    fn env_overrides_apply_after_file() {
        clear_env();
        env::set_var("ZERO_NEW_ALERT_DAYS_DAILY", "3");
        env::set_var("HTTP_TIMEOUT_SECONDS", "5");
        env::set_var("SYNC_TIMEZONE", "UTC");
        let mut cfg = SyncConfig::default();
        cfg.apply_env_overrides().unwrap();
        assert_eq!(cfg.alerts.zero_new_days_daily, 3);
        assert_eq!(cfg.http.timeout(), Duration::from_secs(5));
        assert_eq!(cfg.timezone, "UTC");

        env::set_var("HTTP_RETRIES", "many");
        assert!(cfg.apply_env_overrides().is_err());
        clear_env();
    }
}

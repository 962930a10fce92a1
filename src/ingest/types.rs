// src/ingest/types.rs
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::FetchError;
use crate::ingest::canonical::CanonicalKey;

/// Stable slug of a configured source, e.g. `brand-new`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// What an adapter hands back before canonicalization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawArticle {
    pub source_id: SourceId,
    pub title: String,
    pub url: String,
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub body_text: String,
    #[serde(default)]
    pub image_refs: Vec<String>,
}

impl RawArticle {
    pub fn new(source_id: impl Into<SourceId>, title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            title: title.into(),
            url: url.into(),
            published_at: None,
            summary: String::new(),
            body_text: String::new(),
            image_refs: Vec::new(),
        }
    }

    pub fn published(mut self, at: DateTime<Utc>) -> Self {
        self.published_at = Some(at);
        self
    }
}

/// A canonicalized article. Identity is `canonical_url`; everything else is payload.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Article {
    pub source_id: SourceId,
    pub title: String,
    pub raw_url: String,
    pub canonical_url: CanonicalKey,
    pub published_at: Option<DateTime<Utc>>,
    pub summary: String,
    pub body_text: String,
    pub image_refs: Vec<String>,
}

impl Article {
    pub fn from_raw(raw: RawArticle, canonical_url: CanonicalKey) -> Self {
        Self {
            source_id: raw.source_id,
            title: raw.title,
            raw_url: raw.url,
            canonical_url,
            published_at: raw.published_at,
            summary: raw.summary,
            body_text: raw.body_text,
            image_refs: raw.image_refs,
        }
    }

    /// Publication date as `YYYY-MM-DD`, if known.
    pub fn date_string(&self) -> Option<String> {
        self.published_at.map(|d| d.date_naive().format("%Y-%m-%d").to_string())
    }
}

/// Inclusive date window a run asks its adapter for. Bounds are local dates in `tz`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub tz: Tz,
}

impl FetchWindow {
    /// Window ending on `end`, with dates read in UTC.
    pub fn lookback(end: NaiveDate, days: u32) -> Self {
        Self::lookback_in(end, days, chrono_tz::UTC)
    }

    pub fn lookback_in(end: NaiveDate, days: u32, tz: Tz) -> Self {
        let start = end - chrono::Duration::days(i64::from(days));
        Self { start, end, tz }
    }

    /// Undated items are kept; the store check still guards them.
    pub fn contains(&self, at: Option<DateTime<Utc>>) -> bool {
        match at {
            None => true,
            Some(ts) => {
                let d = ts.with_timezone(&self.tz).date_naive();
                d >= self.start && d <= self.end
            }
        }
    }
}

#[async_trait::async_trait]
pub trait SourceAdapter: Send + Sync {
    async fn fetch_recent(&self, window: FetchWindow) -> Result<Vec<RawArticle>, FetchError>;
    fn name(&self) -> &str;
}

//! URL canonicalization: the dedup identity of an article.
//!
//! `canonicalize` is pure and idempotent. Host is lower-cased and loses its `www.` label,
//! the path loses trailing slashes, tracking parameters are removed from the query (the rest
//! keep their order and raw encoding) and the fragment is dropped.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use url::Url;

use crate::error::MalformedUrl;

/// Normalized URL used as dedup identity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalKey(String);

impl CanonicalKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CanonicalKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

pub const DEFAULT_TRACKING_PARAMS: &[&str] = &[
    "ref", "fbclid", "gclid", "yclid", "mc_cid", "mc_eid", "igshid", "utm_id",
];
pub const DEFAULT_TRACKING_PREFIXES: &[&str] = &["utm_"];

/// Canonicalizer with a configurable tracking-parameter denylist.
#[derive(Debug, Clone)]
pub struct Canonicalizer {
    exact: HashSet<String>,
    prefixes: Vec<String>,
}

impl Default for Canonicalizer {
    fn default() -> Self {
        Self::new(
            DEFAULT_TRACKING_PARAMS.iter().map(|s| s.to_string()),
            DEFAULT_TRACKING_PREFIXES.iter().map(|s| s.to_string()),
        )
    }
}

static DEFAULT: Lazy<Canonicalizer> = Lazy::new(Canonicalizer::default);

/// Canonicalize with the default denylist.
pub fn canonicalize(raw_url: &str) -> Result<CanonicalKey, MalformedUrl> {
    DEFAULT.canonicalize(raw_url)
}

impl Canonicalizer {
    pub fn new<I, P>(exact: I, prefixes: P) -> Self
    where
        I: IntoIterator<Item = String>,
        P: IntoIterator<Item = String>,
    {
        Self {
            exact: exact
                .into_iter()
                .map(|k| k.trim().to_ascii_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
            prefixes: prefixes
                .into_iter()
                .map(|k| k.trim().to_ascii_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    pub fn is_tracking_param(&self, key: &str) -> bool {
        let k = key.to_ascii_lowercase();
        self.exact.contains(&k) || self.prefixes.iter().any(|p| k.starts_with(p.as_str()))
    }

    pub fn canonicalize(&self, raw_url: &str) -> Result<CanonicalKey, MalformedUrl> {
        let url = self.normalize(raw_url)?;
        Ok(CanonicalKey(url.to_string()))
    }

    fn normalize(&self, raw_url: &str) -> Result<Url, MalformedUrl> {
        let trimmed = raw_url.trim();
        if trimmed.is_empty() {
            return Err(MalformedUrl::new(raw_url, "empty url"));
        }
        let mut url = Url::parse(trimmed).map_err(|e| MalformedUrl::new(raw_url, e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(MalformedUrl::new(
                raw_url,
                format!("unsupported scheme `{}`", url.scheme()),
            ));
        }

        // 1) + 2) host: lower-case, drop leading `www.` labels (never down to a bare TLD)
        let host = match url.host_str() {
            Some(h) if !h.is_empty() => h.to_ascii_lowercase(),
            _ => return Err(MalformedUrl::new(raw_url, "missing host")),
        };
        let host = strip_www(&host);
        if url.host_str() != Some(host.as_str()) {
            url.set_host(Some(&host))
                .map_err(|e| MalformedUrl::new(raw_url, e.to_string()))?;
        }

        // 3) trailing slash
        let path = url.path().to_string();
        if path != "/" && path.ends_with('/') {
            let stripped = path.trim_end_matches('/');
            url.set_path(if stripped.is_empty() { "/" } else { stripped });
        }

        // 4) + 5) tracking params out, order and raw encoding of the rest preserved
        let query = url.query().map(|q| self.filter_query(q));
        match query {
            Some(q) if !q.is_empty() => url.set_query(Some(&q)),
            _ => url.set_query(None),
        }

        // 6) fragment
        url.set_fragment(None);
        Ok(url)
    }

    fn filter_query(&self, query: &str) -> String {
        query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .filter(|pair| {
                let raw_key = pair.split('=').next().unwrap_or_default();
                let key = url::form_urlencoded::parse(raw_key.as_bytes())
                    .next()
                    .map(|(k, _)| k.into_owned())
                    .unwrap_or_else(|| raw_key.to_string());
                !self.is_tracking_param(&key)
            })
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Candidate spellings a previously stored record may carry for the same article.
    /// The canonical form comes first.
    pub fn lookup_variants(&self, raw_url: &str, key: &CanonicalKey) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let mut push = |s: String| {
            let s = s.trim().to_string();
            if !s.is_empty() && !out.contains(&s) {
                out.push(s);
            }
        };

        push(key.as_str().to_string());
        if let Ok(canon) = Url::parse(key.as_str()) {
            let with_slash = |u: &Url| {
                let mut u = u.clone();
                if u.path() != "/" {
                    let p = format!("{}/", u.path());
                    u.set_path(&p);
                }
                u.to_string()
            };
            push(with_slash(&canon));

            let mut bare = canon.clone();
            bare.set_query(None);
            push(bare.to_string());

            if let Some(host) = canon.host_str() {
                let mut www = canon.clone();
                if www.set_host(Some(&format!("www.{host}"))).is_ok() {
                    push(www.to_string());
                    push(with_slash(&www));
                }
            }
        }
        push(raw_url.to_string());
        push(raw_url.split('#').next().unwrap_or_default().to_string());
        out
    }
}

fn strip_www(host: &str) -> String {
    let mut h = host;
    while let Some(rest) = h.strip_prefix("www.") {
        if !rest.contains('.') {
            break;
        }
        h = rest;
    }
    h.to_string()
}

// src/ingest/mod.rs
pub mod canonical;
pub mod dedup;
pub mod existence;
pub mod providers;
pub mod scheduler;
pub mod types;

use metrics::{describe_counter, describe_histogram};
use once_cell::sync::{Lazy, OnceCell};
use regex::Regex;

/// One-time metrics registration for the feed adapters (so series show up on /metrics).
pub(crate) fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("branding_feed_items_total", "Items parsed from source feeds.");
        describe_counter!("branding_feed_errors_total", "Feed fetch/parse errors.");
        describe_histogram!("branding_feed_parse_ms", "Feed parse time in milliseconds.");
    });
}

static RE_TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)</?[^>]+>").expect("static regex"));
static RE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("static regex"));

const MAX_TEXT_CHARS: usize = 4000;

/// Feed text to plain text: decode entities, strip tags, fold quotes and whitespace, cap length.
pub fn clean_text(s: &str) -> String {
    // 1) entities; twice, feeds often double-encode (`&amp;amp;`)
    let once = html_escape::decode_html_entities(s);
    let mut out = html_escape::decode_html_entities(&once).to_string();

    // 2) tags
    out = RE_TAGS.replace_all(&out, " ").to_string();

    // 3) “ ” ‘ ’ « » to ASCII quotes
    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'")
        .replace('\u{00A0}', " ");

    // 4) whitespace
    out = RE_WS.replace_all(&out, " ").trim().to_string();

    if out.chars().count() > MAX_TEXT_CHARS {
        out = out.chars().take(MAX_TEXT_CHARS).collect();
    }
    out
}

/// Title comparison form: entity-decoded, lower-cased, whitespace folded.
pub fn normalize_title(s: &str) -> String {
    let decoded = html_escape::decode_html_entities(s);
    RE_WS
        .replace_all(decoded.trim(), " ")
        .to_lowercase()
}

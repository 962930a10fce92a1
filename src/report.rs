//! Plain-text, Markdown and CSV renderings for the command surface. No I/O in here.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::config::SourceDef;
use crate::orchestrator::SyncBatchReport;
use crate::status::{SourceStatus, StatusTotals};
use crate::store::StoredRecord;

/// Telegram caps messages at 4096 chars.
pub const CHAT_LIMIT: usize = 3900;
const CHAT_KEEP: usize = 3800;
const TRUNCATED_MARKER: &str = "... output truncated.";

/// Cut to at most `max` chars, ending in `...` when cut.
pub fn cut(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let keep = max.saturating_sub(3);
    let mut out: String = s.chars().take(keep).collect();
    out.push_str("...");
    out
}

pub fn format_human_utc(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M UTC").to_string()
}

/// Fit a message into one chat message, dropping whole lines from the end.
pub fn trim_for_chat(text: &str) -> String {
    if text.chars().count() <= CHAT_LIMIT {
        return text.to_string();
    }
    let mut kept: Vec<&str> = Vec::new();
    let mut used = 0usize;
    for line in text.lines() {
        let len = line.chars().count() + 1;
        if used + len > CHAT_KEEP {
            break;
        }
        used += len;
        kept.push(line);
    }
    kept.push("");
    kept.push(TRUNCATED_MARKER);
    kept.join("\n")
}

/// Reply to a manual sync command.
pub fn sync_reply(report: &SyncBatchReport) -> String {
    let errors = report.errors();
    if !errors.is_empty() {
        let first: Vec<&str> = errors.iter().take(2).map(String::as_str).collect();
        return format!(
            "Finished with errors. Added {} new articles.\nErrors: {}",
            report.total_inserted,
            first.join("; ")
        );
    }
    if report.total_inserted == 0 {
        "No new articles found for this timeframe.".to_string()
    } else {
        format!("Finished. Added {} new articles.", report.total_inserted)
    }
}

pub fn status_report(
    sources: &[SourceDef],
    statuses: &[SourceStatus],
    totals: &StatusTotals,
    started: DateTime<Utc>,
    now: DateTime<Utc>,
) -> String {
    let uptime_h = (now - started).num_hours().max(0);
    let mut lines = vec![
        "Branding Scraper status".to_string(),
        format!("Uptime: {uptime_h}h"),
        format!(
            "Sync runs total={}, success={}, failed={}",
            totals.runs, totals.successes, totals.failures
        ),
        format!("Articles uploaded total={}", totals.inserted),
        String::new(),
    ];
    for def in sources {
        let st = statuses.iter().find(|s| s.source_id == def.id);
        lines.push(format!("{}:", def.name));
        lines.push(format!(
            "  Last success: {}",
            st.and_then(|s| s.last_success_at)
                .map(format_human_utc)
                .unwrap_or_else(|| "Never".to_string())
        ));
        lines.push(format!("  Last added count: {}", st.map(|s| s.last_added_count).unwrap_or(0)));
        if let Some(s) = st.filter(|s| s.last_duplicates_in_store + s.last_existence_check_failed > 0) {
            lines.push(format!(
                "  Last run skipped: {} already stored, {} unverified (duplicate check failed)",
                s.last_duplicates_in_store, s.last_existence_check_failed
            ));
        }
        match st.and_then(|s| s.last_error.as_deref()) {
            Some(err) => {
                lines.push(format!("  Last error: {}", cut(err, 150)));
                if let Some(at) = st.and_then(|s| s.last_error_at) {
                    lines.push(format!("  Last error time: {}", format_human_utc(at)));
                }
            }
            None => lines.push("  Last error: None".to_string()),
        }
    }
    lines.join("\n")
}

pub fn recent_report(records: &[StoredRecord], limit: usize) -> String {
    if records.is_empty() {
        return format!("No entries found in Notion for last {limit} items.");
    }
    let mut lines = vec![format!("Latest {} entries from Notion:", records.len())];
    for (i, r) in records.iter().enumerate() {
        lines.push(format!("{}. {}", i + 1, cut(&r.title, 110)));
        lines.push(format!("   {} | {}", r.source, r.date.as_deref().unwrap_or("-")));
        lines.push(format!("   {}", r.url));
    }
    lines.join("\n")
}

pub fn search_report(term: &str, records: &[StoredRecord]) -> String {
    if records.is_empty() {
        return format!("No matches found for \"{term}\".");
    }
    let mut lines = vec![format!("Search results for \"{term}\" ({} shown):", records.len())];
    for (i, r) in records.iter().enumerate() {
        lines.push(format!("{}. {}", i + 1, cut(&r.title, 100)));
        lines.push(format!("   {} | {}", r.source, r.date.as_deref().unwrap_or("-")));
        lines.push(format!("   {}", r.url));
        lines.push(String::new());
    }
    lines.join("\n").trim_end().to_string()
}

/// Entries grouped by source: registry order first, unknown sources after (by name).
pub fn digest_report(records: &[StoredRecord], sources: &[SourceDef], days: u32, top_per_source: usize) -> String {
    if records.is_empty() {
        return format!("No entries found in Notion for the last {days} days.");
    }
    let mut groups: BTreeMap<&str, Vec<&StoredRecord>> = BTreeMap::new();
    for r in records {
        groups.entry(r.source.as_str()).or_default().push(r);
    }

    let mut lines = vec![
        format!("Weekly digest (last {days} days)"),
        format!("Total new entries: {}", records.len()),
        String::new(),
    ];
    let mut push_group = |name: &str, items: &[&StoredRecord]| {
        lines.push(format!("{name} ({}):", items.len()));
        for (i, r) in items.iter().take(top_per_source).enumerate() {
            lines.push(format!("{}. {}", i + 1, cut(&r.title, 105)));
            lines.push(format!("   {}", r.url));
        }
        lines.push(String::new());
    };
    for def in sources {
        if let Some(items) = groups.remove(def.name.as_str()) {
            push_group(&def.name, &items);
        }
    }
    for (name, items) in groups {
        let name = if name.is_empty() { "Unknown" } else { name };
        push_group(name, &items);
    }
    lines.join("\n").trim_end().to_string()
}

pub fn markdown_export(title: &str, records: &[StoredRecord]) -> String {
    let mut lines = vec![format!("# {title}"), String::new()];
    for (i, r) in records.iter().enumerate() {
        lines.push(format!("{}. [{}]({})", i + 1, r.title.replace(']', "\\]"), r.url));
        lines.push(format!("   - {} | {}", r.source, r.date.as_deref().unwrap_or("-")));
    }
    lines.join("\n")
}

pub fn csv_export(records: &[StoredRecord]) -> String {
    let mut out = String::from("title,source,date,url,created_time\r\n");
    for r in records {
        let row = [
            r.title.as_str(),
            r.source.as_str(),
            r.date.as_deref().unwrap_or_default(),
            r.url.as_str(),
            r.created_time.as_deref().unwrap_or_default(),
        ]
        .map(csv_field)
        .join(",");
        out.push_str(&row);
        out.push_str("\r\n");
    }
    out
}

// RFC 4180: quote when the field holds a comma, quote or line break; double inner quotes.
fn csv_field(s: &str) -> String {
    if s.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

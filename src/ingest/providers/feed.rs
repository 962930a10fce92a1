use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use once_cell::sync::Lazy;
use quick_xml::de::from_str;
use regex::Regex;
use serde::Deserialize;

use crate::error::FetchError;
use crate::ingest::types::{FetchWindow, RawArticle, SourceAdapter, SourceId};
use crate::ingest::{clean_text, ensure_metrics_described};

// ---- RSS 2.0 ----

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}
#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    item: Vec<Item>,
}
#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    description: Option<String>,
    // elements match on local name: `content:encoded` arrives as `encoded`
    #[serde(rename = "encoded")]
    content: Option<String>,
    #[serde(default)]
    enclosure: Vec<Enclosure>,
    #[serde(rename = "content", default)]
    media: Vec<Enclosure>,
}
#[derive(Debug, Deserialize)]
struct Enclosure {
    #[serde(rename = "@url")]
    url: Option<String>,
}

// ---- Atom ----

#[derive(Debug, Deserialize)]
struct AtomFeed {
    #[serde(rename = "entry", default)]
    entry: Vec<AtomEntry>,
}
#[derive(Debug, Deserialize)]
struct AtomEntry {
    title: Option<AtomText>,
    #[serde(default)]
    link: Vec<AtomLink>,
    published: Option<String>,
    updated: Option<String>,
    summary: Option<AtomText>,
    content: Option<AtomText>,
}
#[derive(Debug, Deserialize)]
struct AtomText {
    #[serde(rename = "$text", default)]
    value: String,
}
#[derive(Debug, Deserialize)]
struct AtomLink {
    #[serde(rename = "@href")]
    href: Option<String>,
    #[serde(rename = "@rel")]
    rel: Option<String>,
}

static RE_IMG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?is)<img[^>]+src\s*=\s*["']([^"']+)["']"#).expect("static regex"));
static RE_BLOCK_END: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)</p\s*>|<br\s*/?>|</h[1-6]\s*>|</li\s*>|</blockquote\s*>").expect("static regex"));

/// RSS/Atom feed adapter. One instance per configured source.
pub struct FeedSource {
    source_id: SourceId,
    name: String,
    mode: Mode,
}

enum Mode {
    Fixture(String),
    Http { url: String, client: reqwest::Client },
}

impl FeedSource {
    /// Serve a fixed document; the window still applies.
    pub fn from_fixture(source_id: impl Into<SourceId>, name: impl Into<String>, xml: &str) -> Self {
        Self {
            source_id: source_id.into(),
            name: name.into(),
            mode: Mode::Fixture(xml.to_string()),
        }
    }

    pub fn from_url(
        source_id: impl Into<SourceId>,
        name: impl Into<String>,
        url: impl Into<String>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            name: name.into(),
            mode: Mode::Http {
                url: url.into(),
                client,
            },
        }
    }

    /// Parse a feed document into raw articles, keeping only items inside `window`.
    pub fn parse(&self, xml: &str, window: FetchWindow) -> Result<Vec<RawArticle>, FetchError> {
        ensure_metrics_described();
        let t0 = std::time::Instant::now();
        let xml_clean = scrub_html_entities_for_xml(xml);

        let items = match from_str::<Rss>(&xml_clean) {
            Ok(rss) => rss.channel.item.into_iter().map(|it| self.rss_item(it)).collect::<Vec<_>>(),
            Err(rss_err) => {
                let atom = if xml_clean.contains("<feed") {
                    from_str::<AtomFeed>(&xml_clean).context("parsing Atom")
                } else {
                    Err(anyhow::anyhow!("neither RSS nor Atom: {rss_err}"))
                };
                let atom = atom.with_context(|| format!("{} feed", self.name)).map_err(|e| {
                    counter!("branding_feed_errors_total", "source" => self.source_id.to_string()).increment(1);
                    FetchError::Permanent(e)
                })?;
                atom.entry.into_iter().map(|e| self.atom_entry(e)).collect()
            }
        };

        let out: Vec<RawArticle> = items.into_iter().filter(|a| window.contains(a.published_at)).collect();

        let ms = t0.elapsed().as_secs_f64() * 1_000.0;
        histogram!("branding_feed_parse_ms").record(ms);
        counter!("branding_feed_items_total", "source" => self.source_id.to_string()).increment(out.len() as u64);
        Ok(out)
    }

    fn rss_item(&self, it: Item) -> RawArticle {
        let html = it.content.as_deref().or(it.description.as_deref()).unwrap_or_default();
        let mut images: Vec<String> = it
            .enclosure
            .iter()
            .chain(it.media.iter())
            .filter_map(|e| e.url.clone())
            .collect();
        images.extend(image_refs(html));

        let mut a = RawArticle::new(
            self.source_id.clone(),
            clean_text(it.title.as_deref().unwrap_or_default()),
            it.link.as_deref().unwrap_or_default().trim(),
        );
        a.published_at = it.pub_date.as_deref().and_then(parse_date);
        a.summary = clean_text(it.description.as_deref().unwrap_or_default());
        a.body_text = paragraphs(html).join("\n");
        a.image_refs = dedupe_keep_order(images);
        a
    }

    fn atom_entry(&self, e: AtomEntry) -> RawArticle {
        let link = e
            .link
            .iter()
            .find(|l| l.rel.as_deref().map_or(true, |r| r == "alternate"))
            .or(e.link.first())
            .and_then(|l| l.href.clone())
            .unwrap_or_default();
        let html = e
            .content
            .as_ref()
            .or(e.summary.as_ref())
            .map(|t| t.value.as_str())
            .unwrap_or_default();

        let mut a = RawArticle::new(
            self.source_id.clone(),
            clean_text(e.title.as_ref().map(|t| t.value.as_str()).unwrap_or_default()),
            link.trim(),
        );
        a.published_at = e.published.as_deref().or(e.updated.as_deref()).and_then(parse_date);
        a.summary = clean_text(e.summary.as_ref().map(|t| t.value.as_str()).unwrap_or_default());
        a.body_text = paragraphs(html).join("\n");
        a.image_refs = dedupe_keep_order(image_refs(html));
        a
    }
}

#[async_trait]
impl SourceAdapter for FeedSource {
    async fn fetch_recent(&self, window: FetchWindow) -> Result<Vec<RawArticle>, FetchError> {
        match &self.mode {
            Mode::Fixture(s) => self.parse(s, window),
            Mode::Http { url, client } => {
                let rsp = client
                    .get(url.as_str())
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                    .map_err(|e| {
                        tracing::warn!(error = %e, source = %self.source_id, "feed http error");
                        counter!("branding_feed_errors_total", "source" => self.source_id.to_string()).increment(1);
                        FetchError::from_reqwest(e)
                    })?;
                let body = rsp.text().await.map_err(FetchError::from_reqwest)?;
                self.parse(&body, window)
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// RFC 2822 (RSS) first, then RFC 3339 (Atom).
fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    DateTime::parse_from_rfc2822(s)
        .or_else(|_| DateTime::parse_from_rfc3339(s))
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// Block-level HTML to one cleaned line per paragraph.
fn paragraphs(html: &str) -> Vec<String> {
    RE_BLOCK_END
        .replace_all(html, "\n")
        .split('\n')
        .map(clean_text)
        .filter(|l| !l.is_empty())
        .collect()
}

fn image_refs(html: &str) -> Vec<String> {
    RE_IMG
        .captures_iter(html)
        .filter_map(|c| c.get(1))
        .map(|m| html_escape::decode_html_entities(m.as_str()).trim().to_string())
        .filter(|u| u.starts_with("http://") || u.starts_with("https://"))
        .collect()
}

fn dedupe_keep_order(v: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    v.into_iter().filter(|s| seen.insert(s.clone())).collect()
}

// HTML named entities are not XML; feeds still ship them.
fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", "&#160;")
        .replace("&ndash;", "&#8211;")
        .replace("&mdash;", "&#8212;")
        .replace("&ldquo;", "&#8220;")
        .replace("&rdquo;", "&#8221;")
        .replace("&lsquo;", "&#8216;")
        .replace("&rsquo;", "&#8217;")
        .replace("&hellip;", "&#8230;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    #[test]
    fn dates_parse_in_both_formats() {
        let want = Utc.with_ymd_and_hms(2025, 3, 4, 9, 30, 0).unwrap();
        assert_eq!(parse_date("Tue, 04 Mar 2025 09:30:00 +0000"), Some(want));
        assert_eq!(parse_date("2025-03-04T10:30:00+01:00"), Some(want));
        assert_eq!(parse_date("yesterday"), None);
    }

    #[test]
    fn paragraphs_split_on_block_tags() {
        let html = "<p>First paragraph here.</p><p>Second &amp; last<br/>line</p>";
        assert_eq!(paragraphs(html), vec!["First paragraph here.", "Second & last", "line"]);
    }

    #[test]
    fn atom_feeds_are_understood() {
        let xml = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Example</title>
  <entry>
    <title type="html">Rebrand &amp;amp; more</title>
    <link rel="alternate" href="https://example.com/rebrand/?utm_source=atom"/>
    <published>2025-03-04T10:30:00Z</published>
    <summary type="html">&lt;p&gt;Short &lt;img src="https://cdn.example.com/a.jpg"&gt;&lt;/p&gt;</summary>
  </entry>
</feed>"#;
        let feed = FeedSource::from_fixture("x", "Example", xml);
        let w = FetchWindow::lookback(NaiveDate::from_ymd_opt(2025, 3, 5).unwrap(), 2);
        let items = feed.parse(xml, w).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "Rebrand & more");
        assert_eq!(items[0].url, "https://example.com/rebrand/?utm_source=atom");
        assert_eq!(items[0].image_refs, vec!["https://cdn.example.com/a.jpg".to_string()]);
    }

    #[test]
    fn namespaced_body_and_media_are_read() {
        let xml = r#"<?xml version="1.0"?>
<rss version="2.0" xmlns:content="http://purl.org/rss/1.0/modules/content/" xmlns:media="http://search.yahoo.com/mrss/">
  <channel>
    <item>
      <title>Body test</title>
      <link>https://example.com/body</link>
      <pubDate>Tue, 04 Mar 2025 09:30:00 +0000</pubDate>
      <description>Teaser only.</description>
      <content:encoded><![CDATA[<p>Full body paragraph.</p><p><img src="https://cdn.example.com/inline.png"></p>]]></content:encoded>
      <media:content url="https://cdn.example.com/media.jpg" medium="image" />
    </item>
  </channel>
</rss>"#;
        let feed = FeedSource::from_fixture("x", "Example", xml);
        let w = FetchWindow::lookback(NaiveDate::from_ymd_opt(2025, 3, 5).unwrap(), 2);
        let items = feed.parse(xml, w).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].summary, "Teaser only.");
        assert_eq!(items[0].body_text, "Full body paragraph.");
        assert_eq!(
            items[0].image_refs,
            vec![
                "https://cdn.example.com/media.jpg".to_string(),
                "https://cdn.example.com/inline.png".to_string(),
            ]
        );
    }

    #[test]
    fn garbage_is_a_permanent_error() {
        let feed = FeedSource::from_fixture("x", "Example", "");
        let w = FetchWindow::lookback(NaiveDate::from_ymd_opt(2025, 3, 5).unwrap(), 2);
        let err = feed.parse("<html><body>nope</body></html>", w).unwrap_err();
        assert!(matches!(err, FetchError::Permanent(_)));
    }
}

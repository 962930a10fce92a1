//! Notion database client.
//!
//! Record shape: `Name` (title), `URL` (url), `Status` (select), `Platform` (select),
//! `Date` (date), `Blog Name` (select). Article text goes in as paragraph and image blocks.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use reqwest::Client;
use serde_json::{json, Value};

use super::{StoreClient, StoredRecord, UrlLookup};
use crate::config::{Secrets, SourceDef};
use crate::error::StoreError;
use crate::ingest::types::{Article, SourceId};

const NOTION_API: &str = "https://api.notion.com/v1";
const NOTION_VERSION: &str = "2022-06-28";

const MAX_BLOCKS: usize = 50;
const MAX_BLOCK_CHARS: usize = 2000;
const MIN_PARAGRAPH_CHARS: usize = 20;
const PAGE_SIZE: usize = 100;
const SEARCH_MAX_PAGES: usize = 6;

#[derive(Clone)]
pub struct NotionStore {
    token: String,
    database_id: String,
    client: Client,
    base_url: String,
    timeout: Duration,
    /// source id -> "Blog Name" option
    blog_names: HashMap<SourceId, String>,
    /// "Blog Name" option -> display name
    display_names: HashMap<String, String>,
}

impl NotionStore {
    pub fn new(token: impl Into<String>, database_id: impl Into<String>, client: Client) -> Self {
        Self {
            token: token.into(),
            database_id: database_id.into(),
            client,
            base_url: NOTION_API.to_string(),
            timeout: Duration::from_secs(20),
            blog_names: HashMap::new(),
            display_names: HashMap::new(),
        }
    }

    /// `None` unless both the token and the database id are set.
    pub fn from_secrets(secrets: &Secrets, client: Client) -> Option<Self> {
        match (&secrets.notion_token, &secrets.notion_database_id) {
            (Some(t), Some(db)) => Some(Self::new(t.clone(), db.clone(), client)),
            _ => None,
        }
    }

    pub fn with_sources(mut self, sources: &[SourceDef]) -> Self {
        for s in sources {
            self.blog_names.insert(s.id.clone(), s.blog_name.clone());
            self.display_names.insert(s.blog_name.clone(), s.name.clone());
        }
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, StoreError> {
        let rsp = self
            .client
            .post(format!("{}/{}", self.base_url, path))
            .bearer_auth(&self.token)
            .header("Notion-Version", NOTION_VERSION)
            .timeout(self.timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| match StoreError::from_reqwest(&e) {
                StoreError::Timeout(_) => StoreError::Timeout(self.timeout),
                other => other,
            })?;

        let status = rsp.status();
        if !status.is_success() {
            let text = rsp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| v["message"].as_str().map(str::to_string))
                .unwrap_or(text);
            return Err(StoreError::from_status(status.as_u16(), message));
        }
        rsp.json::<Value>()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))
    }

    async fn query(&self, body: Value) -> Result<Value, StoreError> {
        self.post(&format!("databases/{}/query", self.database_id), &body).await
    }

    fn records(&self, rsp: &Value) -> Vec<StoredRecord> {
        rsp["results"]
            .as_array()
            .map(|pages| pages.iter().map(|p| parse_page(p, &self.display_names)).collect())
            .unwrap_or_default()
    }

    fn properties(&self, article: &Article) -> Value {
        let blog = self
            .blog_names
            .get(&article.source_id)
            .cloned()
            .unwrap_or_else(|| article.source_id.to_string());
        let date = article
            .date_string()
            .unwrap_or_else(|| Utc::now().date_naive().format("%Y-%m-%d").to_string());
        json!({
            "Name": { "title": [ { "text": { "content": truncate(&article.title, MAX_BLOCK_CHARS) } } ] },
            "URL": { "url": article.canonical_url.as_str() },
            "Status": { "select": { "name": "Not Published" } },
            "Platform": { "select": { "name": "Web" } },
            "Date": { "date": { "start": date } },
            "Blog Name": { "select": { "name": blog } },
        })
    }
}

#[async_trait::async_trait]
impl StoreClient for NotionStore {
    async fn find_by_canonical_url(&self, lookup: &UrlLookup) -> Result<Option<StoredRecord>, StoreError> {
        for candidate in &lookup.variants {
            let rsp = self
                .query(json!({
                    "filter": { "property": "URL", "url": { "equals": candidate } },
                    "page_size": 1,
                }))
                .await?;
            if let Some(rec) = self.records(&rsp).into_iter().next() {
                return Ok(Some(rec));
            }
        }
        Ok(None)
    }

    async fn insert(&self, article: &Article) -> Result<StoredRecord, StoreError> {
        let properties = self.properties(article);
        let children = content_blocks(article);
        let parent = json!({ "database_id": self.database_id });

        let mut body = json!({ "parent": parent, "properties": properties });
        if !children.is_empty() {
            body["children"] = Value::Array(children);
        }
        let page = match self.post("pages", &body).await {
            Ok(v) => v,
            // a bad block (odd image url, oversize text) should not lose the record itself
            Err(StoreError::Rejected { status, message }) if body.get("children").is_some() => {
                tracing::warn!(url = %article.canonical_url, status, %message, "notion rejected content blocks; retrying bare");
                if let Some(obj) = body.as_object_mut() {
                    obj.remove("children");
                }
                self.post("pages", &body).await?
            }
            Err(e) => return Err(e),
        };
        Ok(parse_page(&page, &self.display_names))
    }

    async fn recent(&self, limit: usize) -> Result<Vec<StoredRecord>, StoreError> {
        let rsp = self
            .query(json!({
                "page_size": limit.clamp(1, PAGE_SIZE),
                "sorts": [ { "timestamp": "created_time", "direction": "descending" } ],
            }))
            .await?;
        let mut out = self.records(&rsp);
        out.truncate(limit);
        Ok(out)
    }

    async fn published_since(&self, since: NaiveDate, limit: usize) -> Result<Vec<StoredRecord>, StoreError> {
        let rsp = self
            .query(json!({
                "filter": { "property": "Date", "date": { "on_or_after": since.format("%Y-%m-%d").to_string() } },
                "sorts": [ { "property": "Date", "direction": "descending" } ],
                "page_size": PAGE_SIZE,
            }))
            .await?;
        let mut out = self.records(&rsp);
        out.truncate(limit);
        Ok(out)
    }

    async fn search(&self, term: &str, limit: usize) -> Result<Vec<StoredRecord>, StoreError> {
        let mut out = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..SEARCH_MAX_PAGES {
            let mut body = json!({
                "page_size": PAGE_SIZE,
                "sorts": [ { "timestamp": "created_time", "direction": "descending" } ],
            });
            if let Some(c) = &cursor {
                body["start_cursor"] = json!(c);
            }
            let rsp = self.query(body).await?;
            out.extend(self.records(&rsp).into_iter().filter(|r| r.matches(term)));
            if out.len() >= limit {
                break;
            }
            cursor = match (rsp["has_more"].as_bool(), rsp["next_cursor"].as_str()) {
                (Some(true), Some(c)) => Some(c.to_string()),
                _ => break,
            };
        }
        out.truncate(limit);
        Ok(out)
    }

    fn name(&self) -> &'static str {
        "notion"
    }
}

/// Read a Notion page object back into a record. Missing properties degrade, never fail.
pub fn parse_page(page: &Value, display_names: &HashMap<String, String>) -> StoredRecord {
    let props = &page["properties"];
    let title: String = props["Name"]["title"]
        .as_array()
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p["plain_text"].as_str().or_else(|| p["text"]["content"].as_str()))
                .collect()
        })
        .unwrap_or_default();
    let url = props["URL"]["url"]
        .as_str()
        .or_else(|| page["url"].as_str())
        .unwrap_or_default()
        .to_string();
    let blog = props["Blog Name"]["select"]["name"]
        .as_str()
        .or_else(|| props["Blog Name"]["multi_select"][0]["name"].as_str())
        .unwrap_or_default();
    let source = display_names.get(blog).cloned().unwrap_or_else(|| blog.to_string());

    StoredRecord {
        id: page["id"].as_str().unwrap_or_default().to_string(),
        title: if title.trim().is_empty() {
            "Untitled".to_string()
        } else {
            title.trim().to_string()
        },
        url,
        source,
        date: props["Date"]["date"]["start"].as_str().map(str::to_string),
        created_time: page["created_time"].as_str().map(str::to_string),
    }
}

/// Paragraph blocks from the body (summary if there is none), then external images.
pub fn content_blocks(article: &Article) -> Vec<Value> {
    let text = if article.body_text.trim().is_empty() {
        &article.summary
    } else {
        &article.body_text
    };
    let paragraphs = text
        .lines()
        .map(|l| l.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|l| l.chars().count() >= MIN_PARAGRAPH_CHARS)
        .map(|l| paragraph_block(&l));
    let images = article
        .image_refs
        .iter()
        .filter(|u| u.starts_with("https://") || u.starts_with("http://"))
        .map(|u| image_block(u));
    paragraphs.chain(images).take(MAX_BLOCKS).collect()
}

fn paragraph_block(text: &str) -> Value {
    json!({
        "object": "block",
        "type": "paragraph",
        "paragraph": { "rich_text": [ { "type": "text", "text": { "content": truncate(text, MAX_BLOCK_CHARS) } } ] },
    })
}

fn image_block(url: &str) -> Value {
    json!({
        "object": "block",
        "type": "image",
        "image": { "type": "external", "external": { "url": url } },
    })
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

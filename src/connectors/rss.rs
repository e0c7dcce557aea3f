//! RSS/Atom feed connector.
//!
//! Handles both RSS 2.0 (`<item>`) and Atom (`<entry>`) documents with one
//! streaming pass; no DOM is built.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quick_xml::Reader;
use quick_xml::events::Event;
use serde_json::{Value, json};

use super::{Connector, ConnectorError, RawItem, config_str};
use crate::models::ConnectorType;

pub struct RssConnector {
    http: reqwest::Client,
}

impl RssConnector {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Connector for RssConnector {
    fn connector_type(&self) -> ConnectorType {
        ConnectorType::Rss
    }

    fn display_name(&self) -> &'static str {
        "RSS Feed"
    }

    fn description(&self) -> &'static str {
        "Subscribe to any RSS or Atom feed"
    }

    fn config_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["url"],
            "properties": {
                "url": {"type": "string", "format": "uri", "description": "Feed URL"},
                "custom_title": {"type": "string", "description": "Custom name for the feed"}
            }
        })
    }

    async fn fetch(&self, config: &Value) -> Result<Vec<RawItem>, ConnectorError> {
        let url = config_str(config, "url")?;

        let response = self.http.get(url).send().await?.error_for_status()?;
        let body = response.text().await?;

        parse_feed(&body, url)
    }

    async fn validate(&self, config: &Value) -> (bool, String) {
        let url = match config_str(config, "url") {
            Ok(url) => url,
            Err(e) => return (false, e.to_string()),
        };

        match self.http.get(url).send().await {
            Ok(response) if response.status().is_success() => {
                match response.text().await.map(|body| parse_feed(&body, url)) {
                    Ok(Ok(items)) => (true, format!("Feed reachable, {} items", items.len())),
                    Ok(Err(e)) => (false, format!("Feed unparseable: {}", e)),
                    Err(e) => (false, format!("Failed to read feed body: {}", e)),
                }
            },
            Ok(response) => (false, format!("Feed returned HTTP {}", response.status())),
            Err(e) => (false, format!("Feed unreachable: {}", e)),
        }
    }
}

#[derive(Default)]
struct FeedEntry {
    guid: String,
    title: String,
    link: String,
    content: String,
    summary: String,
    author: String,
    published: String,
    updated: String,
}

/// Parse an RSS 2.0 or Atom document into raw items.
fn parse_feed(xml: &str, feed_url: &str) -> Result<Vec<RawItem>, ConnectorError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut items = Vec::new();
    let mut current: Option<FeedEntry> = None;
    let mut in_author = false;
    let mut text_buffer = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                // Local names so that namespaced elements (content:encoded,
                // dc:creator) match too.
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();

                match name.as_str() {
                    "item" | "entry" => current = Some(FeedEntry::default()),
                    "author" if current.is_some() => in_author = true,
                    // Atom links carry the target in the href attribute.
                    "link" if current.is_some() => {
                        for attr in e.attributes().flatten() {
                            if attr.key.as_ref() == b"href" {
                                if let Some(entry) = current.as_mut() {
                                    if entry.link.is_empty() {
                                        entry.link =
                                            String::from_utf8_lossy(&attr.value).to_string();
                                    }
                                }
                            }
                        }
                    },
                    _ => {},
                }
            },
            Ok(Event::Text(e)) => {
                text_buffer = e.unescape().unwrap_or_default().to_string();
            },
            Ok(Event::CData(e)) => {
                text_buffer = String::from_utf8_lossy(&e.into_inner()).to_string();
            },
            Ok(Event::End(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();

                match name.as_str() {
                    "item" | "entry" => {
                        if let Some(entry) = current.take() {
                            if let Some(item) = finish_entry(entry, feed_url) {
                                items.push(item);
                            }
                        }
                    },
                    "author" => in_author = false,
                    _ => {
                        if let Some(entry) = current.as_mut() {
                            match name.as_str() {
                                "guid" | "id" => entry.guid = text_buffer.clone(),
                                "title" => entry.title = text_buffer.clone(),
                                // RSS puts the link in element text.
                                "link" if entry.link.is_empty() => {
                                    entry.link = text_buffer.clone();
                                },
                                "description" | "summary" => entry.summary = text_buffer.clone(),
                                "encoded" | "content" => entry.content = text_buffer.clone(),
                                "creator" => entry.author = text_buffer.clone(),
                                "name" if in_author => entry.author = text_buffer.clone(),
                                "pubDate" | "published" => entry.published = text_buffer.clone(),
                                "updated" | "lastBuildDate" if entry.updated.is_empty() => {
                                    entry.updated = text_buffer.clone();
                                },
                                _ => {},
                            }
                        }
                    },
                }
                text_buffer.clear();
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ConnectorError::Parse(format!("XML error: {}", e))),
            _ => {},
        }
    }

    Ok(items)
}

fn finish_entry(entry: FeedEntry, feed_url: &str) -> Option<RawItem> {
    let title = entry.title.trim().to_string();
    if title.is_empty() {
        return None;
    }

    let url = if entry.link.is_empty() { feed_url.to_string() } else { entry.link.clone() };

    let external_id = if entry.guid.is_empty() { url.clone() } else { entry.guid.clone() };

    let content =
        if entry.content.is_empty() { entry.summary.clone() } else { entry.content.clone() };

    let published_at = parse_feed_date(&entry.published).or_else(|| parse_feed_date(&entry.updated));

    Some(RawItem {
        external_id,
        title,
        content,
        url,
        author: if entry.author.is_empty() { None } else { Some(entry.author) },
        published_at,
        metadata: serde_json::json!({}),
    })
}

/// Feed dates come in RFC 2822 (RSS) or RFC 3339 (Atom).
fn parse_feed_date(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc2822(s)
        .or_else(|_| DateTime::parse_from_rfc3339(s))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

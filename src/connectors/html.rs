//! HTML page connector.
//!
//! Scrapes a listing page with CSS selectors from the channel config. One
//! matched element becomes one raw item.

use async_trait::async_trait;
use scraper::{Html, Selector};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use super::{Connector, ConnectorError, RawItem, config_str};
use crate::models::ConnectorType;

pub struct HtmlConnector {
    http: reqwest::Client,
}

impl HtmlConnector {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Connector for HtmlConnector {
    fn connector_type(&self) -> ConnectorType {
        ConnectorType::Html
    }

    fn display_name(&self) -> &'static str {
        "Website"
    }

    fn description(&self) -> &'static str {
        "Scrape articles from an HTML page using CSS selectors"
    }

    fn config_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["url", "item_selector"],
            "properties": {
                "url": {"type": "string", "format": "uri", "description": "Page URL"},
                "item_selector": {"type": "string", "description": "CSS selector matching one article each"},
                "title_selector": {"type": "string", "description": "Selector for the title within an article (default: first heading)"},
                "link_selector": {"type": "string", "description": "Selector for the article link (default: first anchor)"},
                "content_selector": {"type": "string", "description": "Selector for the teaser/content text"}
            }
        })
    }

    async fn fetch(&self, config: &Value) -> Result<Vec<RawItem>, ConnectorError> {
        let url = config_str(config, "url")?;
        let item_selector = config_str(config, "item_selector")?;
        let title_selector = config.get("title_selector").and_then(Value::as_str);
        let link_selector = config.get("link_selector").and_then(Value::as_str);
        let content_selector = config.get("content_selector").and_then(Value::as_str);

        let response = self.http.get(url).send().await?.error_for_status()?;
        let body = response.text().await?;

        extract_items(
            &body,
            url,
            item_selector,
            title_selector,
            link_selector,
            content_selector,
        )
    }

    async fn validate(&self, config: &Value) -> (bool, String) {
        let url = match config_str(config, "url") {
            Ok(url) => url,
            Err(e) => return (false, e.to_string()),
        };
        let item_selector = match config_str(config, "item_selector") {
            Ok(sel) => sel,
            Err(e) => return (false, e.to_string()),
        };
        if Selector::parse(item_selector).is_err() {
            return (false, format!("Invalid CSS selector: {}", item_selector));
        }

        match self.http.get(url).send().await {
            Ok(response) if response.status().is_success() => {
                let body = match response.text().await {
                    Ok(body) => body,
                    Err(e) => return (false, format!("Failed to read page body: {}", e)),
                };
                let count = count_matches(&body, item_selector);
                if count == 0 {
                    (false, format!("Selector '{}' matched no elements", item_selector))
                } else {
                    (true, format!("Page reachable, selector matched {} elements", count))
                }
            },
            Ok(response) => (false, format!("Page returned HTTP {}", response.status())),
            Err(e) => (false, format!("Page unreachable: {}", e)),
        }
    }
}

// Parsing is synchronous on purpose: scraper's DOM is not Send and must not
// be held across an await point.
fn extract_items(
    body: &str,
    page_url: &str,
    item_selector: &str,
    title_selector: Option<&str>,
    link_selector: Option<&str>,
    content_selector: Option<&str>,
) -> Result<Vec<RawItem>, ConnectorError> {
    let document = Html::parse_document(body);
    let items_sel = Selector::parse(item_selector)
        .map_err(|e| ConnectorError::InvalidConfig(format!("item_selector: {}", e)))?;

    let title_sel = parse_optional_selector(title_selector, "h1, h2, h3, h4")?;
    let link_sel = parse_optional_selector(link_selector, "a")?;
    let content_sel = content_selector
        .map(|sel| {
            Selector::parse(sel)
                .map_err(|e| ConnectorError::InvalidConfig(format!("content_selector: {}", e)))
        })
        .transpose()?;

    let mut items = Vec::new();
    for element in document.select(&items_sel) {
        let title = element
            .select(&title_sel)
            .next()
            .map(|el| el.text().collect::<String>())
            .unwrap_or_default()
            .trim()
            .to_string();
        if title.is_empty() {
            continue;
        }

        let link = element
            .select(&link_sel)
            .next()
            .and_then(|el| el.value().attr("href"))
            .map(|href| resolve_url(page_url, href))
            .unwrap_or_else(|| page_url.to_string());

        let content = match &content_sel {
            Some(sel) => element
                .select(sel)
                .map(|el| el.text().collect::<String>())
                .collect::<Vec<_>>()
                .join("\n"),
            None => element.text().collect::<String>(),
        }
        .trim()
        .to_string();

        // Scraped pages rarely expose stable ids; hash title+link instead.
        let mut hasher = Sha256::new();
        hasher.update(title.as_bytes());
        hasher.update(link.as_bytes());
        let external_id = hex::encode(&hasher.finalize()[..16]);

        items.push(RawItem {
            external_id,
            title,
            content,
            url: link,
            author: None,
            published_at: None,
            metadata: json!({"scraped_from": page_url}),
        });
    }

    Ok(items)
}

fn parse_optional_selector(
    selector: Option<&str>,
    default: &str,
) -> Result<Selector, ConnectorError> {
    let raw = selector.unwrap_or(default);
    Selector::parse(raw)
        .map_err(|e| ConnectorError::InvalidConfig(format!("selector '{}': {}", raw, e)))
}

fn count_matches(body: &str, item_selector: &str) -> usize {
    let document = Html::parse_document(body);
    match Selector::parse(item_selector) {
        Ok(sel) => document.select(&sel).count(),
        Err(_) => 0,
    }
}

fn resolve_url(base: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_string();
    }
    if let Some(rest) = href.strip_prefix('/') {
        // Scheme + authority from the base URL.
        if let Some(scheme_end) = base.find("://") {
            let after_scheme = &base[scheme_end + 3..];
            let authority_end = after_scheme.find('/').unwrap_or(after_scheme.len());
            return format!("{}/{}", &base[..scheme_end + 3 + authority_end], rest);
        }
    }
    format!("{}/{}", base.trim_end_matches('/'), href)
}

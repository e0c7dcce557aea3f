//! Document page connector.
//!
//! Fetches a document URL and yields a single item per fetch. Text is taken
//! from plain-text documents directly; for binary formats the item carries
//! the document metadata and an empty body.
// TODO: integrate a PDF text-extraction library so binary documents get real
// content instead of an empty body.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use super::{Connector, ConnectorError, RawItem, config_str};
use crate::models::ConnectorType;

pub struct PdfConnector {
    http: reqwest::Client,
}

impl PdfConnector {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Connector for PdfConnector {
    fn connector_type(&self) -> ConnectorType {
        ConnectorType::Pdf
    }

    fn display_name(&self) -> &'static str {
        "PDF Document"
    }

    fn description(&self) -> &'static str {
        "Track a document URL and ingest it when its content changes"
    }

    fn config_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["url"],
            "properties": {
                "url": {"type": "string", "format": "uri", "description": "Direct document URL"},
                "title": {"type": "string", "description": "Display title for the document"}
            }
        })
    }

    async fn fetch(&self, config: &Value) -> Result<Vec<RawItem>, ConnectorError> {
        let url = config_str(config, "url")?;
        let title = config
            .get("title")
            .and_then(Value::as_str)
            .map(str::to_string);

        let response = self.http.get(url).send().await?.error_for_status()?;
        let last_modified = response
            .headers()
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
            .map(|dt| dt.with_timezone(&Utc));
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = response.bytes().await?;

        // The document content itself is the identity: a changed revision
        // produces a new external id and therefore a new item.
        let digest = hex::encode(Sha256::digest(&bytes));
        let external_id = format!("{}#{}", url, &digest[..16]);

        let content = if content_type.starts_with("text/") {
            String::from_utf8_lossy(&bytes).to_string()
        } else {
            String::new()
        };

        let title = title.unwrap_or_else(|| {
            url.rsplit('/')
                .next()
                .filter(|s| !s.is_empty())
                .unwrap_or("Document")
                .to_string()
        });

        Ok(vec![RawItem {
            external_id,
            title,
            content,
            url: url.to_string(),
            author: None,
            published_at: last_modified,
            metadata: json!({
                "content_type": content_type,
                "content_length": bytes.len(),
                "digest": digest,
            }),
        }])
    }

    async fn validate(&self, config: &Value) -> (bool, String) {
        let url = match config_str(config, "url") {
            Ok(url) => url,
            Err(e) => return (false, e.to_string()),
        };

        match self.http.head(url).send().await {
            Ok(response) if response.status().is_success() => {
                (true, "Document reachable".to_string())
            },
            Ok(response) => (false, format!("Document returned HTTP {}", response.status())),
            Err(e) => (false, format!("Document unreachable: {}", e)),
        }
    }
}

//! Source connectors.
//!
//! A connector turns a channel's opaque config into a finite list of
//! normalized `RawItem`s. Connectors never touch the store; the pipeline
//! owns persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::models::ConnectorType;

pub mod html;
pub mod pdf;
pub mod rss;

pub use html::HtmlConnector;
pub use pdf::PdfConnector;
pub use rss::RssConnector;

/// Normalized item format returned by all connectors.
///
/// `external_id` must be stable across refetches of the same source item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawItem {
    pub external_id: String,
    pub title: String,
    #[serde(default)]
    pub content: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid connector config: {0}")]
    InvalidConfig(String),

    #[error("Unknown connector: {0}")]
    UnknownConnector(String),
}

/// A source connector.
#[async_trait]
pub trait Connector: Send + Sync {
    fn connector_type(&self) -> ConnectorType;
    fn display_name(&self) -> &'static str;
    fn description(&self) -> &'static str;

    /// JSON-schema-like description of the expected config, used by the
    /// admin surface for form generation. The core never looks inside.
    fn config_schema(&self) -> Value;

    /// Fetch items from the configured source.
    async fn fetch(&self, config: &Value) -> Result<Vec<RawItem>, ConnectorError>;

    /// Cheap reachability + schema check. Returns (ok, message).
    async fn validate(&self, config: &Value) -> (bool, String);
}

/// Connector metadata for registry listings.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectorInfo {
    #[serde(rename = "type")]
    pub connector_type: ConnectorType,
    pub name: &'static str,
    pub description: &'static str,
    pub config_schema: Value,
}

/// Process-wide connector registry.
///
/// Registration is idempotent: re-registering a type replaces the prior
/// entry.
pub struct ConnectorRegistry {
    connectors: DashMap<ConnectorType, Arc<dyn Connector>>,
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self { connectors: DashMap::new() }
    }

    /// Registry pre-populated with the built-in connectors.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        let http = default_http_client();
        registry.register(Arc::new(RssConnector::new(http.clone())));
        registry.register(Arc::new(HtmlConnector::new(http.clone())));
        registry.register(Arc::new(PdfConnector::new(http)));
        registry
    }

    pub fn register(&self, connector: Arc<dyn Connector>) {
        self.connectors.insert(connector.connector_type(), connector);
    }

    pub fn get(&self, connector_type: ConnectorType) -> Option<Arc<dyn Connector>> {
        self.connectors.get(&connector_type).map(|entry| Arc::clone(entry.value()))
    }

    pub fn is_registered(&self, connector_type: ConnectorType) -> bool {
        self.connectors.contains_key(&connector_type)
    }

    pub fn list(&self) -> Vec<ConnectorInfo> {
        let mut infos: Vec<ConnectorInfo> = self
            .connectors
            .iter()
            .map(|entry| ConnectorInfo {
                connector_type: entry.value().connector_type(),
                name: entry.value().display_name(),
                description: entry.value().description(),
                config_schema: entry.value().config_schema(),
            })
            .collect();
        infos.sort_by_key(|info| info.connector_type.as_str());
        infos
    }
}

/// Shared HTTP client for connectors: short total timeout, redirects allowed.
pub fn default_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .user_agent("NewsAggregator/1.0")
        .build()
        .unwrap_or_default()
}

/// Read a required string field from a connector config.
pub(crate) fn config_str<'a>(config: &'a Value, key: &str) -> Result<&'a str, ConnectorError> {
    config
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ConnectorError::InvalidConfig(format!("missing '{}'", key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_registration_is_idempotent() {
        let registry = ConnectorRegistry::new();
        let http = default_http_client();
        registry.register(Arc::new(RssConnector::new(http.clone())));
        registry.register(Arc::new(RssConnector::new(http)));

        assert!(registry.is_registered(ConnectorType::Rss));
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn test_defaults_cover_builtin_types() {
        let registry = ConnectorRegistry::with_defaults();
        assert!(registry.is_registered(ConnectorType::Rss));
        assert!(registry.is_registered(ConnectorType::Html));
        assert!(registry.is_registered(ConnectorType::Pdf));
        assert!(!registry.is_registered(ConnectorType::Telegram));
    }
}

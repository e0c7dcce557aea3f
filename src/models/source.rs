//! Sources and channels.
//!
//! A Source is an organization we track (e.g. a ministry or association).
//! Each Source owns one or more Channels, each of which is a concrete feed
//! (RSS URL, scraped page, social profile) fetched on its own interval.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

/// Available connector types (closed set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ConnectorType {
    Rss,
    Html,
    Pdf,
    Bluesky,
    Twitter,
    Mastodon,
    Linkedin,
    XScraper,
    Instagram,
    InstagramScraper,
    Telegram,
    GoogleAlerts,
}

impl ConnectorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rss => "rss",
            Self::Html => "html",
            Self::Pdf => "pdf",
            Self::Bluesky => "bluesky",
            Self::Twitter => "twitter",
            Self::Mastodon => "mastodon",
            Self::Linkedin => "linkedin",
            Self::XScraper => "x_scraper",
            Self::Instagram => "instagram",
            Self::InstagramScraper => "instagram_scraper",
            Self::Telegram => "telegram",
            Self::GoogleAlerts => "google_alerts",
        }
    }

    pub fn parse_type(s: &str) -> Option<Self> {
        match s {
            "rss" => Some(Self::Rss),
            "html" => Some(Self::Html),
            "pdf" => Some(Self::Pdf),
            "bluesky" => Some(Self::Bluesky),
            "twitter" => Some(Self::Twitter),
            "mastodon" => Some(Self::Mastodon),
            "linkedin" => Some(Self::Linkedin),
            "x_scraper" => Some(Self::XScraper),
            "instagram" => Some(Self::Instagram),
            "instagram_scraper" => Some(Self::InstagramScraper),
            "telegram" => Some(Self::Telegram),
            "google_alerts" => Some(Self::GoogleAlerts),
            _ => None,
        }
    }
}

/// An organization or entity we track. Owns a set of channels.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Source {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    /// Stakeholder sources are never filtered out by relevance.
    pub is_stakeholder: bool,
    /// Master toggle for all channels of this source.
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A specific feed/channel for a source.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Channel {
    pub id: i64,
    pub source_id: i64,
    pub name: Option<String>,
    pub connector_type: ConnectorType,
    /// Connector-specific configuration, persisted verbatim.
    #[sqlx(json)]
    pub config: Value,
    /// Unique identifier derived from the config (see `extract_identifier`).
    pub source_identifier: Option<String>,
    pub enabled: bool,
    pub fetch_interval_minutes: i64,
    pub last_fetch_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Channel {
    /// Extract the unique identifier from a config based on connector type.
    ///
    /// Used for the `(source_id, connector_type, source_identifier)` unique
    /// constraint so the same feed cannot be added twice to a source.
    pub fn extract_identifier(connector_type: ConnectorType, config: &Value) -> Option<String> {
        let get = |key: &str| {
            config
                .get(key)
                .and_then(Value::as_str)
                .map(|s| s.to_lowercase())
                .filter(|s| !s.is_empty())
        };

        match connector_type {
            ConnectorType::XScraper
            | ConnectorType::Twitter
            | ConnectorType::Instagram
            | ConnectorType::InstagramScraper => get("username"),
            ConnectorType::Mastodon | ConnectorType::Bluesky => get("handle"),
            ConnectorType::Rss
            | ConnectorType::Html
            | ConnectorType::Pdf
            | ConnectorType::GoogleAlerts => get("url"),
            ConnectorType::Telegram => get("channel"),
            ConnectorType::Linkedin => {
                let url = get("profile_url")?;
                for marker in ["/company/", "/in/"] {
                    if let Some(pos) = url.find(marker) {
                        let rest = &url[pos + marker.len()..];
                        let slug = rest.split('/').next().unwrap_or(rest);
                        if !slug.is_empty() {
                            return Some(slug.to_string());
                        }
                    }
                }
                Some(url)
            },
        }
    }

    pub fn display_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        match self.connector_type {
            ConnectorType::Rss => "RSS Feed",
            ConnectorType::Html => "Website",
            ConnectorType::Pdf => "PDF",
            ConnectorType::Bluesky => "Bluesky",
            ConnectorType::Twitter => "Twitter",
            ConnectorType::Mastodon => "Mastodon",
            ConnectorType::Linkedin => "LinkedIn",
            ConnectorType::XScraper => "X.com",
            ConnectorType::Instagram | ConnectorType::InstagramScraper => "Instagram",
            ConnectorType::Telegram => "Telegram",
            ConnectorType::GoogleAlerts => "Google Alerts",
        }
        .to_string()
    }
}

/// Channel joined with the enablement state of its parent source.
#[derive(Debug, Clone, FromRow)]
pub struct ChannelWithSource {
    #[sqlx(flatten)]
    pub channel: Channel,
    pub source_name: String,
    pub source_enabled: bool,
    pub source_is_stakeholder: bool,
}

impl ChannelWithSource {
    /// True iff both the channel and its parent source are enabled.
    pub fn is_effectively_enabled(&self) -> bool {
        self.channel.enabled && self.source_enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_identifier_by_type() {
        let id = Channel::extract_identifier(ConnectorType::Rss, &json!({"url": "https://Example.org/Feed.xml"}));
        assert_eq!(id.as_deref(), Some("https://example.org/feed.xml"));

        let id = Channel::extract_identifier(ConnectorType::XScraper, &json!({"username": "BMAS_Bund"}));
        assert_eq!(id.as_deref(), Some("bmas_bund"));

        let id = Channel::extract_identifier(ConnectorType::Telegram, &json!({"channel": "NewsDE"}));
        assert_eq!(id.as_deref(), Some("newsde"));

        assert_eq!(Channel::extract_identifier(ConnectorType::Rss, &json!({})), None);
    }

    #[test]
    fn test_extract_identifier_linkedin_profiles() {
        let id = Channel::extract_identifier(
            ConnectorType::Linkedin,
            &json!({"profile_url": "https://linkedin.com/company/Microsoft/about"}),
        );
        assert_eq!(id.as_deref(), Some("microsoft"));

        let id = Channel::extract_identifier(
            ConnectorType::Linkedin,
            &json!({"profile_url": "https://linkedin.com/in/satya-nadella"}),
        );
        assert_eq!(id.as_deref(), Some("satya-nadella"));
    }

    #[test]
    fn test_connector_type_roundtrip() {
        for ty in [
            ConnectorType::Rss,
            ConnectorType::XScraper,
            ConnectorType::GoogleAlerts,
        ] {
            assert_eq!(ConnectorType::parse_type(ty.as_str()), Some(ty));
        }
        assert_eq!(ConnectorType::parse_type("carrier_pigeon"), None);
    }
}

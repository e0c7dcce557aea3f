//! Items and their typed processing metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::FromRow;

/// Item priority levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
    /// Not relevant.
    None,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::None => "none",
        }
    }

    pub fn parse_priority(s: &str) -> Option<Self> {
        match s {
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}

/// LLM-processing urgency hint derived from classifier confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPriority {
    High,
    EdgeCase,
    Low,
}

impl RetryPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::EdgeCase => "edge_case",
            Self::Low => "low",
        }
    }
}

/// Classifier output block, stored under `metadata.pre_filter`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreFilter {
    pub relevance_confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority_suggestion: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority_confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ak_suggestion: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ak_confidence: Option<f64>,
    pub classified_at: DateTime<Utc>,
}

/// LLM output block, stored under `metadata.llm_analysis`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmAnalysis {
    pub relevance_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority_suggestion: Option<String>,
    #[serde(default)]
    pub assigned_aks: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    pub processed_at: DateTime<Utc>,
    /// Always `llm_worker` for worker-produced analyses.
    pub source: String,
}

/// Typed view of the `items.metadata` JSON column.
///
/// Classifier-owned fields and LLM-owned fields are disjoint; each worker
/// reads the current value and overlays only its own subtree before writing.
/// Unknown keys survive round trips through `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_filter: Option<PreFilter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_priority: Option<RetryPriority>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate_checked: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate_checked_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vectordb_indexed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vectordb_indexed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_analysis: Option<LlmAnalysis>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ItemMetadata {
    pub fn to_json_string(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// A fetched news item.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Item {
    pub id: i64,
    pub channel_id: Option<i64>,
    pub external_id: String,
    pub title: String,
    pub content: String,
    pub summary: Option<String>,
    pub detailed_analysis: Option<String>,
    pub url: String,
    pub author: Option<String>,
    pub published_at: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
    pub content_hash: String,
    pub priority: Priority,
    pub priority_score: i64,
    pub is_read: bool,
    pub is_starred: bool,
    pub is_archived: bool,
    pub is_manually_reviewed: bool,
    pub reviewed_at: Option<DateTime<Utc>>,
    #[sqlx(json)]
    pub assigned_aks: Vec<String>,
    pub notes: Option<String>,
    #[sqlx(json)]
    pub metadata: ItemMetadata,
    /// True while the item still needs (re)processing by the LLM worker.
    pub needs_llm_processing: bool,
    /// Points to the cluster primary when this item is a near-duplicate.
    /// Always a strictly smaller id, so the relation forms a forest.
    pub similar_to_id: Option<i64>,
}

// Item event types (audit trail).
pub const EVENT_FETCHED: &str = "fetched";
pub const EVENT_CLASSIFIER_PROCESSED: &str = "classifier_processed";
pub const EVENT_LLM_PROCESSED: &str = "llm_processed";
pub const EVENT_REPROCESSED: &str = "reprocessed";
pub const EVENT_ARCHIVED: &str = "archived";

/// Append-only audit record for an item.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ItemEvent {
    pub id: i64,
    pub item_id: i64,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub session_id: Option<String>,
    /// JSON payload as stored; parse on demand via `data_json`.
    pub data: Option<String>,
}

impl ItemEvent {
    pub fn data_json(&self) -> Option<Value> {
        self.data.as_deref().and_then(|raw| serde_json::from_str(raw).ok())
    }
}

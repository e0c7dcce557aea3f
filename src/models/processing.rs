//! Processing-step analytics records.
//!
//! One row per pipeline/worker step. All steps belonging to one ingestion run
//! share a `processing_run_id`, which makes it possible to reconstruct how an
//! item ended up with its current priority and classification.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Processing step types for analytics logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ProcessingStepType {
    Fetch,
    PreFilter,
    DuplicateCheck,
    RuleMatch,
    ClassifierOverride,
    LlmAnalysis,
    Reprocess,
}

impl ProcessingStepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::PreFilter => "pre_filter",
            Self::DuplicateCheck => "duplicate_check",
            Self::RuleMatch => "rule_match",
            Self::ClassifierOverride => "classifier_override",
            Self::LlmAnalysis => "llm_analysis",
            Self::Reprocess => "reprocess",
        }
    }
}

/// Processing step log row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ItemProcessingLog {
    pub id: i64,
    pub item_id: Option<i64>,
    pub processing_run_id: String,
    pub step_type: ProcessingStepType,
    pub step_order: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub model_name: Option<String>,
    pub model_version: Option<String>,
    pub model_provider: Option<String>,
    pub confidence_score: Option<f64>,
    pub priority_input: Option<String>,
    pub priority_output: Option<String>,
    pub priority_changed: bool,
    /// JSON list of suggested working-group codes, as stored.
    pub ak_suggestions: Option<String>,
    pub ak_primary: Option<String>,
    pub ak_confidence: Option<f64>,
    pub relevant: Option<bool>,
    pub relevance_score: Option<f64>,
    pub success: bool,
    pub skipped: bool,
    pub skip_reason: Option<String>,
    pub error_message: Option<String>,
    /// Full input blob (JSON text).
    pub input_data: Option<String>,
    /// Full output blob (JSON text).
    pub output_data: Option<String>,
    pub created_at: DateTime<Utc>,
}

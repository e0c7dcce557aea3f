//! Priority rules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::Priority;

/// Rule matching types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum RuleType {
    Keyword,
    Regex,
    /// LLM-evaluated yes/no question.
    Semantic,
}

/// A filtering/priority rule applied by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Rule {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub rule_type: RuleType,
    /// Keyword, regex pattern, or semantic question depending on `rule_type`.
    pub pattern: String,
    /// Additive score adjustment when the rule matches.
    pub priority_boost: i64,
    pub target_priority: Option<Priority>,
    pub enabled: bool,
    pub sort_order: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Junction record for items matched by rules.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ItemRuleMatch {
    pub id: i64,
    pub item_id: i64,
    pub rule_id: i64,
    pub matched_at: DateTime<Utc>,
    /// JSON details as stored.
    pub match_details: Option<String>,
}

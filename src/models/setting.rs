//! Runtime settings stored in the database.
//!
//! Settings override environment defaults without a restart (e.g. toggling
//! LLM processing off while the GPU host is under maintenance).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

// Well-known setting keys.
pub const SETTING_LLM_ENABLED: &str = "llm_enabled";
pub const SETTING_WORKER_POLL_INTERVAL: &str = "worker_poll_interval";
pub const SETTING_DUPLICATE_CHECK_DAYS: &str = "duplicate_check_days";
pub const SETTING_HOUSEKEEPING_RETENTION_DAYS: &str = "housekeeping_retention_days";

/// Key/JSON-value application setting.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Setting {
    pub key: String,
    #[sqlx(json)]
    pub value: Value,
    pub description: Option<String>,
    pub updated_at: DateTime<Utc>,
}

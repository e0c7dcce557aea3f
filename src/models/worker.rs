//! Worker coordination rows and stats blobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Well-known worker names used across state/stats/command rows.
pub const WORKER_SCHEDULER: &str = "scheduler";
pub const WORKER_CLASSIFIER: &str = "classifier";
pub const WORKER_LLM: &str = "llm";

/// Commands the admin surface can issue to a leader worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerAction {
    Pause,
    Resume,
    Stop,
}

impl WorkerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Stop => "stop",
        }
    }

    pub fn parse_action(s: &str) -> Option<Self> {
        match s {
            "pause" => Some(Self::Pause),
            "resume" => Some(Self::Resume),
            "stop" => Some(Self::Stop),
            _ => None,
        }
    }
}

/// Leader-written worker state, readable by every process.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkerState {
    pub worker: String,
    pub running: bool,
    pub paused: bool,
    pub stopped_due_to_errors: bool,
    pub updated_at: DateTime<Utc>,
}

/// Counters maintained by the LLM worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmWorkerStats {
    pub fresh_processed: u64,
    pub backlog_processed: u64,
    pub errors: u64,
    /// Total seconds spent in LLM calls.
    pub total_processing_time: f64,
    /// Number of items with timing data.
    pub items_timed: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub last_processed_at: Option<DateTime<Utc>>,
}

/// Counters maintained by the classifier worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassifierWorkerStats {
    pub processed: u64,
    pub priority_changed: u64,
    pub duplicates_found: u64,
    pub duplicates_checked: u64,
    pub vectordb_indexed: u64,
    pub errors: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub last_processed_at: Option<DateTime<Utc>>,
}

/// Counters maintained by the fetch scheduler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub fetches_completed: u64,
    pub fetch_errors: u64,
    pub items_inserted: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
}

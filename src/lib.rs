//! News aggregator core library.
//!
//! Continuous news ingestion and triage: connectors pull raw items per
//! channel, the pipeline normalizes and classifies them, and two background
//! workers (classifier, LLM) enrich them through the shared item store.

use sqlx::SqlitePool;
use std::sync::Arc;

pub mod config;
pub mod connectors;
pub mod db;
pub mod handlers;
pub mod leader;
pub mod models;
pub mod services;
pub mod store;
pub mod utils;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use config::Config;
pub use connectors::{Connector, ConnectorRegistry, RawItem};
pub use services::{
    Classifier, ClassifierWorker, FetchScheduler, GpuPowerManager, HttpClassifier,
    IngestPipeline, ItemProcessor, LlmService, LlmWorker, WorkerStatusRepository,
};

/// Application shared state
///
/// Design Philosophy: Keep it simple - Rust's type system IS our DI container.
/// All services are wrapped in Arc for cheap cloning and thread safety.
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub is_leader: bool,

    pub registry: Arc<ConnectorRegistry>,
    pub scheduler: Arc<FetchScheduler>,
    pub worker_status: Arc<WorkerStatusRepository>,
    pub gpu_power: Option<Arc<GpuPowerManager>>,
    /// Provider chain, shared with the LLM worker; the status surface probes
    /// it for health reporting.
    pub llm: Arc<LlmService>,
    /// Producer side of the fresh queue, for admin-triggered reprocessing.
    pub fresh_tx: tokio::sync::mpsc::Sender<i64>,
}

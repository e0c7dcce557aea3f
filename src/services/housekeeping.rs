//! Housekeeping task.
//!
//! Daily retention pass: prunes old audit events and processing logs, and
//! archives long-irrelevant items so feed queries stay small. Retention
//! windows come from config with runtime-setting overrides.

use chrono::{Duration as ChronoDuration, Utc};
use sqlx::SqlitePool;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::processing_logger::prune_logs_before;
use crate::config::HousekeepingConfig;
use crate::models::SETTING_HOUSEKEEPING_RETENTION_DAYS;
use crate::store::{EventRepository, ItemRepository, SettingsRepository};
use crate::utils::scheduled_executor::{ScheduledExecutor, ScheduledTask};

pub struct HousekeepingTask {
    pool: SqlitePool,
    items: ItemRepository,
    events: EventRepository,
    settings: SettingsRepository,
    config: HousekeepingConfig,
    shutdown: Arc<AtomicBool>,
}

impl HousekeepingTask {
    pub fn new(pool: SqlitePool, config: HousekeepingConfig) -> Self {
        Self {
            items: ItemRepository::new(pool.clone()),
            events: EventRepository::new(pool.clone()),
            settings: SettingsRepository::new(pool.clone()),
            pool,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    async fn execute(&self) -> Result<(), anyhow::Error> {
        let retention_days = self
            .settings
            .get_i64(SETTING_HOUSEKEEPING_RETENTION_DAYS, self.config.retention_days)
            .await
            .unwrap_or(self.config.retention_days);

        let log_cutoff = Utc::now() - ChronoDuration::days(retention_days);
        let pruned_events = self.events.prune_before(log_cutoff).await?;
        let pruned_logs = prune_logs_before(&self.pool, log_cutoff).await?;

        let archive_cutoff = Utc::now() - ChronoDuration::days(self.config.archive_none_after_days);
        let archived = self.items.archive_stale_irrelevant(archive_cutoff).await?;

        tracing::info!(
            "Housekeeping: pruned {} events, {} processing logs, archived {} items",
            pruned_events,
            pruned_logs,
            archived
        );

        Ok(())
    }
}

impl ScheduledTask for HousekeepingTask {
    fn run(&self) -> Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send + '_>> {
        Box::pin(async move { self.execute().await })
    }

    fn should_terminate(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

/// Create and start the housekeeping task. Returns the shutdown handle.
pub fn start_housekeeping_task(
    pool: SqlitePool,
    config: HousekeepingConfig,
) -> Arc<AtomicBool> {
    let interval = Duration::from_secs(config.interval_secs);
    let task = HousekeepingTask::new(pool, config);
    let shutdown_handle = task.shutdown_handle();

    let executor = ScheduledExecutor::new("housekeeping", interval);
    tokio::spawn(async move {
        executor.start(task).await;
    });

    tracing::info!("Housekeeping task started with interval: {:?}", interval);

    shutdown_handle
}

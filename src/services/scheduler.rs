//! Fetch scheduler.
//!
//! Periodically invokes connectors for channels whose interval has elapsed,
//! plus on-demand fetches from the admin surface. Fetches run concurrently
//! under a fixed parallelism cap; a per-channel in-flight set guarantees two
//! fetches never overlap on the same channel.

use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use sqlx::SqlitePool;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::sleep;

use super::pipeline::IngestPipeline;
use super::processing_logger::ProcessingLogger;
use super::worker_status::WorkerStatusRepository;
use crate::connectors::{ConnectorError, ConnectorRegistry};
use crate::models::{ProcessingStepType, SchedulerStats, WORKER_SCHEDULER, WorkerAction};
use crate::store::{ChannelRepository, StoreError};
use crate::utils::scheduled_executor::{ScheduledExecutor, ScheduledTask};

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Channel {0} not found")]
    ChannelNotFound(i64),

    #[error("Channel {0} is disabled")]
    ChannelDisabled(i64),

    #[error("Fetch already in progress for channel {0}")]
    AlreadyFetching(i64),

    #[error(transparent)]
    Connector(#[from] ConnectorError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct FetchScheduler {
    pool: SqlitePool,
    channels: ChannelRepository,
    registry: Arc<ConnectorRegistry>,
    pipeline: Arc<IngestPipeline>,
    status: WorkerStatusRepository,
    semaphore: Arc<Semaphore>,
    in_flight: DashMap<i64, ()>,
    poll_default_secs: u64,

    running: AtomicBool,
    paused: AtomicBool,
    shutdown: Arc<AtomicBool>,
    stats: Mutex<SchedulerStats>,
}

impl FetchScheduler {
    pub fn new(
        pool: SqlitePool,
        registry: Arc<ConnectorRegistry>,
        pipeline: Arc<IngestPipeline>,
        max_parallel_fetches: usize,
        poll_default_secs: u64,
    ) -> Self {
        Self {
            channels: ChannelRepository::new(pool.clone()),
            status: WorkerStatusRepository::new(pool.clone()),
            pool,
            registry,
            pipeline,
            semaphore: Arc::new(Semaphore::new(max_parallel_fetches)),
            in_flight: DashMap::new(),
            poll_default_secs,
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            shutdown: Arc::new(AtomicBool::new(false)),
            stats: Mutex::new(SchedulerStats::default()),
        }
    }

    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub async fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        let _ = self.status.write_state(WORKER_SCHEDULER, true, true, false).await;
        tracing::info!("Scheduler paused");
    }

    pub async fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        let _ = self.status.write_state(WORKER_SCHEDULER, true, false, false).await;
        tracing::info!("Scheduler resumed");
    }

    pub async fn request_stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.status.write_state(WORKER_SCHEDULER, false, false, false).await;
        tracing::info!("Scheduler stopped");
    }

    /// One scheduler tick: fetch every due channel, bounded by the
    /// parallelism cap. Per-channel failures never propagate to siblings.
    async fn execute(self: Arc<Self>) -> Result<(), anyhow::Error> {
        if self.paused.load(Ordering::SeqCst) {
            return Ok(());
        }

        let due = self.channels.due_channels(Utc::now()).await?;
        if due.is_empty() {
            self.stats.lock().await.last_tick_at = Some(Utc::now());
            return Ok(());
        }

        tracing::debug!("Scheduler tick: {} channels due", due.len());

        let mut join_set = JoinSet::new();
        for channel in due {
            // Effectively-enabled filtering happens in the query; re-check
            // cheaply in case the flags changed since.
            if !channel.is_effectively_enabled() {
                continue;
            }
            let scheduler = Arc::clone(&self);
            let channel_id = channel.channel.id;
            join_set.spawn(async move {
                if let Err(e) = scheduler.fetch_channel(channel_id).await {
                    match e {
                        FetchError::AlreadyFetching(_) | FetchError::ChannelDisabled(_) => {
                            tracing::debug!("Skipping channel {}: {}", channel_id, e);
                        },
                        _ => tracing::warn!("Fetch failed for channel {}: {}", channel_id, e),
                    }
                }
            });
        }

        while join_set.join_next().await.is_some() {}

        self.stats.lock().await.last_tick_at = Some(Utc::now());
        Ok(())
    }

    /// Fetch one channel now. Shared by the periodic tick and the admin
    /// fetch-now endpoint. Returns the number of newly inserted items.
    pub async fn fetch_channel(&self, channel_id: i64) -> Result<usize, FetchError> {
        let channel = self
            .channels
            .get_with_source(channel_id)
            .await?
            .ok_or(FetchError::ChannelNotFound(channel_id))?;

        if !channel.is_effectively_enabled() {
            return Err(FetchError::ChannelDisabled(channel_id));
        }

        // Per-channel serialization: a second fetch while one is running is
        // a skip, not a queue.
        if self.in_flight.insert(channel_id, ()).is_some() {
            return Err(FetchError::AlreadyFetching(channel_id));
        }
        let result = self.fetch_channel_locked(&channel).await;
        self.in_flight.remove(&channel_id);
        result
    }

    async fn fetch_channel_locked(
        &self,
        channel: &crate::models::ChannelWithSource,
    ) -> Result<usize, FetchError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("scheduler semaphore closed");

        let channel_id = channel.channel.id;
        let plogger = ProcessingLogger::new(self.pool.clone());
        let started = Instant::now();

        let connector = match self.registry.get(channel.channel.connector_type) {
            Some(connector) => connector,
            None => {
                let error = ConnectorError::UnknownConnector(
                    channel.channel.connector_type.as_str().to_string(),
                );
                self.channels.record_fetch_result(channel_id, Some(&error.to_string())).await?;
                let _ = plogger
                    .step(ProcessingStepType::Fetch)
                    .failed(&error.to_string())
                    .input(json!({"channel_id": channel_id}))
                    .save()
                    .await;
                return Err(error.into());
            },
        };

        tracing::debug!(
            "Fetching channel {} ({})",
            channel_id,
            channel.channel.display_name()
        );

        let raw_items = match connector.fetch(&channel.channel.config).await {
            Ok(items) => items,
            Err(e) => {
                // Transport errors are per-channel: store the error, stamp
                // the attempt, and leave the siblings alone.
                self.channels.record_fetch_result(channel_id, Some(&e.to_string())).await?;
                self.stats.lock().await.fetch_errors += 1;
                let _ = plogger
                    .step(ProcessingStepType::Fetch)
                    .duration_ms(started.elapsed().as_millis() as i64)
                    .failed(&e.to_string())
                    .input(json!({"channel_id": channel_id}))
                    .save()
                    .await;
                tracing::warn!("Channel {} fetch failed: {}", channel_id, e);
                return Err(e.into());
            },
        };

        let fetched = raw_items.len();
        let inserted = self.pipeline.ingest(channel, raw_items).await?;

        self.channels.record_fetch_result(channel_id, None).await?;
        {
            let mut stats = self.stats.lock().await;
            stats.fetches_completed += 1;
            stats.items_inserted += inserted as u64;
        }

        let _ = plogger
            .step(ProcessingStepType::Fetch)
            .duration_ms(started.elapsed().as_millis() as i64)
            .input(json!({"channel_id": channel_id}))
            .output(json!({"fetched": fetched, "inserted": inserted}))
            .save()
            .await;

        if inserted > 0 {
            tracing::info!(
                "Channel {} ({}): {} fetched, {} new",
                channel_id,
                channel.channel.display_name(),
                fetched,
                inserted
            );
        }

        Ok(inserted)
    }

    async fn poll_commands(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            let interval = self.status.poll_interval_secs(self.poll_default_secs).await;
            sleep(Duration::from_secs(interval)).await;

            match self.status.read_and_clear_command(WORKER_SCHEDULER).await {
                Ok(Some(WorkerAction::Pause)) => self.pause().await,
                Ok(Some(WorkerAction::Resume)) => self.resume().await,
                Ok(Some(WorkerAction::Stop)) => self.request_stop().await,
                Ok(None) => {},
                Err(e) => {
                    tracing::warn!("Scheduler command poll error: {}", e);
                    sleep(Duration::from_secs(10)).await;
                },
            }
        }
    }

    async fn sync_stats(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            let interval = self.status.poll_interval_secs(self.poll_default_secs).await;
            sleep(Duration::from_secs(interval)).await;

            let stats = self.stats.lock().await.clone();
            if let Err(e) = self.status.write_stats(WORKER_SCHEDULER, &stats).await {
                tracing::warn!("Scheduler stats sync error: {}", e);
                sleep(Duration::from_secs(10)).await;
            }
        }
    }
}

/// Wrapper so the executor drives an Arc'd scheduler.
struct SchedulerTask(Arc<FetchScheduler>);

impl ScheduledTask for SchedulerTask {
    fn run(&self) -> Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send + '_>> {
        let scheduler = Arc::clone(&self.0);
        Box::pin(async move { scheduler.execute().await })
    }

    fn should_terminate(&self) -> bool {
        self.0.shutdown.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Factory Function
// ============================================================================

/// Start the fetch scheduler under the scheduled executor, together with its
/// command poller and stats syncer.
pub fn start_fetch_scheduler(scheduler: Arc<FetchScheduler>, tick_secs: u64) {
    scheduler.running.store(true, Ordering::SeqCst);
    scheduler.shutdown.store(false, Ordering::SeqCst);

    {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move {
            let _ = scheduler.status.write_state(WORKER_SCHEDULER, true, false, false).await;
            let executor =
                ScheduledExecutor::new("fetch-scheduler", Duration::from_secs(tick_secs));
            executor.start(SchedulerTask(Arc::clone(&scheduler))).await;
        });
    }
    {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.poll_commands().await });
    }
    {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.sync_stats().await });
    }

    tracing::info!("Fetch scheduler started (tick: {}s)", tick_secs);
}

//! LLM processing worker with a two-level priority queue.
//!
//! Fresh items (pushed by the pipeline right after intake) always preempt the
//! DB-backed backlog: the loop drains the fresh queue first, and backlog
//! processing re-checks the queue between items. Items are committed one by
//! one so counters and the admin surface reflect progress in real time.
//!
//! The worker is the only caller of the GPU power manager: it wakes the host
//! when work arrives and lets it shut down again once everything is idle.

use chrono::Utc;
use serde_json::json;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc};
use tokio::time::sleep;

use super::gpu_power::{EnsureOutcome, GpuPowerManager};
use super::processing_logger::ProcessingLogger;
use super::processor::{ItemProcessor, map_llm_priority};
use super::worker_status::WorkerStatusRepository;
use crate::config::LlmConfig;
use crate::models::{
    EVENT_LLM_PROCESSED, LlmAnalysis, LlmWorkerStats, ProcessingStepType, Rule, RuleType,
    SETTING_LLM_ENABLED, WORKER_LLM, WorkerAction,
};
use crate::store::{EventRepository, ItemRepository, ItemWithContext, RuleRepository,
    SettingsRepository};

const ERROR_BACKOFF: Duration = Duration::from_secs(5);

pub struct LlmWorker {
    pool: SqlitePool,
    items: ItemRepository,
    events: EventRepository,
    rules: RuleRepository,
    settings: SettingsRepository,
    status: WorkerStatusRepository,
    processor: ItemProcessor,
    power: Option<Arc<GpuPowerManager>>,
    config: LlmConfig,
    poll_default_secs: u64,

    fresh_rx: Mutex<mpsc::Receiver<i64>>,
    fresh_tx: mpsc::Sender<i64>,

    running: AtomicBool,
    paused: AtomicBool,
    stop_requested: AtomicBool,
    stats: Mutex<LlmWorkerStats>,
}

impl LlmWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: SqlitePool,
        processor: ItemProcessor,
        power: Option<Arc<GpuPowerManager>>,
        fresh_tx: mpsc::Sender<i64>,
        fresh_rx: mpsc::Receiver<i64>,
        config: LlmConfig,
        poll_default_secs: u64,
    ) -> Self {
        Self {
            items: ItemRepository::new(pool.clone()),
            events: EventRepository::new(pool.clone()),
            rules: RuleRepository::new(pool.clone()),
            settings: SettingsRepository::new(pool.clone()),
            status: WorkerStatusRepository::new(pool.clone()),
            pool,
            processor,
            power,
            config,
            poll_default_secs,
            fresh_rx: Mutex::new(fresh_rx),
            fresh_tx,
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            stats: Mutex::new(LlmWorkerStats::default()),
        }
    }

    /// Start the worker loop plus its command poller and stats syncer.
    pub fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("LLM worker already running");
            return;
        }
        self.stop_requested.store(false, Ordering::SeqCst);

        {
            let worker = Arc::clone(&self);
            tokio::spawn(async move {
                worker.stats.lock().await.started_at = Some(Utc::now());
                let _ = worker.status.write_state(WORKER_LLM, true, false, false).await;
                worker.run().await;
            });
        }
        {
            let worker = Arc::clone(&self);
            tokio::spawn(async move { worker.poll_commands().await });
        }
        {
            let worker = Arc::clone(&self);
            tokio::spawn(async move { worker.sync_stats().await });
        }

        tracing::info!("LLM worker started");
    }

    pub async fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.status.write_state(WORKER_LLM, false, false, false).await;
        let stats = self.stats.lock().await.clone();
        let _ = self.status.write_stats(WORKER_LLM, &stats).await;
        tracing::info!("LLM worker stopped");
    }

    pub async fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        let _ = self.status.write_state(WORKER_LLM, true, true, false).await;
        tracing::info!("LLM worker paused");
    }

    pub async fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        let _ = self.status.write_state(WORKER_LLM, true, false, false).await;
        tracing::info!("LLM worker resumed");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn stats_snapshot(&self) -> LlmWorkerStats {
        self.stats.lock().await.clone()
    }

    async fn run(self: Arc<Self>) {
        tracing::info!("LLM worker loop started");

        while self.running.load(Ordering::SeqCst) {
            if self.paused.load(Ordering::SeqCst) {
                sleep(Duration::from_secs(1)).await;
                continue;
            }

            if !self.llm_enabled().await {
                tracing::debug!("LLM processing disabled, sleeping");
                sleep(Duration::from_secs(self.config.idle_sleep_secs)).await;
                continue;
            }

            // Priority 1: fresh items.
            match self.process_fresh_batch().await {
                Ok(n) if n > 0 => {
                    self.record_gpu_activity().await;
                    // Check for more fresh items immediately.
                    continue;
                },
                Ok(_) => {},
                Err(e) => {
                    tracing::error!("LLM worker error on fresh batch: {}", e);
                    self.stats.lock().await.errors += 1;
                    sleep(ERROR_BACKOFF).await;
                    continue;
                },
            }

            // Priority 2: backlog.
            match self.process_backlog_batch().await {
                Ok(n) if n > 0 => {
                    self.record_gpu_activity().await;
                    // Re-check the fresh queue before continuing the backlog.
                    continue;
                },
                Ok(_) => {},
                Err(e) => {
                    tracing::error!("LLM worker error on backlog batch: {}", e);
                    self.stats.lock().await.errors += 1;
                    sleep(ERROR_BACKOFF).await;
                    continue;
                },
            }

            // No work: the GPU host may go back to sleep.
            self.check_gpu_idle_shutdown().await;

            tracing::debug!("No items to process, sleeping {}s", self.config.idle_sleep_secs);
            sleep(Duration::from_secs(self.config.idle_sleep_secs)).await;
        }

        tracing::info!("LLM worker loop ended");
    }

    /// Runtime DB setting overrides the configured default.
    async fn llm_enabled(&self) -> bool {
        self.settings
            .get_bool(SETTING_LLM_ENABLED, self.config.enabled)
            .await
            .unwrap_or(self.config.enabled)
    }

    async fn fresh_queue_nonempty(&self) -> bool {
        !self.fresh_rx.lock().await.is_empty()
    }

    /// Drain up to batch_size ids from the fresh queue without blocking.
    async fn drain_fresh(&self) -> Vec<i64> {
        let mut rx = self.fresh_rx.lock().await;
        let mut ids = Vec::new();
        while ids.len() < self.config.batch_size {
            match rx.try_recv() {
                Ok(id) => ids.push(id),
                Err(_) => break,
            }
        }
        ids
    }

    pub(crate) async fn process_fresh_batch(&self) -> Result<u64, anyhow::Error> {
        let ids = self.drain_fresh().await;
        if ids.is_empty() {
            return Ok(0);
        }

        tracing::info!("Processing {} fresh items", ids.len());

        if !self.ensure_gpu_available().await {
            // Put them back; the next cycle (or the backlog scan) retries.
            for id in ids {
                if self.fresh_tx.try_send(id).is_err() {
                    tracing::warn!("Fresh queue full on re-enqueue, item {} left to the backlog", id);
                }
            }
            tracing::warn!("LLM host unavailable, re-enqueued fresh items");
            sleep(ERROR_BACKOFF).await;
            return Ok(0);
        }

        let processed = self.process_items(&ids, true).await?;
        self.stats.lock().await.fresh_processed += processed;
        Ok(processed)
    }

    pub(crate) async fn process_backlog_batch(&self) -> Result<u64, anyhow::Error> {
        let ids = self.items.backlog_ids(self.config.backlog_batch_size).await?;
        if ids.is_empty() {
            return Ok(0);
        }

        tracing::info!("Processing {} backlog items", ids.len());

        if !self.ensure_gpu_available().await {
            sleep(ERROR_BACKOFF).await;
            return Ok(0);
        }

        let processed = self.process_items(&ids, false).await?;
        self.stats.lock().await.backlog_processed += processed;
        Ok(processed)
    }

    /// Process a batch, committing per item. Fresh items interrupt backlog
    /// processing between items, never mid-item.
    pub(crate) async fn process_items(&self, ids: &[i64], is_fresh: bool) -> Result<u64, anyhow::Error> {
        let item_tag = if is_fresh { "fresh" } else { "backlog" };
        let semantic_rules: Vec<Rule> = self
            .rules
            .enabled_rules()
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|r| r.rule_type == RuleType::Semantic)
            .collect();

        let mut processed = 0u64;

        for &item_id in ids {
            if !is_fresh && self.fresh_queue_nonempty().await {
                tracing::info!("Fresh items arrived, pausing backlog after {} items", processed);
                break;
            }

            if self.paused.load(Ordering::SeqCst) {
                tracing::info!("Worker paused, stopping after {} items", processed);
                break;
            }
            if self.stop_requested.load(Ordering::SeqCst) {
                break;
            }

            match self.process_one(item_id, item_tag, &semantic_rules).await {
                Ok(true) => {
                    processed += 1;
                    self.stats.lock().await.last_processed_at = Some(Utc::now());
                },
                Ok(false) => {},
                Err(e) => {
                    tracing::warn!("Failed to process {} item {}: {}", item_tag, item_id, e);
                    self.stats.lock().await.errors += 1;
                },
            }
        }

        Ok(processed)
    }

    /// Returns Ok(true) if the item was analyzed and committed, Ok(false) if
    /// it was skipped.
    async fn process_one(
        &self,
        item_id: i64,
        item_tag: &str,
        semantic_rules: &[Rule],
    ) -> Result<bool, anyhow::Error> {
        let Some(entry) = self.items.get_with_context(item_id).await? else {
            tracing::warn!("Item {} not found", item_id);
            return Ok(false);
        };
        let ItemWithContext { item, source_name, .. } = entry;

        // The classifier must run first; unclassified items wait for it.
        if item.metadata.pre_filter.is_none() {
            tracing::debug!("Item {} lacks a pre-filter, leaving it to the classifier", item_id);
            return Ok(false);
        }

        // Already processed by a competing path (or deselected since the
        // query ran): only relevant items still missing a working group get
        // a second pass.
        let needs_ak = item.priority != crate::models::Priority::None
            && item.assigned_aks.is_empty();
        if !item.needs_llm_processing && !needs_ak {
            return Ok(false);
        }

        let source_name = source_name.unwrap_or_else(|| "Unbekannt".to_string());

        let started = Instant::now();
        let analysis = self.processor.analyze(&item, &source_name).await?;
        let elapsed = started.elapsed();

        {
            let mut stats = self.stats.lock().await;
            stats.total_processing_time += elapsed.as_secs_f64();
            stats.items_timed += 1;
        }

        // Semantic rules ride on the same provider handle, serialized with
        // the analyses.
        let mut rule_boost: i64 = 0;
        for rule in semantic_rules {
            if self.processor.check_semantic_rule(&item, rule).await {
                rule_boost += rule.priority_boost;
                let _ = self.rules.record_match(item.id, rule.id, None).await;
            }
        }

        let llm_priority = analysis.priority.as_deref();
        let (priority, mut priority_score) =
            map_llm_priority(llm_priority, analysis.relevant, item.priority_score);
        if priority != crate::models::Priority::None && rule_boost != 0 {
            priority_score = (priority_score + rule_boost).clamp(0, 100);
        }

        // LLM assignment wins; the classifier's single suggestion is the
        // fallback when the LLM returned none.
        let assigned_aks = if !analysis.assigned_aks.is_empty() {
            analysis.assigned_aks.clone()
        } else if item.assigned_aks.is_empty() {
            item.metadata
                .pre_filter
                .as_ref()
                .and_then(|pf| pf.ak_suggestion.clone())
                .map(|ak| vec![ak])
                .unwrap_or_default()
        } else {
            item.assigned_aks.clone()
        };

        // Overlay only our subtree on the *current* metadata; the classifier
        // worker may have written its fields while the LLM call ran.
        let mut metadata = match self.items.get(item.id).await? {
            Some(current) => current.metadata,
            None => item.metadata.clone(),
        };
        let effective_priority = if analysis.relevant == Some(false) {
            None
        } else {
            analysis.priority.clone()
        };
        metadata.llm_analysis = Some(LlmAnalysis {
            relevance_score: analysis.relevance_score,
            priority_suggestion: effective_priority.clone(),
            assigned_aks: assigned_aks.clone(),
            tags: analysis.tags.clone(),
            reasoning: analysis.reasoning.clone(),
            processed_at: Utc::now(),
            source: "llm_worker".to_string(),
        });

        // Commit per item so counts update in real time.
        self.items
            .apply_llm_analysis(
                item.id,
                analysis.summary.as_deref(),
                analysis.detailed_analysis.as_deref(),
                priority,
                priority_score,
                &assigned_aks,
                &metadata,
            )
            .await?;

        if let Err(e) = self
            .events
            .record(
                item.id,
                EVENT_LLM_PROCESSED,
                Some(&json!({
                    "priority": effective_priority,
                    "assigned_aks": assigned_aks,
                    "relevance_score": analysis.relevance_score,
                    "source": item_tag,
                })),
            )
            .await
        {
            tracing::warn!("Failed to record LLM event for item {}: {}", item.id, e);
        }

        let priority_input = item
            .metadata
            .pre_filter
            .as_ref()
            .and_then(|pf| pf.priority_suggestion.clone());
        let (provider, model) = self.processor.llm().primary_info();
        let plogger = ProcessingLogger::new(self.pool.clone());
        if let Err(e) = plogger
            .step(ProcessingStepType::LlmAnalysis)
            .item(item.id)
            .duration_ms(elapsed.as_millis() as i64)
            .model(&model, provider)
            .priorities(priority_input.as_deref(), effective_priority.as_deref())
            .aks(&assigned_aks, None)
            .relevance(analysis.relevant, Some(analysis.relevance_score))
            .output(json!({
                "summary_len": analysis.summary.as_ref().map(|s| s.len()).unwrap_or(0),
                "tags": analysis.tags,
            }))
            .save()
            .await
        {
            tracing::warn!("Failed to log LLM analysis for item {}: {}", item.id, e);
        }

        tracing::info!(
            "LLM {}: {}... -> {:?}",
            item_tag,
            truncate(&item.title, 40),
            effective_priority
        );

        Ok(true)
    }

    // ------------------------------------------------------------------
    // GPU power integration
    // ------------------------------------------------------------------

    async fn ensure_gpu_available(&self) -> bool {
        let Some(power) = &self.power else {
            return true;
        };
        match power.ensure_available().await {
            EnsureOutcome::Ready => true,
            EnsureOutcome::DeniedOutsideHours => {
                tracing::info!("GPU host outside active hours, items remain queued");
                false
            },
            EnsureOutcome::WakeFailed => {
                tracing::warn!("Failed to wake GPU host, retrying next cycle");
                false
            },
        }
    }

    async fn record_gpu_activity(&self) {
        if let Some(power) = &self.power {
            power.record_activity().await;
        }
    }

    async fn check_gpu_idle_shutdown(&self) {
        if let Some(power) = &self.power
            && power.shutdown_if_idle().await
        {
            tracing::info!("GPU host shut down after idle timeout");
        }
    }

    // ------------------------------------------------------------------
    // Command polling and stats sync
    // ------------------------------------------------------------------

    async fn poll_commands(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            let interval = self.status.poll_interval_secs(self.poll_default_secs).await;
            sleep(Duration::from_secs(interval)).await;

            match self.status.read_and_clear_command(WORKER_LLM).await {
                Ok(Some(WorkerAction::Pause)) => self.pause().await,
                Ok(Some(WorkerAction::Resume)) => self.resume().await,
                Ok(Some(WorkerAction::Stop)) => self.stop().await,
                Ok(None) => {},
                Err(e) => {
                    tracing::warn!("LLM command poll error: {}", e);
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
            if let Err(e) = self.status.write_stats(WORKER_LLM, &stats).await {
                tracing::warn!("LLM stats sync error: {}", e);
                sleep(Duration::from_secs(10)).await;
            }
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

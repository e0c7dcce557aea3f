//! Classifier background worker.
//!
//! Catches up on everything the synchronous intake path could not do while
//! the classifier service was down: classification, vector indexing, and
//! duplicate re-checks. Indexing runs before the duplicate re-check so items
//! from the same intake window are mutually findable.

use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use serde_json::json;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;

use super::classifier::{Classifier, IndexDocument};
use super::pipeline::strip_boilerplate;
use super::processing_logger::ProcessingLogger;
use super::worker_status::WorkerStatusRepository;
use crate::config::{ClassifierConfig, WorkersConfig};
use crate::models::{
    ClassifierWorkerStats, EVENT_CLASSIFIER_PROCESSED, PreFilter, Priority, ProcessingStepType,
    RetryPriority, WORKER_CLASSIFIER, WorkerAction,
};
use crate::store::{EventRepository, ItemRepository};

// Priority thresholds based on classifier confidence.
pub const CONFIDENCE_HIGH: f64 = 0.5; // conf >= 0.5: likely relevant
pub const CONFIDENCE_EDGE: f64 = 0.25; // 0.25 <= conf < 0.5: edge case, needs LLM
// conf < 0.25: certainly irrelevant, skip LLM

const MAX_CONSECUTIVE_ERRORS: u32 = 10;

/// Map classifier confidence to (priority, score, skip_llm).
pub fn determine_priority(confidence: f64) -> (Priority, i64, bool) {
    if confidence >= CONFIDENCE_HIGH {
        // Likely relevant - let the LLM confirm.
        (Priority::Medium, 70, false)
    } else if confidence >= CONFIDENCE_EDGE {
        // Edge case - let the LLM decide.
        (Priority::Low, 55, false)
    } else {
        // Certainly irrelevant - skip the LLM.
        (Priority::None, 20, true)
    }
}

/// LLM-urgency hint derived from classifier confidence.
pub fn retry_priority_for(confidence: f64) -> RetryPriority {
    if confidence >= CONFIDENCE_HIGH {
        RetryPriority::High
    } else if confidence >= CONFIDENCE_EDGE {
        RetryPriority::EdgeCase
    } else {
        RetryPriority::Low
    }
}

pub struct ClassifierWorker {
    items: ItemRepository,
    events: EventRepository,
    status: WorkerStatusRepository,
    classifier: Arc<dyn Classifier>,
    config: ClassifierConfig,
    poll_default_secs: u64,
    pool: SqlitePool,

    running: AtomicBool,
    paused: AtomicBool,
    stop_requested: AtomicBool,
    stopped_due_to_errors: AtomicBool,
    stats: Mutex<ClassifierWorkerStats>,
    last_sync_check: Mutex<Option<NaiveDate>>,
}

impl ClassifierWorker {
    pub fn new(
        pool: SqlitePool,
        classifier: Arc<dyn Classifier>,
        config: ClassifierConfig,
        workers: &WorkersConfig,
    ) -> Self {
        Self {
            items: ItemRepository::new(pool.clone()),
            events: EventRepository::new(pool.clone()),
            status: WorkerStatusRepository::new(pool.clone()),
            classifier,
            config,
            poll_default_secs: workers.poll_interval_secs,
            pool,
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            stopped_due_to_errors: AtomicBool::new(false),
            stats: Mutex::new(ClassifierWorkerStats::default()),
            last_sync_check: Mutex::new(None),
        }
    }

    /// Start the worker loop plus its command poller and stats syncer.
    pub fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("Classifier worker already running");
            return;
        }
        self.stopped_due_to_errors.store(false, Ordering::SeqCst);
        self.stop_requested.store(false, Ordering::SeqCst);

        {
            let worker = Arc::clone(&self);
            tokio::spawn(async move {
                worker.stats.lock().await.started_at = Some(Utc::now());
                let _ = worker.status.write_state(WORKER_CLASSIFIER, true, false, false).await;
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

        tracing::info!("Classifier worker started");
    }

    pub async fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self
            .status
            .write_state(
                WORKER_CLASSIFIER,
                false,
                false,
                self.stopped_due_to_errors.load(Ordering::SeqCst),
            )
            .await;
        let stats = self.stats.lock().await.clone();
        let _ = self.status.write_stats(WORKER_CLASSIFIER, &stats).await;
        tracing::info!("Classifier worker stopped");
    }

    pub async fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        let _ = self.status.write_state(WORKER_CLASSIFIER, true, true, false).await;
        tracing::info!("Classifier worker paused");
    }

    pub async fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        let _ = self.status.write_state(WORKER_CLASSIFIER, true, false, false).await;
        tracing::info!("Classifier worker resumed");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn run(self: Arc<Self>) {
        tracing::info!("Classifier worker loop started");
        let mut consecutive_errors: u32 = 0;

        while self.running.load(Ordering::SeqCst) {
            if self.paused.load(Ordering::SeqCst) {
                sleep(Duration::from_secs(1)).await;
                continue;
            }

            match self.tick().await {
                Ok(processed) if processed > 0 => {
                    consecutive_errors = 0;
                    // More work may be waiting.
                    sleep(Duration::from_millis(500)).await;
                },
                Ok(_) => {
                    self.maybe_run_sync_check().await;
                    tracing::debug!(
                        "No unclassified, unindexed, or unchecked items, sleeping {}s",
                        self.config.idle_sleep_secs
                    );
                    sleep(Duration::from_secs(self.config.idle_sleep_secs)).await;
                },
                Err(e) => {
                    consecutive_errors += 1;
                    tracing::error!(
                        "Classifier worker error ({}/{}): {}",
                        consecutive_errors,
                        MAX_CONSECUTIVE_ERRORS,
                        e
                    );
                    self.stats.lock().await.errors += 1;

                    if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        tracing::error!(
                            "Classifier worker exceeded {} consecutive errors, stopping. Manual restart required.",
                            MAX_CONSECUTIVE_ERRORS
                        );
                        self.stopped_due_to_errors.store(true, Ordering::SeqCst);
                        self.running.store(false, Ordering::SeqCst);
                        let _ = self
                            .status
                            .write_state(WORKER_CLASSIFIER, false, false, true)
                            .await;
                        break;
                    }

                    // Exponential backoff: 10s, 20s, 40s, ... capped at 120s.
                    let backoff = (10.0 * 2f64.powi(consecutive_errors as i32 - 1)).min(120.0);
                    tracing::info!("Backing off for {:.0}s before retry", backoff);
                    sleep(Duration::from_secs_f64(backoff)).await;
                },
            }
        }

        tracing::info!("Classifier worker loop ended");
    }

    /// One pass over the three duties in priority order. Returns how many
    /// items made progress.
    async fn tick(&self) -> Result<u64, anyhow::Error> {
        let classified = self.classify_unclassified().await?;
        if classified > 0 {
            return Ok(classified);
        }

        let indexed = self.index_unindexed().await?;
        if indexed > 0 {
            return Ok(indexed);
        }

        let checked = self.recheck_duplicates().await?;
        Ok(checked)
    }

    // ------------------------------------------------------------------
    // Duty 1: classify items without a pre_filter
    // ------------------------------------------------------------------

    pub(crate) async fn classify_unclassified(&self) -> Result<u64, anyhow::Error> {
        let items = self.items.unclassified(self.config.batch_size).await?;
        if items.is_empty() {
            return Ok(0);
        }

        tracing::info!("Classifying {} unclassified items", items.len());
        let plogger = ProcessingLogger::new(self.pool.clone());

        let mut processed = 0u64;
        let mut priority_changed = 0u64;
        let mut events = Vec::new();

        for entry in items {
            if self.paused.load(Ordering::SeqCst) || self.stop_requested.load(Ordering::SeqCst) {
                break;
            }

            let item = &entry.item;
            let source_name = entry.source_name.clone().unwrap_or_default();

            let result = match self
                .classifier
                .classify(&item.title, &item.content, &source_name)
                .await
            {
                Ok(result) => result,
                Err(e) => {
                    tracing::warn!("Failed to classify item {}: {}", item.id, e);
                    self.stats.lock().await.errors += 1;
                    continue;
                },
            };

            let confidence = result.relevance_confidence;
            let (priority, score, skip_llm) = determine_priority(confidence);

            let mut metadata = item.metadata.clone();
            metadata.pre_filter = Some(PreFilter {
                relevance_confidence: confidence,
                priority_suggestion: result.priority.clone(),
                priority_confidence: result.priority_confidence,
                ak_suggestion: result.ak.clone(),
                ak_confidence: result.ak_confidence,
                classified_at: Utc::now(),
            });
            metadata.retry_priority = Some(retry_priority_for(confidence));

            self.items
                .apply_classification(item.id, priority, score, &metadata, !skip_llm)
                .await?;

            events.push((
                item.id,
                EVENT_CLASSIFIER_PROCESSED,
                Some(json!({
                    "confidence": confidence,
                    "priority": priority.as_str(),
                    "ak_suggestion": result.ak,
                })),
            ));

            let _ = plogger
                .step(ProcessingStepType::PreFilter)
                .item(item.id)
                .confidence(confidence)
                .priorities(Some(item.priority.as_str()), Some(priority.as_str()))
                .relevance(Some(result.relevant), Some(confidence))
                .save()
                .await;

            processed += 1;
            if item.priority != priority {
                priority_changed += 1;
                tracing::info!(
                    "Classified: {}... conf={:.2} {}->{}",
                    truncate(&item.title, 40),
                    confidence,
                    item.priority.as_str(),
                    priority.as_str()
                );
            }
        }

        if let Err(e) = self.events.record_batch(&events).await {
            tracing::warn!("Failed to record classifier events: {}", e);
        }

        {
            let mut stats = self.stats.lock().await;
            stats.processed += processed;
            stats.priority_changed += priority_changed;
            stats.last_processed_at = Some(Utc::now());
        }

        if processed > 0 {
            tracing::info!("Classified {} items ({} priority changes)", processed, priority_changed);
        }

        Ok(processed)
    }

    // ------------------------------------------------------------------
    // Duty 2: index items missing from the vector store
    // ------------------------------------------------------------------

    pub(crate) async fn index_unindexed(&self) -> Result<u64, anyhow::Error> {
        let items = self.items.unindexed(self.config.batch_size).await?;
        if items.is_empty() {
            return Ok(0);
        }

        tracing::info!("Indexing {} items in vector store", items.len());

        let documents: Vec<IndexDocument> = items
            .iter()
            .map(|entry| IndexDocument {
                id: entry.item.id.to_string(),
                title: strip_boilerplate(&entry.item.title, &self.config.boilerplate_prefixes),
                content: strip_boilerplate(&entry.item.content, &self.config.boilerplate_prefixes),
                metadata: json!({
                    "source": entry.source_name.clone().unwrap_or_default(),
                    "priority": entry.item.priority.as_str(),
                    "channel_id": entry.item.channel_id.map(|id| id.to_string()).unwrap_or_default(),
                }),
            })
            .collect();

        if let Err(e) = self.classifier.index_batch(&documents).await {
            tracing::warn!("Failed to index items: {}", e);
            self.stats.lock().await.errors += 1;
            return Ok(0);
        }

        // The API call succeeded: items are either newly added or already
        // existed in the index. Both are valid states.
        for entry in &items {
            let mut metadata = entry.item.metadata.clone();
            metadata.vectordb_indexed = Some(true);
            metadata.vectordb_indexed_at = Some(Utc::now());
            self.items.update_metadata(entry.item.id, &metadata).await?;
        }

        let indexed = items.len() as u64;
        self.stats.lock().await.vectordb_indexed += indexed;
        tracing::info!("Indexed {} items in vector store", indexed);
        Ok(indexed)
    }

    // ------------------------------------------------------------------
    // Duty 3: re-check duplicates for items that missed the intake check
    // ------------------------------------------------------------------

    pub(crate) async fn recheck_duplicates(&self) -> Result<u64, anyhow::Error> {
        let cutoff = if self.config.duplicate_check_days > 0 {
            Some(Utc::now() - ChronoDuration::days(self.config.duplicate_check_days))
        } else {
            None
        };

        let items = self.items.unchecked_duplicates(self.config.batch_size, cutoff).await?;
        if items.is_empty() {
            return Ok(0);
        }

        tracing::info!("Checking {} items for duplicates", items.len());
        let plogger = ProcessingLogger::new(self.pool.clone());

        let mut checked = 0u64;
        let mut found = 0u64;

        for item in items {
            if self.paused.load(Ordering::SeqCst) || self.stop_requested.load(Ordering::SeqCst) {
                break;
            }

            let mut metadata = item.metadata.clone();
            metadata.duplicate_checked = Some(true);
            metadata.duplicate_checked_at = Some(Utc::now());

            let mut similar_to_id: Option<i64> = None;

            // 1. Exact URL match from a different channel, older item only.
            if !item.url.is_empty() {
                if let Some(existing) = self
                    .items
                    .url_duplicate_of(&item.url, item.id, item.channel_id)
                    .await?
                {
                    similar_to_id = Some(existing);
                    metadata.duplicate_method = Some("url_match".to_string());
                    tracing::info!(
                        "URL duplicate: '{}' same URL as item {}",
                        truncate(&item.title, 40),
                        existing
                    );
                }
            }

            // 2. Embedding-based near-duplicate lookup.
            if similar_to_id.is_none() {
                let clean_title = strip_boilerplate(&item.title, &self.config.boilerplate_prefixes);
                let clean_content =
                    strip_boilerplate(&item.content, &self.config.boilerplate_prefixes);

                match self
                    .classifier
                    .find_duplicates(&clean_title, &clean_content, self.config.duplicate_threshold)
                    .await
                {
                    Ok(candidates) => {
                        // Only link backwards: the oldest (smallest id) older
                        // candidate becomes the cluster primary. Newer-only
                        // matches leave the item unlinked so the relation
                        // stays a forest.
                        let mut best: Option<(i64, f64)> = None;
                        for candidate in candidates {
                            let Ok(id) = candidate.id.parse::<i64>() else { continue };
                            if id >= item.id {
                                tracing::debug!(
                                    "Skipping newer duplicate {} for item {}",
                                    id,
                                    item.id
                                );
                                continue;
                            }
                            if best.is_none_or(|(best_id, _)| id < best_id) {
                                best = Some((id, candidate.score));
                            }
                        }
                        if let Some((id, score)) = best {
                            similar_to_id = Some(id);
                            metadata.duplicate_score = Some(score);
                            tracing::info!(
                                "Duplicate found: '{}' similar to item {} (score: {:.3})",
                                truncate(&item.title, 40),
                                id,
                                score
                            );
                        }
                    },
                    Err(e) => {
                        tracing::warn!("Failed to check duplicates for item {}: {}", item.id, e);
                        self.stats.lock().await.errors += 1;
                        continue;
                    },
                }
            }

            // The vector store may return ids whose rows were deleted since
            // indexing; clear those instead of writing a dangling link.
            if let Some(candidate) = similar_to_id {
                let existing = self.items.existing_ids(&[candidate]).await?;
                if !existing.contains(&candidate) {
                    tracing::warn!(
                        "Skipping similar_to_id={} for item {} - referenced item no longer exists (stale vector entry)",
                        candidate,
                        item.id
                    );
                    similar_to_id = None;
                    metadata.duplicate_score = None;
                }
            }

            self.items.set_duplicate_link(item.id, similar_to_id, &metadata).await?;

            let _ = plogger
                .step(ProcessingStepType::DuplicateCheck)
                .item(item.id)
                .output(json!({"similar_to_id": similar_to_id}))
                .save()
                .await;

            checked += 1;
            if similar_to_id.is_some() {
                found += 1;
            }
        }

        {
            let mut stats = self.stats.lock().await;
            stats.duplicates_checked += checked;
            stats.duplicates_found += found;
        }

        if checked > 0 {
            tracing::info!("Checked {} items for duplicates ({} found)", checked, found);
        }

        Ok(checked)
    }

    // ------------------------------------------------------------------
    // Daily reconciliation between the item store and the vector store
    // ------------------------------------------------------------------

    async fn maybe_run_sync_check(&self) {
        let today = Utc::now().date_naive();
        {
            let mut last = self.last_sync_check.lock().await;
            if *last == Some(today) {
                return;
            }
            *last = Some(today);
        }
        self.check_vectordb_sync().await;
    }

    async fn check_vectordb_sync(&self) {
        let health = match self.classifier.health().await {
            Ok(health) => health,
            Err(e) => {
                tracing::warn!("Vector store sync check failed: {}", e);
                return;
            },
        };

        let db_count = match self.items.indexed_count().await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!("Vector store sync check failed reading DB count: {}", e);
                return;
            },
        };

        let vector_count = health.duplicate_index_items;
        let diff = db_count - vector_count;

        if diff.abs() > self.config.sync_delta_threshold {
            tracing::error!(
                "VECTOR STORE SYNC CHECK: DB says {} items indexed, vector store has {} items. Difference: {} items. Trigger a resync or reset the vectordb_indexed flags.",
                db_count,
                vector_count,
                diff
            );
        } else if diff > 0 {
            tracing::warn!(
                "Vector store sync: {} items in DB but not in the vector store (DB: {}, store: {})",
                diff,
                db_count,
                vector_count
            );
        } else {
            tracing::info!("Vector store sync check OK: DB={}, store={}", db_count, vector_count);
        }
    }

    // ------------------------------------------------------------------
    // Command polling and stats sync
    // ------------------------------------------------------------------

    async fn poll_commands(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            let interval = self.status.poll_interval_secs(self.poll_default_secs).await;
            sleep(Duration::from_secs(interval)).await;

            match self.status.read_and_clear_command(WORKER_CLASSIFIER).await {
                Ok(Some(WorkerAction::Pause)) => self.pause().await,
                Ok(Some(WorkerAction::Resume)) => self.resume().await,
                Ok(Some(WorkerAction::Stop)) => self.stop().await,
                Ok(None) => {},
                Err(e) => {
                    tracing::warn!("Classifier command poll error: {}", e);
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
            if let Err(e) = self.status.write_stats(WORKER_CLASSIFIER, &stats).await {
                tracing::warn!("Classifier stats sync error: {}", e);
                sleep(Duration::from_secs(10)).await;
            }
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_thresholds() {
        // >= 0.5: likely relevant.
        assert_eq!(determine_priority(0.82), (Priority::Medium, 70, false));
        assert_eq!(determine_priority(0.5), (Priority::Medium, 70, false));
        // Edge cases go to the LLM too.
        assert_eq!(determine_priority(0.3), (Priority::Low, 55, false));
        assert_eq!(determine_priority(0.25), (Priority::Low, 55, false));
        // Certainly irrelevant skips the LLM.
        assert_eq!(determine_priority(0.1), (Priority::None, 20, true));
    }

    #[test]
    fn test_retry_priority_bands() {
        assert_eq!(retry_priority_for(0.9), RetryPriority::High);
        assert_eq!(retry_priority_for(0.3), RetryPriority::EdgeCase);
        assert_eq!(retry_priority_for(0.1), RetryPriority::Low);
    }
}

//! Ingestion pipeline.
//!
//! Takes a batch of raw items from a connector and funnels each one through
//! intake: dedupe, keyword rules, synchronous classification, vector
//! indexing, duplicate lookup, persistence, and the fresh-queue handoff to
//! the LLM worker.

use chrono::Utc;
use regex::Regex;
use serde_json::json;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::classifier::{Classifier, IndexDocument};
use super::classifier_worker::{CONFIDENCE_EDGE, determine_priority, retry_priority_for};
use super::processing_logger::ProcessingLogger;
use super::processor::calculate_keyword_score;
use crate::connectors::RawItem;
use crate::models::{ChannelWithSource, ItemMetadata, PreFilter, Priority, Rule, RuleType};
use crate::store::{ItemRepository, NewItem, RuleRepository, StoreError};

pub struct IngestPipeline {
    pool: SqlitePool,
    items: ItemRepository,
    rules: RuleRepository,
    classifier: Arc<dyn Classifier>,
    fresh_tx: mpsc::Sender<i64>,
    duplicate_threshold: f64,
    boilerplate_prefixes: Vec<String>,
}

impl IngestPipeline {
    pub fn new(
        pool: SqlitePool,
        classifier: Arc<dyn Classifier>,
        fresh_tx: mpsc::Sender<i64>,
        duplicate_threshold: f64,
        boilerplate_prefixes: Vec<String>,
    ) -> Self {
        Self {
            items: ItemRepository::new(pool.clone()),
            rules: RuleRepository::new(pool.clone()),
            pool,
            classifier,
            fresh_tx,
            duplicate_threshold,
            boilerplate_prefixes,
        }
    }

    /// Run a batch of raw items through intake.
    ///
    /// Returns the number of newly inserted items. Per-item classifier
    /// failures degrade that item to "unclassified" (the classifier worker
    /// catches up later); they never fail the batch.
    pub async fn ingest(
        &self,
        channel: &ChannelWithSource,
        raw_items: Vec<RawItem>,
    ) -> Result<usize, StoreError> {
        let rules = self.rules.enabled_rules().await?;
        let mut inserted = 0usize;

        for raw in raw_items {
            match self.ingest_one(channel, raw, &rules).await {
                Ok(true) => inserted += 1,
                Ok(false) => {},
                Err(e) => {
                    tracing::warn!("Failed to ingest item on channel {}: {}", channel.channel.id, e);
                },
            }
        }

        Ok(inserted)
    }

    /// Returns Ok(true) if the item was inserted, Ok(false) if skipped as a
    /// known duplicate.
    async fn ingest_one(
        &self,
        channel: &ChannelWithSource,
        raw: RawItem,
        rules: &[Rule],
    ) -> Result<bool, StoreError> {
        let content_hash = content_hash(&raw.title, &raw.content);

        // Intake-level dedupe: same external id or same content within the
        // channel. Constraint hits are skips, not errors.
        if self
            .items
            .exists_in_channel(channel.channel.id, &raw.external_id, &content_hash)
            .await?
        {
            tracing::debug!("Skipping known item {} on channel {}", raw.external_id, channel.channel.id);
            return Ok(false);
        }

        let plogger = ProcessingLogger::new(self.pool.clone());

        // Keyword scoring gives the tentative priority until (and unless)
        // the classifier answers.
        let (mut priority_score, mut priority) =
            calculate_keyword_score(&raw.title, &raw.content);
        let matched_rules = apply_rules(rules, &raw.title, &raw.content);
        for (rule, boost) in &matched_rules {
            priority_score = (priority_score + boost).clamp(0, 100);
            if let Some(target) = rule.target_priority {
                priority = target;
            }
        }

        let mut metadata = ItemMetadata::default();
        let mut needs_llm_processing = true;
        let mut classified = false;
        let mut relevance_confidence = None;

        // Synchronous classification. Unreachable classifier: persist
        // unclassified and let the background worker catch up.
        let classification = self
            .classifier
            .classify(&raw.title, &raw.content, &channel.source_name)
            .await;

        match classification {
            Ok(result) => {
                classified = true;
                relevance_confidence = Some(result.relevance_confidence);

                let (cls_priority, cls_score, skip_llm) =
                    determine_priority(result.relevance_confidence);
                priority = cls_priority;
                priority_score = cls_score;
                needs_llm_processing = !skip_llm;

                // Stakeholder sources are never filtered out entirely.
                if channel.source_is_stakeholder && priority == Priority::None {
                    priority = Priority::Low;
                    needs_llm_processing = true;
                }

                metadata.pre_filter = Some(PreFilter {
                    relevance_confidence: result.relevance_confidence,
                    priority_suggestion: result.priority.clone(),
                    priority_confidence: result.priority_confidence,
                    ak_suggestion: result.ak.clone(),
                    ak_confidence: result.ak_confidence,
                    classified_at: Utc::now(),
                });
                metadata.retry_priority = Some(retry_priority_for(result.relevance_confidence));

                let _ = plogger
                    .step(crate::models::ProcessingStepType::PreFilter)
                    .confidence(result.relevance_confidence)
                    .priorities(None, Some(priority.as_str()))
                    .relevance(Some(result.relevant), Some(result.relevance_confidence))
                    .output(json!({
                        "priority_suggestion": result.priority,
                        "ak_suggestion": result.ak,
                    }))
                    .save()
                    .await;
            },
            Err(e) => {
                tracing::warn!("Classifier unavailable at intake: {}", e);
                let _ = plogger
                    .step(crate::models::ProcessingStepType::PreFilter)
                    .failed(&e.to_string())
                    .save()
                    .await;
            },
        }

        // Duplicate lookup runs only when the classifier answered; otherwise
        // the classifier worker re-checks later (duplicate_checked stays
        // unset).
        let mut similar_to_id = None;
        if classified {
            similar_to_id = self.find_duplicate(&raw, channel, &mut metadata).await;
            metadata.duplicate_checked = Some(true);
            metadata.duplicate_checked_at = Some(Utc::now());
        }

        let published_at = raw.published_at.unwrap_or_else(Utc::now);

        let new_item = NewItem {
            channel_id: channel.channel.id,
            external_id: raw.external_id.clone(),
            title: raw.title.clone(),
            content: raw.content.clone(),
            url: raw.url.clone(),
            author: raw.author.clone(),
            published_at,
            content_hash,
            priority,
            priority_score,
            assigned_aks: Vec::new(),
            metadata,
            needs_llm_processing,
            similar_to_id,
        };

        let item_id = self.items.insert(&new_item).await?;

        if let Some(dup) = similar_to_id {
            let _ = plogger
                .step(crate::models::ProcessingStepType::DuplicateCheck)
                .item(item_id)
                .output(json!({"similar_to_id": dup}))
                .save()
                .await;
        }

        for (rule, boost) in &matched_rules {
            let _ = self
                .rules
                .record_match(item_id, rule.id, Some(&json!({"boost": boost})))
                .await;
            let _ = plogger
                .step(crate::models::ProcessingStepType::RuleMatch)
                .item(item_id)
                .output(json!({"rule_id": rule.id, "boost": boost}))
                .save()
                .await;
        }

        // Index the freshly inserted item so subsequent intake and the
        // duplicate re-check can find it. Failure leaves the flag unset; the
        // classifier worker re-indexes later.
        if classified {
            self.index_item(item_id, &raw, channel).await;
        }

        // Fast path to the LLM worker. Certainly-irrelevant and unclassified
        // items stay out of the queue; the backlog scan picks up whatever the
        // classifier approves later.
        let should_enqueue = relevance_confidence.is_some_and(|c| c >= CONFIDENCE_EDGE)
            || (classified && channel.source_is_stakeholder);
        if should_enqueue {
            match self.fresh_tx.try_send(item_id) {
                Ok(()) => tracing::debug!("Enqueued fresh item {}", item_id),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Drop-newest: the backlog scan recovers the item.
                    tracing::warn!("Fresh queue full, item {} left to the backlog", item_id);
                },
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!("Fresh queue closed, item {} left to the backlog", item_id);
                },
            }
        }

        Ok(true)
    }

    /// URL equality first, then embedding lookup. At intake every existing
    /// item has a smaller id than the one being inserted, so any hit keeps
    /// the forest invariant.
    async fn find_duplicate(
        &self,
        raw: &RawItem,
        channel: &ChannelWithSource,
        metadata: &mut ItemMetadata,
    ) -> Option<i64> {
        if !raw.url.is_empty() {
            match self
                .items
                .url_duplicate_of(&raw.url, i64::MAX, Some(channel.channel.id))
                .await
            {
                Ok(Some(existing)) => {
                    metadata.duplicate_method = Some("url_match".to_string());
                    tracing::info!(
                        "URL duplicate: '{}' same URL as item {}",
                        truncate(&raw.title, 40),
                        existing
                    );
                    return Some(existing);
                },
                Ok(None) => {},
                Err(e) => {
                    tracing::warn!("URL duplicate lookup failed: {}", e);
                    return None;
                },
            }
        }

        let clean_title = strip_boilerplate(&raw.title, &self.boilerplate_prefixes);
        let clean_content = strip_boilerplate(&raw.content, &self.boilerplate_prefixes);

        let candidates = match self
            .classifier
            .find_duplicates(&clean_title, &clean_content, self.duplicate_threshold)
            .await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::debug!("Semantic duplicate lookup failed: {}", e);
                return None;
            },
        };

        // Oldest (smallest id) existing match wins as cluster primary.
        let mut best: Option<(i64, f64)> = None;
        for candidate in candidates {
            let Ok(id) = candidate.id.parse::<i64>() else { continue };
            if best.is_none_or(|(best_id, _)| id < best_id) {
                best = Some((id, candidate.score));
            }
        }

        // Stale vector entries may point at deleted items.
        if let Some((id, score)) = best {
            match self.items.existing_ids(&[id]).await {
                Ok(existing) if existing.contains(&id) => {
                    metadata.duplicate_score = Some(score);
                    tracing::info!(
                        "Duplicate found: '{}' similar to item {} (score: {:.3})",
                        truncate(&raw.title, 40),
                        id,
                        score
                    );
                    return Some(id);
                },
                Ok(_) => {
                    tracing::warn!(
                        "Skipping similar_to_id={} - referenced item no longer exists (stale vector entry)",
                        id
                    );
                },
                Err(e) => tracing::warn!("Duplicate existence check failed: {}", e),
            }
        }
        None
    }

    async fn index_item(&self, item_id: i64, raw: &RawItem, channel: &ChannelWithSource) {
        let document = IndexDocument {
            id: item_id.to_string(),
            title: strip_boilerplate(&raw.title, &self.boilerplate_prefixes),
            content: strip_boilerplate(&raw.content, &self.boilerplate_prefixes),
            metadata: json!({
                "source": channel.source_name,
                "channel_id": channel.channel.id.to_string(),
            }),
        };

        match self.classifier.index_batch(std::slice::from_ref(&document)).await {
            Ok(_) => {
                if let Ok(Some(item)) = self.items.get(item_id).await {
                    let mut metadata = item.metadata;
                    metadata.vectordb_indexed = Some(true);
                    metadata.vectordb_indexed_at = Some(Utc::now());
                    if let Err(e) = self.items.update_metadata(item_id, &metadata).await {
                        tracing::warn!("Failed to stamp vectordb_indexed on {}: {}", item_id, e);
                    }
                }
            },
            Err(e) => {
                tracing::warn!("Failed to index item {} at intake: {}", item_id, e);
            },
        }
    }
}

/// Stable hash of title + content for intake-level duplicate detection.
pub fn content_hash(title: &str, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update(b"\n");
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Strip configured boilerplate prefixes so embeddings compare article
/// substance, not press-release framing.
pub fn strip_boilerplate(text: &str, prefixes: &[String]) -> String {
    let mut result = text.trim();
    let mut changed = true;
    while changed {
        changed = false;
        for prefix in prefixes {
            if let Some(rest) = result.strip_prefix(prefix.as_str()) {
                result = rest.trim_start();
                changed = true;
            }
        }
    }
    result.to_string()
}

/// Keyword and regex rules against title+content; returns matches with their
/// boost. Invalid regexes are configuration errors surfaced at rule-creation
/// time, so they are skipped silently here.
fn apply_rules<'a>(rules: &'a [Rule], title: &str, content: &str) -> Vec<(&'a Rule, i64)> {
    let text = format!("{} {}", title, content);
    let text_lower = text.to_lowercase();
    let mut matches = Vec::new();

    for rule in rules {
        let hit = match rule.rule_type {
            RuleType::Keyword => text_lower.contains(&rule.pattern.to_lowercase()),
            RuleType::Regex => match Regex::new(&rule.pattern) {
                Ok(re) => re.is_match(&text),
                Err(e) => {
                    tracing::warn!("Rule {} has invalid regex: {}", rule.id, e);
                    false
                },
            },
            // Semantic rules need the LLM; the LLM worker evaluates them.
            RuleType::Semantic => false,
        };
        if hit {
            matches.push((rule, rule.priority_boost));
        }
    }

    matches
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_is_stable() {
        let a = content_hash("Titel", "Inhalt");
        let b = content_hash("Titel", "Inhalt");
        assert_eq!(a, b);
        assert_ne!(a, content_hash("Titel", "Anderer Inhalt"));
        // Title/content boundary matters.
        assert_ne!(content_hash("ab", "c"), content_hash("a", "bc"));
    }

    #[test]
    fn test_strip_boilerplate_prefixes() {
        let prefixes = vec!["Pressemitteilung:".to_string(), "+++".to_string()];
        assert_eq!(
            strip_boilerplate("Pressemitteilung: +++ Neues Gesetz", &prefixes),
            "Neues Gesetz"
        );
        assert_eq!(strip_boilerplate("Neues Gesetz", &prefixes), "Neues Gesetz");
    }
}

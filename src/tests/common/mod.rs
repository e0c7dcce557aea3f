// Common test utilities and helpers

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::json;
use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::config::{ClassifierConfig, LlmConfig, WorkersConfig};
use crate::models::{ConnectorType, ItemMetadata, PreFilter, Priority, RetryPriority};
use crate::services::classifier::{
    Classification, Classifier, ClassifierError, ClassifierHealth, DuplicateCandidate,
    IndexDocument,
};
use crate::services::classifier_worker::ClassifierWorker;
use crate::services::llm::{ChatMessage, LlmError, LlmProvider, LlmResponse, LlmService};
use crate::services::llm_worker::LlmWorker;
use crate::services::processor::ItemProcessor;
use crate::store::{ChannelRepository, ItemRepository, NewItem};

/// Create an in-memory SQLite database for testing
pub async fn create_test_db() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(3))
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create test database");

    sqlx::migrate!()
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

/// Seed one source with one RSS channel; returns (source_id, channel_id).
pub async fn seed_channel(pool: &SqlitePool) -> (i64, i64) {
    seed_named_channel(pool, "Bundesministerium", "https://example.org/feed").await
}

pub async fn seed_named_channel(pool: &SqlitePool, source: &str, url: &str) -> (i64, i64) {
    let channels = ChannelRepository::new(pool.clone());
    let source = channels
        .create_source(source, None, false)
        .await
        .expect("Failed to create source");
    let channel = channels
        .create_channel(source.id, None, ConnectorType::Rss, &json!({"url": url}), 30)
        .await
        .expect("Failed to create channel");
    (source.id, channel.id)
}

/// Insert an item directly, bypassing the pipeline.
pub struct ItemSeed {
    pub channel_id: i64,
    pub external_id: String,
    pub title: String,
    pub content: String,
    pub url: String,
    pub priority: Priority,
    pub priority_score: i64,
    pub needs_llm_processing: bool,
    pub metadata: ItemMetadata,
    pub similar_to_id: Option<i64>,
}

impl ItemSeed {
    pub fn new(channel_id: i64, external_id: &str) -> Self {
        Self {
            channel_id,
            external_id: external_id.to_string(),
            title: format!("Artikel {}", external_id),
            content: "Inhalt des Artikels.".to_string(),
            url: format!("https://example.org/{}", external_id),
            priority: Priority::Low,
            priority_score: 50,
            needs_llm_processing: false,
            metadata: ItemMetadata::default(),
            similar_to_id: None,
        }
    }

    pub fn classified(mut self, confidence: f64) -> Self {
        self.metadata.pre_filter = Some(PreFilter {
            relevance_confidence: confidence,
            priority_suggestion: Some("medium".to_string()),
            priority_confidence: Some(0.7),
            ak_suggestion: Some("AK3".to_string()),
            ak_confidence: Some(0.6),
            classified_at: Utc::now(),
        });
        self.metadata.retry_priority = Some(if confidence >= 0.5 {
            RetryPriority::High
        } else if confidence >= 0.25 {
            RetryPriority::EdgeCase
        } else {
            RetryPriority::Low
        });
        self
    }

    pub fn url(mut self, url: &str) -> Self {
        self.url = url.to_string();
        self
    }

    pub fn title(mut self, title: &str) -> Self {
        self.title = title.to_string();
        self
    }

    pub fn needs_llm(mut self, needs: bool) -> Self {
        self.needs_llm_processing = needs;
        self
    }

    pub fn priority(mut self, priority: Priority, score: i64) -> Self {
        self.priority = priority;
        self.priority_score = score;
        self
    }

    pub async fn insert(self, pool: &SqlitePool) -> i64 {
        let items = ItemRepository::new(pool.clone());
        // Unique per insert so the intake dedupe never collides.
        let content_hash = crate::services::pipeline::content_hash(
            &self.title,
            &uuid::Uuid::new_v4().to_string(),
        );
        items
            .insert(&NewItem {
                channel_id: self.channel_id,
                external_id: self.external_id,
                title: self.title,
                content: self.content,
                url: self.url,
                author: None,
                published_at: Utc.with_ymd_and_hms(2025, 1, 15, 10, 0, 0).unwrap(),
                content_hash,
                priority: self.priority,
                priority_score: self.priority_score,
                assigned_aks: Vec::new(),
                metadata: self.metadata,
                needs_llm_processing: self.needs_llm_processing,
                similar_to_id: self.similar_to_id,
            })
            .await
            .expect("Failed to insert test item")
    }
}

// ============================================================================
// Fake classifier
// ============================================================================

/// Scriptable classifier for tests: canned classification, canned duplicate
/// candidates, records every indexed document.
pub struct FakeClassifier {
    pub classification: Mutex<Result<Classification, String>>,
    pub duplicates: Mutex<Vec<DuplicateCandidate>>,
    pub indexed: Mutex<Vec<String>>,
    pub classify_calls: AtomicU32,
    pub health_count: Mutex<i64>,
}

impl FakeClassifier {
    pub fn relevant(confidence: f64) -> Arc<Self> {
        Arc::new(Self {
            classification: Mutex::new(Ok(Classification {
                relevant: confidence >= 0.5,
                relevance_confidence: confidence,
                priority: Some("medium".to_string()),
                priority_confidence: Some(0.7),
                ak: Some("AK3".to_string()),
                ak_confidence: Some(0.6),
            })),
            duplicates: Mutex::new(Vec::new()),
            indexed: Mutex::new(Vec::new()),
            classify_calls: AtomicU32::new(0),
            health_count: Mutex::new(0),
        })
    }

    pub fn offline() -> Arc<Self> {
        Arc::new(Self {
            classification: Mutex::new(Err("503 Service Unavailable".to_string())),
            duplicates: Mutex::new(Vec::new()),
            indexed: Mutex::new(Vec::new()),
            classify_calls: AtomicU32::new(0),
            health_count: Mutex::new(0),
        })
    }

    pub async fn set_duplicates(&self, candidates: Vec<(i64, f64)>) {
        *self.duplicates.lock().await = candidates
            .into_iter()
            .map(|(id, score)| DuplicateCandidate { id: id.to_string(), score })
            .collect();
    }
}

#[async_trait]
impl Classifier for FakeClassifier {
    async fn classify(
        &self,
        _title: &str,
        _content: &str,
        _source: &str,
    ) -> Result<Classification, ClassifierError> {
        self.classify_calls.fetch_add(1, Ordering::Relaxed);
        self.classification
            .lock()
            .await
            .clone()
            .map_err(ClassifierError::Api)
    }

    async fn find_duplicates(
        &self,
        _title: &str,
        _content: &str,
        _threshold: f64,
    ) -> Result<Vec<DuplicateCandidate>, ClassifierError> {
        Ok(self.duplicates.lock().await.clone())
    }

    async fn index_batch(&self, documents: &[IndexDocument]) -> Result<u64, ClassifierError> {
        let mut indexed = self.indexed.lock().await;
        for doc in documents {
            indexed.push(doc.id.clone());
        }
        Ok(documents.len() as u64)
    }

    async fn delete_items(&self, _ids: &[String]) -> Result<(), ClassifierError> {
        Ok(())
    }

    async fn all_indexed_ids(&self) -> Result<Vec<String>, ClassifierError> {
        Ok(self.indexed.lock().await.clone())
    }

    async fn health(&self) -> Result<ClassifierHealth, ClassifierError> {
        let count = *self.health_count.lock().await;
        Ok(ClassifierHealth { search_index_items: count, duplicate_index_items: count })
    }

    async fn storage_stats(&self) -> Result<serde_json::Value, ClassifierError> {
        Ok(json!({"items": self.indexed.lock().await.len()}))
    }
}

// ============================================================================
// Fake LLM provider
// ============================================================================

/// LLM provider returning a canned response text.
pub struct FakeLlmProvider {
    pub response: Mutex<Result<String, String>>,
    pub calls: AtomicU32,
}

impl FakeLlmProvider {
    pub fn returning(text: &str) -> Arc<Self> {
        Arc::new(Self {
            response: Mutex::new(Ok(text.to_string())),
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl LlmProvider for FakeLlmProvider {
    fn provider_name(&self) -> &'static str {
        "fake"
    }

    fn model_name(&self) -> &str {
        "fake-model"
    }

    async fn complete(
        &self,
        _prompt: &str,
        _system: Option<&str>,
        _temperature: f64,
        _max_tokens: Option<u32>,
    ) -> Result<LlmResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        match self.response.lock().await.clone() {
            Ok(text) => Ok(LlmResponse {
                text,
                model: "fake-model".to_string(),
                tokens_used: Some(100),
                prompt_tokens: Some(80),
                completion_tokens: Some(20),
                provider: "fake",
            }),
            Err(e) => Err(LlmError::Api(e)),
        }
    }

    async fn chat(
        &self,
        _messages: &[ChatMessage],
        temperature: f64,
        max_tokens: Option<u32>,
    ) -> Result<LlmResponse, LlmError> {
        self.complete("", None, temperature, max_tokens).await
    }

    async fn is_available(&self) -> bool {
        true
    }
}

// ============================================================================
// Worker builders
// ============================================================================

pub fn test_classifier_config() -> ClassifierConfig {
    ClassifierConfig { idle_sleep_secs: 1, ..ClassifierConfig::default() }
}

pub fn build_classifier_worker(
    pool: &SqlitePool,
    classifier: Arc<dyn Classifier>,
) -> Arc<ClassifierWorker> {
    Arc::new(ClassifierWorker::new(
        pool.clone(),
        classifier,
        test_classifier_config(),
        &WorkersConfig::default(),
    ))
}

/// LLM worker wired to a fake provider; returns the worker and the fresh
/// queue sender.
pub fn build_llm_worker(
    pool: &SqlitePool,
    provider: Arc<FakeLlmProvider>,
) -> (Arc<LlmWorker>, tokio::sync::mpsc::Sender<i64>) {
    let (tx, rx) = tokio::sync::mpsc::channel(64);
    let provider: Arc<dyn LlmProvider> = provider;
    let llm = Arc::new(LlmService::new(vec![provider]).unwrap());
    let config = LlmConfig { idle_sleep_secs: 1, ..LlmConfig::default() };
    let worker = Arc::new(LlmWorker::new(
        pool.clone(),
        ItemProcessor::new(llm),
        None,
        tx.clone(),
        rx,
        config,
        5,
    ));
    (worker, tx)
}

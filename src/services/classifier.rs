//! Client for the external embedding classifier service.
//!
//! The classifier is an HTTP service that scores relevance/priority/topic for
//! a text and doubles as the vector index (semantic duplicate lookups). The
//! core treats the model behind it as a black box.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("Classifier API error: {0}")]
    Api(String),

    #[error("Classifier timeout after {0}s")]
    Timeout(u64),

    #[error("Classifier response parsing error: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for ClassifierError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ClassifierError::Timeout(0)
        } else {
            ClassifierError::Api(e.to_string())
        }
    }
}

/// Result of `POST /classify`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    #[serde(default)]
    pub relevant: bool,
    pub relevance_confidence: f64,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub priority_confidence: Option<f64>,
    #[serde(default)]
    pub ak: Option<String>,
    #[serde(default)]
    pub ak_confidence: Option<f64>,
}

/// One duplicate candidate from `POST /find-duplicates`, ordered by score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateCandidate {
    pub id: String,
    pub score: f64,
}

/// One document for `POST /index-batch`.
#[derive(Debug, Clone, Serialize)]
pub struct IndexDocument {
    pub id: String,
    pub title: String,
    pub content: String,
    pub metadata: serde_json::Value,
}

/// Result of `GET /health`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClassifierHealth {
    #[serde(default)]
    pub search_index_items: i64,
    #[serde(default)]
    pub duplicate_index_items: i64,
}

/// Classifier + vector-index operations used by the pipeline and workers.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(
        &self,
        title: &str,
        content: &str,
        source: &str,
    ) -> Result<Classification, ClassifierError>;

    /// Ordered duplicate candidates above the cosine threshold.
    async fn find_duplicates(
        &self,
        title: &str,
        content: &str,
        threshold: f64,
    ) -> Result<Vec<DuplicateCandidate>, ClassifierError>;

    /// Index documents. Idempotent by id: re-adding an existing id is a no-op.
    async fn index_batch(&self, documents: &[IndexDocument]) -> Result<u64, ClassifierError>;

    async fn delete_items(&self, ids: &[String]) -> Result<(), ClassifierError>;

    async fn all_indexed_ids(&self) -> Result<Vec<String>, ClassifierError>;

    async fn health(&self) -> Result<ClassifierHealth, ClassifierError>;

    /// Size/item counts per index, for operator diagnostics.
    async fn storage_stats(&self) -> Result<serde_json::Value, ClassifierError>;
}

/// HTTP implementation against the classifier service.
pub struct HttpClassifier {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpClassifier {
    pub fn new(base_url: &str, timeout_secs: u64) -> Self {
        let timeout = Duration::from_secs(timeout_secs);
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { http, base_url: base_url.trim_end_matches('/').to_string(), timeout }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn map_timeout(&self, e: reqwest::Error) -> ClassifierError {
        if e.is_timeout() {
            ClassifierError::Timeout(self.timeout.as_secs())
        } else {
            ClassifierError::Api(e.to_string())
        }
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(
        &self,
        title: &str,
        content: &str,
        source: &str,
    ) -> Result<Classification, ClassifierError> {
        let response = self
            .http
            .post(self.url("/classify"))
            .json(&serde_json::json!({
                "title": title,
                "content": content,
                "source": source,
            }))
            .send()
            .await
            .map_err(|e| self.map_timeout(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClassifierError::Api(format!("classify returned {}: {}", status, body)));
        }

        response
            .json::<Classification>()
            .await
            .map_err(|e| ClassifierError::Parse(e.to_string()))
    }

    async fn find_duplicates(
        &self,
        title: &str,
        content: &str,
        threshold: f64,
    ) -> Result<Vec<DuplicateCandidate>, ClassifierError> {
        let response = self
            .http
            .post(self.url("/find-duplicates"))
            .json(&serde_json::json!({
                "title": title,
                "content": content,
                "threshold": threshold,
            }))
            .send()
            .await
            .map_err(|e| self.map_timeout(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClassifierError::Api(format!("find-duplicates returned {}", status)));
        }

        response
            .json::<Vec<DuplicateCandidate>>()
            .await
            .map_err(|e| ClassifierError::Parse(e.to_string()))
    }

    async fn index_batch(&self, documents: &[IndexDocument]) -> Result<u64, ClassifierError> {
        #[derive(Deserialize)]
        struct IndexResponse {
            #[serde(default)]
            added: u64,
        }

        let response = self
            .http
            .post(self.url("/index-batch"))
            .json(documents)
            .send()
            .await
            .map_err(|e| self.map_timeout(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClassifierError::Api(format!("index-batch returned {}", status)));
        }

        let parsed: IndexResponse = response
            .json()
            .await
            .map_err(|e| ClassifierError::Parse(e.to_string()))?;
        Ok(parsed.added)
    }

    async fn delete_items(&self, ids: &[String]) -> Result<(), ClassifierError> {
        let response = self
            .http
            .post(self.url("/delete"))
            .json(ids)
            .send()
            .await
            .map_err(|e| self.map_timeout(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClassifierError::Api(format!("delete returned {}", status)));
        }
        Ok(())
    }

    async fn all_indexed_ids(&self) -> Result<Vec<String>, ClassifierError> {
        let response = self
            .http
            .get(self.url("/all-indexed-ids"))
            .send()
            .await
            .map_err(|e| self.map_timeout(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClassifierError::Api(format!("all-indexed-ids returned {}", status)));
        }

        response
            .json::<Vec<String>>()
            .await
            .map_err(|e| ClassifierError::Parse(e.to_string()))
    }

    async fn health(&self) -> Result<ClassifierHealth, ClassifierError> {
        let response = self
            .http
            .get(self.url("/health"))
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| self.map_timeout(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClassifierError::Api(format!("health returned {}", status)));
        }

        response
            .json::<ClassifierHealth>()
            .await
            .map_err(|e| ClassifierError::Parse(e.to_string()))
    }

    async fn storage_stats(&self) -> Result<serde_json::Value, ClassifierError> {
        let response = self
            .http
            .get(self.url("/storage-stats"))
            .send()
            .await
            .map_err(|e| self.map_timeout(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClassifierError::Api(format!("storage-stats returned {}", status)));
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| ClassifierError::Parse(e.to_string()))
    }
}

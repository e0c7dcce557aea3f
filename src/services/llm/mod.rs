//! LLM provider abstraction.
//!
//! An ordered chain of interchangeable providers; the first to succeed wins.

mod ollama;
mod openrouter;
mod service;

pub use ollama::OllamaProvider;
pub use openrouter::OpenRouterProvider;
pub use service::LlmService;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("LLM API error: {0}")]
    Api(String),

    #[error("LLM response parsing error: {0}")]
    Parse(String),

    #[error("LLM timeout after {0}s")]
    Timeout(u64),

    #[error("LLM processing disabled")]
    Disabled,

    #[error("All LLM providers failed: {0}")]
    AllProvidersFailed(String),
}

/// Response from an LLM provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<i64>,
    /// Which provider produced this response.
    pub provider: &'static str,
}

/// One chat message for `chat()` calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }
}

/// A single LLM backend.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn provider_name(&self) -> &'static str;

    /// Which model a successful call would run.
    fn model_name(&self) -> &str;

    /// Generate a completion for a single prompt, optionally with a system
    /// prompt.
    async fn complete(
        &self,
        prompt: &str,
        system: Option<&str>,
        temperature: f64,
        max_tokens: Option<u32>,
    ) -> Result<LlmResponse, LlmError>;

    /// Generate a completion from a full messages list.
    async fn chat(
        &self,
        messages: &[ChatMessage],
        temperature: f64,
        max_tokens: Option<u32>,
    ) -> Result<LlmResponse, LlmError>;

    /// Cheap reachability probe.
    async fn is_available(&self) -> bool;
}

pub(crate) fn map_reqwest_error(e: reqwest::Error, timeout_secs: u64) -> LlmError {
    if e.is_timeout() {
        LlmError::Timeout(timeout_secs)
    } else {
        LlmError::Api(e.to_string())
    }
}

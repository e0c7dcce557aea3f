//! Ollama provider - local model inference on the GPU host.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{ChatMessage, LlmError, LlmProvider, LlmResponse, map_reqwest_error};

pub struct OllamaProvider {
    http: reqwest::Client,
    base_url: String,
    model: String,
    timeout_secs: u64,
}

impl OllamaProvider {
    pub fn new(base_url: &str, model: &str, timeout_secs: u64) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            timeout_secs,
        }
    }

    async fn call_chat(
        &self,
        messages: &[ChatMessage],
        temperature: f64,
        max_tokens: Option<u32>,
    ) -> Result<LlmResponse, LlmError> {
        let request = OllamaChatRequest {
            model: self.model.clone(),
            messages: messages.to_vec(),
            stream: false,
            // Disable thinking mode so content is always populated.
            think: false,
            options: OllamaOptions { temperature, num_predict: max_tokens },
        };

        let response = self
            .http
            .post(format!("{}/api/chat", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, self.timeout_secs))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api(format!("Ollama returned {}: {}", status, body)));
        }

        let data: OllamaChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;

        if data.message.content.is_empty() && data.message.thinking.is_some() {
            tracing::warn!("Ollama returned empty content with thinking mode active");
        }

        Ok(LlmResponse {
            text: data.message.content,
            model: self.model.clone(),
            tokens_used: data.eval_count,
            prompt_tokens: data.prompt_eval_count,
            completion_tokens: data.eval_count,
            provider: self.provider_name(),
        })
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    fn provider_name(&self) -> &'static str {
        "ollama"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        prompt: &str,
        system: Option<&str>,
        temperature: f64,
        max_tokens: Option<u32>,
    ) -> Result<LlmResponse, LlmError> {
        let mut messages = Vec::new();
        if let Some(system) = system {
            messages.push(ChatMessage::system(system));
        }
        messages.push(ChatMessage::user(prompt));
        self.call_chat(&messages, temperature, max_tokens).await
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        temperature: f64,
        max_tokens: Option<u32>,
    ) -> Result<LlmResponse, LlmError> {
        self.call_chat(messages, temperature, max_tokens).await
    }

    async fn is_available(&self) -> bool {
        let result = self
            .http
            .get(format!("{}/api/tags", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await;
        match result {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!("Ollama not available: {}", e);
                false
            },
        }
    }
}

// ============================================================================
// Ollama API Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    think: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: OllamaMessage,
    #[serde(default)]
    prompt_eval_count: Option<i64>,
    #[serde(default)]
    eval_count: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    thinking: Option<String>,
}

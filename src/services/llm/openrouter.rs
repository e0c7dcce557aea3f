//! OpenRouter provider - cloud fallback via an OpenAI-compatible API.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{ChatMessage, LlmError, LlmProvider, LlmResponse, map_reqwest_error};

const OPENROUTER_API_BASE: &str = "https://openrouter.ai/api/v1";

pub struct OpenRouterProvider {
    http: reqwest::Client,
    api_key: String,
    model: String,
    timeout_secs: u64,
}

impl OpenRouterProvider {
    pub fn new(api_key: &str, model: &str, timeout_secs: u64) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            http,
            api_key: api_key.to_string(),
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
        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages: messages.to_vec(),
            temperature,
            max_tokens,
        };

        let response = self
            .http
            .post(format!("{}/chat/completions", OPENROUTER_API_BASE))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, self.timeout_secs))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api(format!("OpenRouter returned {}: {}", status, body)));
        }

        let data: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;

        let text = data
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| LlmError::Parse("Empty response from OpenRouter".to_string()))?;

        Ok(LlmResponse {
            text,
            model: data.model.unwrap_or_else(|| self.model.clone()),
            tokens_used: data.usage.as_ref().and_then(|u| u.total_tokens),
            prompt_tokens: data.usage.as_ref().and_then(|u| u.prompt_tokens),
            completion_tokens: data.usage.as_ref().and_then(|u| u.completion_tokens),
            provider: self.provider_name(),
        })
    }
}

#[async_trait]
impl LlmProvider for OpenRouterProvider {
    fn provider_name(&self) -> &'static str {
        "openrouter"
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
        if self.api_key.is_empty() {
            return false;
        }
        let result = self
            .http
            .get(format!("{}/models", OPENROUTER_API_BASE))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .timeout(Duration::from_secs(10))
            .send()
            .await;
        match result {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!("OpenRouter not available: {}", e);
                false
            },
        }
    }
}

// ============================================================================
// OpenAI-compatible API Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: Option<i64>,
    #[serde(default)]
    completion_tokens: Option<i64>,
    #[serde(default)]
    total_tokens: Option<i64>,
}

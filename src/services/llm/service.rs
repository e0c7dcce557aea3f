//! Multi-provider LLM service with fallback.

use std::sync::Arc;

use super::{LlmError, LlmProvider, LlmResponse};

/// Tries providers in declared order per call; the first to succeed wins.
///
/// The core never branches on provider identity except during health
/// reporting.
pub struct LlmService {
    providers: Vec<Arc<dyn LlmProvider>>,
}

impl LlmService {
    /// At least one provider is required.
    pub fn new(providers: Vec<Arc<dyn LlmProvider>>) -> Result<Self, LlmError> {
        if providers.is_empty() {
            return Err(LlmError::Api("At least one provider is required".to_string()));
        }
        Ok(Self { providers })
    }

    /// Name and model of the primary provider, for processing logs.
    pub fn primary_info(&self) -> (&'static str, String) {
        let primary = &self.providers[0];
        (primary.provider_name(), primary.model_name().to_string())
    }

    pub async fn complete(
        &self,
        prompt: &str,
        system: Option<&str>,
        temperature: f64,
        max_tokens: Option<u32>,
    ) -> Result<LlmResponse, LlmError> {
        let mut errors = Vec::new();

        for provider in &self.providers {
            tracing::debug!("Trying provider: {}", provider.provider_name());
            match provider.complete(prompt, system, temperature, max_tokens).await {
                Ok(response) => {
                    tracing::debug!("LLM response from {}", provider.provider_name());
                    return Ok(response);
                },
                Err(e) => {
                    let message = format!("{}: {}", provider.provider_name(), e);
                    tracing::warn!("Provider failed: {}", message);
                    errors.push(message);
                },
            }
        }

        Err(LlmError::AllProvidersFailed(errors.join("; ")))
    }

    /// Availability of every provider, keyed by provider name. Used by the
    /// status surface for health reporting.
    pub async fn check_availability(&self) -> Vec<(&'static str, bool)> {
        let mut result = Vec::with_capacity(self.providers.len());
        for provider in &self.providers {
            result.push((provider.provider_name(), provider.is_available().await));
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::llm::ChatMessage;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyProvider {
        name: &'static str,
        fail: bool,
        calls: AtomicU32,
    }

    #[async_trait]
    impl LlmProvider for FlakyProvider {
        fn provider_name(&self) -> &'static str {
            self.name
        }

        fn model_name(&self) -> &str {
            "test-model"
        }

        async fn complete(
            &self,
            _prompt: &str,
            _system: Option<&str>,
            _temperature: f64,
            _max_tokens: Option<u32>,
        ) -> Result<LlmResponse, LlmError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if self.fail {
                Err(LlmError::Api("boom".to_string()))
            } else {
                Ok(LlmResponse {
                    text: "ok".to_string(),
                    model: "test-model".to_string(),
                    tokens_used: None,
                    prompt_tokens: None,
                    completion_tokens: None,
                    provider: self.name,
                })
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
            !self.fail
        }
    }

    #[tokio::test]
    async fn test_first_successful_provider_wins() {
        let primary =
            Arc::new(FlakyProvider { name: "primary", fail: true, calls: AtomicU32::new(0) });
        let fallback =
            Arc::new(FlakyProvider { name: "fallback", fail: false, calls: AtomicU32::new(0) });

        let service =
            LlmService::new(vec![primary.clone(), fallback.clone()]).unwrap();
        let response = service.complete("hi", None, 0.1, None).await.unwrap();

        assert_eq!(response.provider, "fallback");
        assert_eq!(primary.calls.load(Ordering::Relaxed), 1);
        assert_eq!(fallback.calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_all_failed_aggregates_messages() {
        let a = Arc::new(FlakyProvider { name: "a", fail: true, calls: AtomicU32::new(0) });
        let b = Arc::new(FlakyProvider { name: "b", fail: true, calls: AtomicU32::new(0) });

        let service = LlmService::new(vec![a, b]).unwrap();
        let err = service.complete("hi", None, 0.1, None).await.unwrap_err();

        let message = err.to_string();
        assert!(message.contains("a:"));
        assert!(message.contains("b:"));
    }

    #[test]
    fn test_empty_provider_list_rejected() {
        assert!(LlmService::new(vec![]).is_err());
    }
}

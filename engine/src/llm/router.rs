//! Model Router
//!
//! Selects which chat provider serves a call and fails over between
//! them. The configured default provider is tried first; remaining
//! providers are attempted in registration order, each under its own
//! timeout. A provider failure is logged and absorbed — only when the
//! whole chain is exhausted does the caller see an error, and even
//! then the owning stage degrades rather than aborting the run.

use super::{ChatModel, LlmError, Message};
use std::time::Duration;

/// Chat provider failover chain.
pub struct ModelRouter {
    /// Available providers, in registration order
    providers: Vec<Box<dyn ChatModel>>,

    /// Name of the provider to try first
    default_provider: String,

    /// Per-call timeout in seconds
    timeout_secs: u64,
}

impl ModelRouter {
    pub fn new(
        providers: Vec<Box<dyn ChatModel>>,
        default_provider: impl Into<String>,
        timeout_secs: u64,
    ) -> Self {
        Self {
            providers,
            default_provider: default_provider.into(),
            timeout_secs,
        }
    }

    /// A router that always uses the single given provider.
    pub fn single(provider: Box<dyn ChatModel>, timeout_secs: u64) -> Self {
        let name = provider.name().to_string();
        Self::new(vec![provider], name, timeout_secs)
    }

    /// Providers in attempt order: configured default first, then the
    /// rest in registration order.
    fn ordered(&self) -> Vec<&dyn ChatModel> {
        let mut ordered: Vec<&dyn ChatModel> =
            self.providers.iter().map(|b| b.as_ref()).collect();
        ordered.sort_by_key(|p| p.name() != self.default_provider);
        ordered
    }

    /// Call providers with automatic failover.
    ///
    /// Returns the generated text and the name of the provider that
    /// served it.
    pub async fn call(&self, messages: &[Message]) -> super::Result<(String, String)> {
        if self.providers.is_empty() {
            return Err(LlmError::ProviderUnavailable(
                "No model providers configured".to_string(),
            ));
        }

        for provider in self.ordered() {
            // Local providers get extra headroom for model loading
            let timeout_secs = if provider.is_local() {
                self.timeout_secs * 2
            } else {
                self.timeout_secs
            };
            tracing::debug!(
                "Attempting provider: {} (timeout: {}s)",
                provider.name(),
                timeout_secs
            );

            let result = tokio::time::timeout(
                Duration::from_secs(timeout_secs),
                provider.generate(messages),
            )
            .await;

            match result {
                Ok(Ok(text)) => {
                    tracing::debug!("Provider {} succeeded", provider.name());
                    return Ok((text, provider.name().to_string()));
                }
                Ok(Err(e)) => {
                    tracing::warn!("Provider {} failed: {}", provider.name(), e);
                }
                Err(_) => {
                    tracing::warn!(
                        "Provider {} timed out after {}s",
                        provider.name(),
                        timeout_secs
                    );
                }
            }
        }

        tracing::error!("All model providers exhausted");
        Err(LlmError::ProviderUnavailable(
            "All model providers failed".to_string(),
        ))
    }

    /// Check the health of all registered providers.
    /// Returns a list of (provider_name, is_healthy).
    pub async fn check_health(&self) -> Vec<(&str, bool)> {
        let mut results = Vec::new();
        for provider in &self.providers {
            let is_healthy = provider.check_health().await;
            results.push((provider.name(), is_healthy));
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Mock provider with a canned outcome
    struct MockProvider {
        name: String,
        response: Option<String>,
    }

    impl MockProvider {
        fn ok(name: &str, response: &str) -> Self {
            Self {
                name: name.to_string(),
                response: Some(response.to_string()),
            }
        }

        fn failing(name: &str) -> Self {
            Self {
                name: name.to_string(),
                response: None,
            }
        }
    }

    #[async_trait]
    impl ChatModel for MockProvider {
        fn name(&self) -> &str {
            &self.name
        }

        fn is_local(&self) -> bool {
            false
        }

        async fn generate(&self, _messages: &[Message]) -> crate::llm::Result<String> {
            match &self.response {
                Some(text) => Ok(text.clone()),
                None => Err(LlmError::ProviderUnavailable("down".to_string())),
            }
        }
    }

    #[tokio::test]
    async fn test_default_provider_tried_first() {
        let router = ModelRouter::new(
            vec![
                Box::new(MockProvider::ok("openai", "from openai")),
                Box::new(MockProvider::ok("ollama", "from ollama")),
            ],
            "ollama",
            5,
        );

        let (text, provider) = router.call(&[Message::user("hi")]).await.unwrap();
        assert_eq!(provider, "ollama");
        assert_eq!(text, "from ollama");
    }

    #[tokio::test]
    async fn test_failover_to_next_provider() {
        let router = ModelRouter::new(
            vec![
                Box::new(MockProvider::failing("openai")),
                Box::new(MockProvider::ok("anthropic", "backup answer")),
            ],
            "openai",
            5,
        );

        let (text, provider) = router.call(&[Message::user("hi")]).await.unwrap();
        assert_eq!(provider, "anthropic");
        assert_eq!(text, "backup answer");
    }

    #[tokio::test]
    async fn test_all_providers_exhausted() {
        let router = ModelRouter::new(
            vec![
                Box::new(MockProvider::failing("openai")),
                Box::new(MockProvider::failing("anthropic")),
            ],
            "openai",
            5,
        );

        let result = router.call(&[Message::user("hi")]).await;
        assert!(matches!(result, Err(LlmError::ProviderUnavailable(_))));
    }

    #[tokio::test]
    async fn test_empty_router_errors() {
        let router = ModelRouter::new(vec![], "openai", 5);
        assert!(router.call(&[]).await.is_err());
    }
}

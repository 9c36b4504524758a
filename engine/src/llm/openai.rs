use super::{ChatModel, LlmError, Message, MessageRole};
use crate::config::{OpenAiConfig, VisionConfig};
use async_trait::async_trait;
use serde_json::json;

/// Provider for OpenAI-compatible chat completion endpoints.
///
/// This covers the OpenAI API itself and the many inference servers
/// that speak the same protocol, including the multimodal ones used
/// for the Perception stage (image content parts).
pub struct OpenAiProvider {
    base_url: String,
    model: String,
    api_key_env: String,
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key_env: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            api_key_env: api_key_env.into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &OpenAiConfig) -> Self {
        Self::new(&config.base_url, &config.model, &config.api_key_env)
    }

    /// The Perception stage uses the same wire protocol with a
    /// multimodal model.
    pub fn from_vision_config(config: &VisionConfig) -> Self {
        Self::new(&config.base_url, &config.model, &config.api_key_env)
    }

    fn api_key(&self) -> super::Result<String> {
        std::env::var(&self.api_key_env).map_err(|_| {
            LlmError::AuthenticationFailed(format!("{} is not set", self.api_key_env))
        })
    }

    /// Render a message as OpenAI wire content: a plain string, or a
    /// content-part array when an image is attached.
    fn render_content(msg: &Message) -> serde_json::Value {
        match &msg.image {
            Some(image) => json!([
                { "type": "text", "text": msg.content },
                { "type": "image_url", "image_url": { "url": image.data_url() } },
            ]),
            None => json!(msg.content),
        }
    }
}

#[async_trait]
impl ChatModel for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn is_local(&self) -> bool {
        false
    }

    async fn check_health(&self) -> bool {
        std::env::var(&self.api_key_env).is_ok()
    }

    async fn generate(&self, messages: &[Message]) -> super::Result<String> {
        let api_key = self.api_key()?;
        let url = format!("{}/chat/completions", self.base_url);

        let api_messages: Vec<serde_json::Value> = messages
            .iter()
            .map(|msg| {
                json!({
                    "role": match msg.role {
                        MessageRole::System => "system",
                        MessageRole::Assistant => "assistant",
                        MessageRole::User => "user",
                    },
                    "content": Self::render_content(msg),
                })
            })
            .collect();

        let payload = json!({
            "model": self.model,
            "messages": api_messages,
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| LlmError::NetworkError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();

            return Err(match status.as_u16() {
                401 | 403 => LlmError::AuthenticationFailed(text),
                429 => LlmError::RateLimitExceeded,
                _ => LlmError::InvalidRequest(text),
            });
        }

        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::ParseError(e.to_string()))?;

        data.get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|t| t.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| LlmError::ParseError("No message content in response".to_string()))
    }
}

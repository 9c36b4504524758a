use super::{ChatModel, LlmError, Message};
use async_trait::async_trait;
use serde_json::json;

/// Provider for a local Ollama instance.
pub struct OllamaProvider {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ChatModel for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    fn is_local(&self) -> bool {
        true
    }

    async fn check_health(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        matches!(self.client.get(&url).send().await, Ok(r) if r.status().is_success())
    }

    async fn generate(&self, messages: &[Message]) -> super::Result<String> {
        let url = format!("{}/api/chat", self.base_url);

        let api_messages: Vec<serde_json::Value> = messages
            .iter()
            .map(|msg| {
                let mut m = json!({
                    "role": msg.role.to_string(),
                    "content": msg.content,
                });
                // Ollama takes raw base64 strings alongside the content
                if let Some(image) = &msg.image {
                    m["images"] = json!([image.data_b64]);
                }
                m
            })
            .collect();

        let payload = json!({
            "model": self.model,
            "messages": api_messages,
            "stream": false,
        });

        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| LlmError::NetworkError(e.to_string()))?;

        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::ProviderUnavailable(text));
        }

        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::ParseError(e.to_string()))?;

        data.get("message")
            .and_then(|m| m.get("content"))
            .and_then(|t| t.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| LlmError::ParseError("No message content in response".to_string()))
    }
}

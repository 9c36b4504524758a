use super::{ChatModel, LlmError, Message, MessageRole};
use crate::config::AnthropicConfig;
use async_trait::async_trait;
use serde_json::json;

pub struct AnthropicProvider {
    config: AnthropicConfig,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(config: AnthropicConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn api_key(&self) -> super::Result<String> {
        std::env::var(&self.config.api_key_env).map_err(|_| {
            LlmError::AuthenticationFailed(format!("{} is not set", self.config.api_key_env))
        })
    }
}

#[async_trait]
impl ChatModel for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn is_local(&self) -> bool {
        false
    }

    async fn check_health(&self) -> bool {
        std::env::var(&self.config.api_key_env).is_ok()
    }

    async fn generate(&self, messages: &[Message]) -> super::Result<String> {
        let api_key = self.api_key()?;
        let url = format!("{}/messages", self.config.base_url);

        let mut system_prompt = String::new();
        let mut api_messages = Vec::new();
        for msg in messages {
            if msg.role == MessageRole::System {
                system_prompt.push_str(&msg.content);
                system_prompt.push('\n');
                continue;
            }
            let role = if msg.role == MessageRole::Assistant {
                "assistant"
            } else {
                "user"
            };
            let content = match &msg.image {
                Some(image) => json!([
                    {
                        "type": "image",
                        "source": {
                            "type": "base64",
                            "media_type": image.media_type,
                            "data": image.data_b64,
                        }
                    },
                    { "type": "text", "text": msg.content },
                ]),
                None => json!(msg.content),
            };
            api_messages.push(json!({ "role": role, "content": content }));
        }

        let payload = json!({
            "model": self.config.model,
            "max_tokens": 4096,
            "system": system_prompt,
            "messages": api_messages,
        });

        let response = self
            .client
            .post(&url)
            .header("x-api-key", api_key)
            .header("anthropic-version", "2023-06-01")
            .header("Content-Type", "application/json")
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

        let content_arr = data
            .get("content")
            .and_then(|c| c.as_array())
            .ok_or_else(|| LlmError::ParseError("No content array in response".to_string()))?;

        let mut full_content = String::new();
        for item in content_arr {
            if let Some(text) = item.get("text").and_then(|t| t.as_str()) {
                full_content.push_str(text);
            }
        }

        Ok(full_content)
    }
}

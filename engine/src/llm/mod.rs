//! Chat/Vision Model Provider Abstraction Layer
//!
//! This module provides a common interface for the model collaborators
//! the pipeline consumes: the vision-language model behind Perception
//! and the chat model behind Hypothesis and holistic reasoning. The
//! `ChatModel` trait defines the contract that all providers implement,
//! enabling the router to fail over between providers transparently.
//!
//! Providers return raw text; the stage contracts own parsing and
//! validation, because a model's output only becomes shared state
//! after it passes the typed schema at the stage boundary.

use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::fmt;

use sdk::errors::GeoError;

pub mod anthropic;
pub mod ollama;
pub mod openai;
pub mod router;

pub use router::ModelRouter;

/// Result type for model operations
pub type Result<T> = std::result::Result<T, LlmError>;

/// Errors that can occur during model operations
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Timeout")]
    Timeout,

    #[error("Parse error: {0}")]
    ParseError(String),
}

impl From<LlmError> for GeoError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Timeout => GeoError::CollaboratorTimeout("model call".to_string()),
            LlmError::RateLimitExceeded => GeoError::RateLimited("model provider".to_string()),
            LlmError::ParseError(msg) => GeoError::Parse(msg),
            other => GeoError::CollaboratorUnavailable(other.to_string()),
        }
    }
}

/// An image inlined into a message, for multimodal providers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageAttachment {
    /// MIME type, e.g. "image/jpeg"
    pub media_type: String,

    /// Base64-encoded image bytes
    pub data_b64: String,
}

impl ImageAttachment {
    pub fn new(media_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            media_type: media_type.into(),
            data_b64: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }

    /// Data URL form used by OpenAI-compatible APIs.
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.media_type, self.data_b64)
    }
}

/// Message in a conversation history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Role of the message sender (user, assistant, system)
    pub role: MessageRole,

    /// Content of the message
    pub content: String,

    /// Optional inline image (vision requests)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageAttachment>,
}

impl Message {
    /// Create a new user message
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            image: None,
        }
    }

    /// Create a new user message carrying an image
    pub fn user_with_image(content: impl Into<String>, image: ImageAttachment) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            image: Some(image),
        }
    }

    /// Create a new assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            image: None,
        }
    }

    /// Create a new system message
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
            image: None,
        }
    }
}

/// Role of a message sender
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// User message
    User,

    /// Assistant message
    Assistant,

    /// System message
    System,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::System => write!(f, "system"),
        }
    }
}

/// Model provider trait that all providers must implement
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Returns the name of the provider (e.g., "openai", "anthropic", "ollama")
    fn name(&self) -> &str;

    /// Returns true if this is a local provider (e.g. Ollama)
    fn is_local(&self) -> bool;

    /// Check if the provider is currently healthy and available.
    /// Default implementation returns true.
    async fn check_health(&self) -> bool {
        true
    }

    /// Generate a completion for the conversation.
    ///
    /// Returns the raw text; callers parse at the stage boundary.
    async fn generate(&self, messages: &[Message]) -> Result<String>;
}

/// Extract the first JSON object embedded in model output.
///
/// Handles the formats models actually produce:
/// 1. The whole response is the object
/// 2. Fenced: ` ```json {...} ``` ` (with or without trailing prose)
/// 3. Object embedded in prose — scans for the first balanced `{...}`
pub fn extract_json_object(content: &str) -> Option<&str> {
    let trimmed = content.trim();

    if trimmed.starts_with('{') {
        if let Some(obj) = extract_balanced(trimmed, '{', '}') {
            return Some(obj);
        }
    }

    if let Some(inner) = extract_fenced(trimmed) {
        let inner = inner.trim();
        if inner.starts_with('{') {
            if let Some(obj) = extract_balanced(inner, '{', '}') {
                return Some(obj);
            }
        }
    }

    let pos = trimmed.find('{')?;
    extract_balanced(&trimmed[pos..], '{', '}')
}

/// Extract the first JSON array embedded in model output.
///
/// Same format handling as [`extract_json_object`].
pub fn extract_json_array(content: &str) -> Option<&str> {
    let trimmed = content.trim();

    if trimmed.starts_with('[') {
        if let Some(arr) = extract_balanced(trimmed, '[', ']') {
            return Some(arr);
        }
    }

    if let Some(inner) = extract_fenced(trimmed) {
        let inner = inner.trim();
        if inner.starts_with('[') {
            if let Some(arr) = extract_balanced(inner, '[', ']') {
                return Some(arr);
            }
        }
    }

    let pos = trimmed.find('[')?;
    extract_balanced(&trimmed[pos..], '[', ']')
}

/// Extract the body of the first markdown code fence in the text.
///
/// Works even when there is trailing prose after the closing ```.
/// Returns `None` if no fenced block is found.
fn extract_fenced(content: &str) -> Option<&str> {
    // Find opening fence
    let fence_start = content.find("```")?;
    let after_opening = &content[fence_start + 3..];

    // Skip the language tag line (e.g. "json\n")
    let body_start_rel = after_opening.find('\n')? + 1;
    let body_start = fence_start + 3 + body_start_rel;

    // Find closing fence after the body starts
    let closing = content[body_start..].find("```")?;
    let body_end = body_start + closing;

    if body_start >= body_end {
        return None;
    }

    Some(&content[body_start..body_end])
}

/// Extract a balanced delimiter span starting at position 0 of `s`.
///
/// Counts open/close depth, respecting string literals, to find the
/// matching close delimiter.
fn extract_balanced(s: &str, open: char, close: char) -> Option<&str> {
    if !s.starts_with(open) {
        return None;
    }
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, ch) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            c if c == open && !in_string => depth += 1,
            c if c == close && !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

//! Generation types

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Hard cap on tokens produced by one session
pub const DEFAULT_MAX_TOKENS: usize = 2048;

/// Tokens decoded and published per batch
pub const DEFAULT_PUBLISH_EVERY: usize = 4;

/// Role of a message in a conversation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

/// A message in a conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationOptions {
    pub max_tokens: usize,
    pub publish_every: usize,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_TOKENS,
            publish_every: DEFAULT_PUBLISH_EVERY,
        }
    }
}

/// Why a session stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Token cap reached
    Length,
    /// The backend signalled end of reply
    Stop,
    /// Cancelled by the caller; the text is what was produced so far
    Cancelled,
}

/// Final result of a session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationOutcome {
    pub session_id: Uuid,
    pub text: String,
    pub tokens: usize,
    pub finish: FinishReason,
}

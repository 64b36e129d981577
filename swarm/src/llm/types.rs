//! Chat completion request/response types
//!
//! Modeled on the OpenAI Chat Completions shape, which every configured
//! endpoint speaks.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// A completion request - everything needed for one model call
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// System prompt (rendered from a Handlebars template)
    pub system_prompt: String,

    /// Conversation turns after the system prompt
    pub messages: Vec<Message>,

    /// Max tokens for the response
    pub max_tokens: u32,

    /// Sampling temperature; the client default applies when unset
    pub temperature: Option<f32>,
}

impl CompletionRequest {
    pub fn new(system_prompt: impl Into<String>, messages: Vec<Message>, max_tokens: u32) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            messages,
            max_tokens,
            temperature: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// A message in the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    /// Create a user message
    pub fn user(text: impl Into<String>) -> Self {
        debug!("Message::user: called");
        Self {
            role: Role::User,
            content: text.into(),
        }
    }

    /// Create an assistant message
    pub fn assistant(text: impl Into<String>) -> Self {
        debug!("Message::assistant: called");
        Self {
            role: Role::Assistant,
            content: text.into(),
        }
    }

    pub fn char_len(&self) -> usize {
        self.content.chars().count()
    }
}

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// Response from a completion request
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    /// Text content (if any)
    pub content: Option<String>,

    /// Why the model stopped
    pub stop_reason: StopReason,

    /// Token usage for cost tracking
    pub usage: TokenUsage,

    /// Endpoint that served the request
    pub endpoint: Option<String>,
}

impl CompletionResponse {
    /// Text content, or empty when the model returned none
    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or_default()
    }

    pub fn is_truncated(&self) -> bool {
        self.stop_reason == StopReason::MaxTokens
    }
}

/// Why the model stopped generating
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    ContentFilter,
}

impl StopReason {
    /// Parse from an OpenAI `finish_reason` string
    pub fn from_openai(s: Option<&str>) -> Self {
        debug!(?s, "StopReason::from_openai: called");
        match s {
            Some("length") => StopReason::MaxTokens,
            Some("content_filter") => StopReason::ContentFilter,
            _ => StopReason::EndTurn,
        }
    }
}

/// Token usage for cost tracking
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Estimated cost in USD at a flat per-million-token rate
    pub fn cost_usd(&self, cost_per_million: f64) -> f64 {
        (self.total() as f64 / 1_000_000.0) * cost_per_million
    }
}

impl std::ops::AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_constructors() {
        let msg = Message::user("Hello");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.content, "Hello");

        let msg = Message::assistant("Hi there");
        assert_eq!(msg.role, Role::Assistant);
        assert_eq!(msg.char_len(), 8);
    }

    #[test]
    fn test_stop_reason_from_openai() {
        assert_eq!(StopReason::from_openai(Some("stop")), StopReason::EndTurn);
        assert_eq!(StopReason::from_openai(Some("length")), StopReason::MaxTokens);
        assert_eq!(StopReason::from_openai(Some("content_filter")), StopReason::ContentFilter);
        assert_eq!(StopReason::from_openai(None), StopReason::EndTurn);
    }

    #[test]
    fn test_token_usage_accumulates() {
        let mut usage = TokenUsage {
            input_tokens: 600_000,
            output_tokens: 400_000,
        };
        usage += TokenUsage {
            input_tokens: 500_000,
            output_tokens: 500_000,
        };

        assert_eq!(usage.total(), 2_000_000);
        assert!((usage.cost_usd(1.5) - 3.0).abs() < 1e-9);
    }
}

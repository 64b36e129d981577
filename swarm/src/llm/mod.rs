//! Planning model access
//!
//! A stateless completion trait, an OpenAI-compatible HTTP client and a
//! weighted router that spreads calls over several endpoints.

pub mod client;
mod error;
mod openai;
mod router;
mod types;

pub use client::LlmClient;
pub use error::LlmError;
pub use openai::OpenAIClient;
pub use router::{LlmRouter, Route};
pub use types::{CompletionRequest, CompletionResponse, Message, Role, StopReason, TokenUsage};

//! LLM transport port and implementations
//!
//! The engine never talks HTTP directly; it consumes the [`LlmTransport`]
//! trait. [`openai::OpenAiTransport`] is the shipped implementation for
//! OpenAI-compatible chat APIs; tests substitute mocks.

mod error;
pub mod limiter;
pub mod openai;
mod types;

use async_trait::async_trait;

pub use error::LlmError;
pub use limiter::{RateLimiter, RateLimiterStats};
pub use openai::OpenAiTransport;
pub use types::{ChatMessage, LlmRequest, LlmResponse, TokenUsage};

/// Capability to invoke a chat model.
#[async_trait]
pub trait LlmTransport: Send + Sync {
    async fn invoke(&self, request: LlmRequest) -> Result<LlmResponse, LlmError>;
}

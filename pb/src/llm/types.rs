//! LLM request/response types

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One chat message. Roles follow the provider convention
/// ("system" | "user" | "assistant").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }
}

/// A fully-resolved invocation: provider + model + rendered messages plus
/// any passthrough parameters (temperature, max_tokens, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    pub provider: String,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    /// Provider parameters forwarded verbatim into the request body.
    /// `provider` and `model` keys are stripped before forwarding.
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl LlmRequest {
    pub fn new(provider: impl Into<String>, model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            messages,
            params: Map::new(),
        }
    }

    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params = params;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    pub usage: TokenUsage,
    /// Provider-reported cost, when available.
    pub cost: Option<String>,
    pub latency_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_builder() {
        let mut params = Map::new();
        params.insert("temperature".to_string(), json!(0.2));

        let request = LlmRequest::new("openai", "gpt-4.1", vec![ChatMessage::user("hi")]).with_params(params);
        assert_eq!(request.provider, "openai");
        assert_eq!(request.messages.len(), 1);
        assert_eq!(request.params["temperature"], json!(0.2));
    }
}

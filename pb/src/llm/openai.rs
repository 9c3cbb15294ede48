//! OpenAI-compatible chat transport
//!
//! Implements [`LlmTransport`](super::LlmTransport) against the Chat
//! Completions wire format, which every provider the engine targets speaks.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{ChatMessage, LlmError, LlmRequest, LlmResponse, LlmTransport, TokenUsage};

/// Check if an HTTP status code is retryable
fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}

/// OpenAI-compatible API client
pub struct OpenAiTransport {
    api_key: String,
    base_url: String,
    http: Client,
}

impl OpenAiTransport {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Result<Self, LlmError> {
        let http = Client::builder().timeout(timeout).build().map_err(LlmError::Network)?;
        Ok(Self {
            api_key: api_key.into(),
            base_url: base_url.into(),
            http,
        })
    }

    /// Build a client from `OPENAI_API_KEY` (and optionally
    /// `OPENAI_BASE_URL`).
    pub fn from_env() -> Result<Self, LlmError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| LlmError::InvalidResponse("Environment variable OPENAI_API_KEY not set".to_string()))?;
        let base_url = std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        Self::new(base_url, api_key, Duration::from_secs(300))
    }

    fn build_request_body(&self, request: &LlmRequest) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|m: &ChatMessage| serde_json::json!({"role": m.role, "content": m.content}))
            .collect();

        let mut body = serde_json::json!({
            "model": request.model,
            "messages": messages,
        });

        // Forward caller parameters verbatim, minus routing keys.
        for (key, value) in &request.params {
            if key == "provider" || key == "model" {
                continue;
            }
            body[key] = value.clone();
        }

        body
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: i64,
    #[serde(default)]
    completion_tokens: i64,
    #[serde(default)]
    total_tokens: i64,
}

#[async_trait]
impl LlmTransport for OpenAiTransport {
    async fn invoke(&self, request: LlmRequest) -> Result<LlmResponse, LlmError> {
        let body = self.build_request_body(&request);
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        debug!(model = %request.model, %url, "invoke: sending chat completion");

        let started = Instant::now();
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(started.elapsed())
                } else {
                    LlmError::Network(e)
                }
            })?;

        let status = response.status().as_u16();
        if status == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(60));
            warn!(?retry_after, "invoke: rate limited by provider");
            return Err(LlmError::RateLimited { retry_after });
        }
        if !(200..300).contains(&status) {
            let message = response.text().await.unwrap_or_default();
            warn!(status, retryable = is_retryable_status(status), "invoke: API error");
            return Err(LlmError::ApiError { status, message });
        }

        let parsed: ApiResponse = response.json().await.map_err(LlmError::Network)?;
        let latency_ms = started.elapsed().as_millis() as i64;

        let text = parsed
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| LlmError::InvalidResponse("response contained no choices".to_string()))?;

        let usage = parsed.usage.unwrap_or_default();
        Ok(LlmResponse {
            text,
            usage: TokenUsage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
            },
            cost: None,
            latency_ms,
        })
    }
}

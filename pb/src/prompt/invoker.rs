//! Prompt-column invoker
//!
//! Resolves the latest prompt version, renders it, merges model params
//! with any per-column override, invokes the transport and records a
//! `requests` audit row. Audit writes are best-effort: a failed insert is
//! logged and never fails the evaluation.

use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use promptstore::RequestRecord;

use crate::error::{EngineError, EngineResult};
use crate::llm::{LlmRequest, LlmResponse, LlmTransport, TokenUsage};
use crate::state::StateManager;

use super::{PromptRenderer, PromptSource};

/// One prompt-template run.
#[derive(Debug, Clone)]
pub struct PromptRun {
    pub prompt_id: i64,
    pub project_id: i64,
    pub user_id: i64,
    /// Prompt variable name -> value, already mapped by the caller.
    pub variables: Map<String, Value>,
    pub model_override: Option<Map<String, Value>>,
}

#[derive(Debug, Clone)]
pub struct PromptRunOutcome {
    pub output: String,
    pub usage: TokenUsage,
    pub latency_ms: i64,
}

pub struct PromptInvoker {
    source: Arc<dyn PromptSource>,
    transport: Arc<dyn LlmTransport>,
    state: StateManager,
    renderer: PromptRenderer,
}

/// Pull provider/model routing out of a parameter map.
fn routing(params: &Map<String, Value>) -> (String, String) {
    let provider = params
        .get("provider")
        .and_then(Value::as_str)
        .unwrap_or("openai")
        .to_string();
    let model = params
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or("gpt-4.1")
        .to_string();
    (provider, model)
}

impl PromptInvoker {
    pub fn new(source: Arc<dyn PromptSource>, transport: Arc<dyn LlmTransport>, state: StateManager) -> Self {
        Self {
            source,
            transport,
            state,
            renderer: PromptRenderer::new(),
        }
    }

    /// Run a prompt version with the given variables.
    pub async fn run_prompt(&self, run: PromptRun) -> EngineResult<PromptRunOutcome> {
        debug!(prompt_id = run.prompt_id, "run_prompt: called");

        let version = self
            .source
            .latest_version(run.prompt_id)
            .await
            .ok_or_else(|| EngineError::NonRetryable(format!("no version found for prompt {}", run.prompt_id)))?;

        let messages = self.renderer.render_messages(&version.messages, &run.variables)?;

        let mut params = version.model_params.clone();
        if let Some(model_override) = &run.model_override {
            for (key, value) in model_override {
                params.insert(key.clone(), value.clone());
            }
        }
        let (provider, model) = routing(&params);

        let request = LlmRequest {
            provider,
            model,
            messages,
            params,
        };

        let response = self
            .call_llm(
                "evaluation",
                run.project_id,
                run.user_id,
                Some(run.prompt_id),
                Some(version.version_id),
                run.variables.clone(),
                request,
            )
            .await?;

        Ok(PromptRunOutcome {
            output: response.text,
            usage: response.usage,
            latency_ms: response.latency_ms,
        })
    }

    /// Invoke the transport and write the audit row. Used for both prompt
    /// runs and assertion calls so every invocation is accounted for.
    #[allow(clippy::too_many_arguments)]
    pub async fn call_llm(
        &self,
        source: &str,
        project_id: i64,
        user_id: i64,
        prompt_id: Option<i64>,
        prompt_version_id: Option<i64>,
        variables: Map<String, Value>,
        request: LlmRequest,
    ) -> EngineResult<LlmResponse> {
        let input = serde_json::to_value(&request.messages).ok();
        let result = self.transport.invoke(request).await;

        let mut record = RequestRecord::new(project_id, user_id, source);
        record.prompt_id = prompt_id;
        record.prompt_version_id = prompt_version_id;
        record.input = input;
        record.variables_values = variables;
        match &result {
            Ok(response) => {
                record.output = Some(response.text.clone());
                record.prompt_tokens = response.usage.prompt_tokens;
                record.completion_tokens = response.usage.completion_tokens;
                record.total_tokens = response.usage.total_tokens;
                record.execution_time_ms = response.latency_ms;
                record.cost = response.cost.clone();
            }
            Err(e) => {
                record.success = false;
                record.error_message = Some(e.to_string());
            }
        }

        let state = self.state.clone();
        tokio::spawn(async move {
            if let Err(e) = state.insert_request(record).await {
                warn!(error = %e, "Failed to write request audit row");
            }
        });

        result.map_err(EngineError::from)
    }
}

//! LLM invocation audit rows and per-project feature-model overrides

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::now_ms;

/// One row per LLM invocation, written best-effort after the call returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub id: i64,
    pub project_id: i64,
    pub user_id: i64,
    pub prompt_id: Option<i64>,
    pub prompt_version_id: Option<i64>,
    /// Where the call came from, e.g. "evaluation" or "llm_assertion".
    pub source: String,
    /// The rendered messages sent to the provider.
    pub input: Option<Value>,
    pub variables_values: Map<String, Value>,
    pub output: Option<String>,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub execution_time_ms: i64,
    pub cost: Option<String>,
    pub success: bool,
    pub error_message: Option<String>,
    pub created_at: i64,
}

impl RequestRecord {
    pub fn new(project_id: i64, user_id: i64, source: impl Into<String>) -> Self {
        Self {
            id: 0,
            project_id,
            user_id,
            prompt_id: None,
            prompt_version_id: None,
            source: source.into(),
            input: None,
            variables_values: Map::new(),
            output: None,
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
            execution_time_ms: 0,
            cost: None,
            success: true,
            error_message: None,
            created_at: now_ms(),
        }
    }
}

/// Configured provider/model for one AI feature of one project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureModel {
    pub id: i64,
    pub project_id: i64,
    pub feature_key: String,
    pub provider: String,
    pub model_id: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl FeatureModel {
    pub fn new(
        project_id: i64,
        feature_key: impl Into<String>,
        provider: impl Into<String>,
        model_id: impl Into<String>,
    ) -> Self {
        let now = now_ms();
        Self {
            id: 0,
            project_id,
            feature_key: feature_key.into(),
            provider: provider.into(),
            model_id: model_id.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

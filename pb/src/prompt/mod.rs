//! Prompt-version resolution, rendering and invocation
//!
//! The engine does not own prompt storage. It consumes [`PromptSource`]
//! for version lookup and [`FeatureModels`] for per-project model routing,
//! and funnels every LLM call through [`PromptInvoker`] so a `requests`
//! audit row is written for each invocation.

mod invoker;
mod loader;
mod render;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::llm::ChatMessage;
use crate::state::StateManager;

pub use invoker::{PromptInvoker, PromptRun, PromptRunOutcome};
pub use loader::FilePromptSource;
pub use render::PromptRenderer;

/// The latest version of a prompt, as the engine needs it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptVersionInfo {
    pub prompt_id: i64,
    pub version_id: i64,
    pub version_number: i64,
    pub name: String,
    pub messages: Vec<ChatMessage>,
    /// Default provider parameters; columns may override per run.
    #[serde(default)]
    pub model_params: Map<String, Value>,
}

/// Capability to resolve the latest version of a prompt.
#[async_trait]
pub trait PromptSource: Send + Sync {
    async fn latest_version(&self, prompt_id: i64) -> Option<PromptVersionInfo>;
}

/// The feature key the assertion predicate routes through.
pub const FEATURE_EVALUATION_LLM: &str = "evaluation_llm";

/// Built-in provider/model defaults per feature key.
pub fn default_feature_model(feature_key: &str) -> (&'static str, &'static str) {
    match feature_key {
        "prompt_assistant_mini" => ("openai", "gpt-4.1-mini"),
        // translate, test_case_generator, prompt_optimizer,
        // prompt_assistant_chat, evaluation_llm and anything unknown.
        _ => ("openai", "gpt-4.1"),
    }
}

/// Capability to resolve the provider/model for an AI feature.
#[async_trait]
pub trait FeatureModels: Send + Sync {
    async fn resolve(&self, project_id: i64, feature_key: &str) -> (String, String);
}

/// Feature-model lookup backed by the store, falling back to the built-in
/// defaults when the project holds no override (or the store errors).
pub struct StoreFeatureModels {
    state: StateManager,
}

impl StoreFeatureModels {
    pub fn new(state: StateManager) -> Self {
        Self { state }
    }
}

#[async_trait]
impl FeatureModels for StoreFeatureModels {
    async fn resolve(&self, project_id: i64, feature_key: &str) -> (String, String) {
        match self.state.feature_model(project_id, feature_key).await {
            Ok(Some(model)) => (model.provider, model.model_id),
            Ok(None) => {
                let (provider, model) = default_feature_model(feature_key);
                (provider.to_string(), model.to_string())
            }
            Err(e) => {
                tracing::warn!(project_id, feature_key, error = %e, "Feature model lookup failed, using default");
                let (provider, model) = default_feature_model(feature_key);
                (provider.to_string(), model.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_feature_models() {
        assert_eq!(default_feature_model("evaluation_llm"), ("openai", "gpt-4.1"));
        assert_eq!(default_feature_model("translate"), ("openai", "gpt-4.1"));
        assert_eq!(default_feature_model("prompt_assistant_mini"), ("openai", "gpt-4.1-mini"));
        assert_eq!(default_feature_model("made_up"), ("openai", "gpt-4.1"));
    }

    #[tokio::test]
    async fn test_store_feature_models_prefers_override() {
        let state = StateManager::spawn_in_memory().unwrap();
        let features = StoreFeatureModels::new(state.clone());

        let (provider, model) = features.resolve(1, FEATURE_EVALUATION_LLM).await;
        assert_eq!((provider.as_str(), model.as_str()), ("openai", "gpt-4.1"));

        state
            .upsert_feature_model(promptstore::FeatureModel::new(1, FEATURE_EVALUATION_LLM, "openai", "custom-judge"))
            .await
            .unwrap();
        let (_, model) = features.resolve(1, FEATURE_EVALUATION_LLM).await;
        assert_eq!(model, "custom-judge");

        // Other projects keep the default.
        let (_, model) = features.resolve(2, FEATURE_EVALUATION_LLM).await;
        assert_eq!(model, "gpt-4.1");

        state.shutdown().await.unwrap();
    }
}

//! Per-column evaluation dispatch
//!
//! One code path turns `(column, variables)` into a cell value, shared by
//! the column-task and row-task executors. Rate limiting is the caller's
//! decision: row batches with LLM-bearing runs pass `rate_limited = true`
//! and the dispatch acquires before each LLM call.

use serde_json::{Map, Value, json};
use std::sync::Arc;
use tracing::debug;

use promptstore::Column;

use crate::domain::ColumnSpec;
use crate::llm::RateLimiter;
use crate::predicate::{self, Verdict, coerce_str, stamp};
use crate::prompt::{FeatureModels, PromptInvoker, PromptRun};

/// The ports the dispatch needs, cheap to clone.
#[derive(Clone)]
pub struct EvalServices {
    pub invoker: Arc<PromptInvoker>,
    pub features: Arc<dyn FeatureModels>,
    pub limiter: Arc<RateLimiter>,
}

/// One column evaluation over a variable environment.
pub struct ColumnEval<'a> {
    pub column: &'a Column,
    pub variables: &'a Map<String, Value>,
    /// Current cell value, consulted by `human_input`.
    pub existing_cell_value: Option<&'a Value>,
    /// Whether LLM calls must pass the rate limiter first.
    pub rate_limited: bool,
}

/// Outcome of one column evaluation.
#[derive(Debug, Clone)]
pub struct ColumnOutcome {
    pub success: bool,
    /// Value merged into the execution variables under the column's name;
    /// `None` for dataset-variable columns whose map is already merged.
    pub variable_value: Option<Value>,
    /// What the cell stores on success.
    pub cell_value: Option<Value>,
    pub display_value: Option<Value>,
    pub details: Option<Value>,
    pub error: Option<String>,
    pub retryable: bool,
}

impl ColumnOutcome {
    fn failure(error: String, retryable: bool) -> Self {
        Self {
            success: false,
            variable_value: None,
            cell_value: None,
            display_value: None,
            details: None,
            error: Some(error),
            retryable,
        }
    }

    fn from_boolean_verdict(verdict: Verdict) -> Self {
        let passed = verdict.passed;
        let display = if passed { "passed" } else { "not passed" };
        Self {
            success: true,
            variable_value: Some(Value::Bool(passed)),
            cell_value: Some(json!({"value": passed})),
            display_value: Some(json!({"value": display})),
            details: Some(Value::Object(verdict.details)),
            error: None,
            retryable: false,
        }
    }

    fn from_value(value: Value, details: Option<Map<String, Value>>) -> Self {
        Self {
            success: true,
            variable_value: Some(value.clone()),
            cell_value: Some(json!({"value": value})),
            display_value: Some(json!({"value": value})),
            details: details.map(Value::Object),
            error: None,
            retryable: false,
        }
    }
}

fn lookup(variables: &Map<String, Value>, column: Option<&str>) -> String {
    column
        .and_then(|name| variables.get(name))
        .map(coerce_str)
        .unwrap_or_default()
}

/// Pull the produced value out of a helper verdict's details.
fn helper_value(verdict: &Verdict, fallback: &str) -> Value {
    for key in ["extracted_value", "parsed_value", "static_value", "coalesced_value", "count"] {
        if let Some(value) = verdict.detail(key) {
            return value.clone();
        }
    }
    Value::String(fallback.to_string())
}

/// Evaluate one column against the variable environment.
pub async fn evaluate_column(services: &EvalServices, eval: ColumnEval<'_>) -> ColumnOutcome {
    let column = eval.column;
    debug!(column_id = column.id, kind = %column.kind, "evaluate_column: called");

    let spec = match ColumnSpec::parse(column.kind, &column.config) {
        Ok(spec) => spec,
        Err(e) => return ColumnOutcome::failure(e.to_string(), false),
    };

    let output = lookup(eval.variables, spec.reference_column());
    let expected = lookup(eval.variables, spec.expected_column());
    let kind_name = column.kind.to_string();

    match &spec {
        ColumnSpec::DatasetVariable => ColumnOutcome {
            success: true,
            variable_value: None,
            cell_value: Some(Value::Object(eval.variables.clone())),
            display_value: Some(Value::Object(eval.variables.clone())),
            details: None,
            error: None,
            retryable: false,
        },

        ColumnSpec::HumanInput(config) => {
            let value = eval
                .existing_cell_value
                .and_then(|v| v.get("value"))
                .cloned()
                .unwrap_or_else(|| Value::String(config.default_value.clone()));
            ColumnOutcome::from_value(value, None)
        }

        ColumnSpec::PromptTemplate(config) => {
            let mut prompt_variables = Map::new();
            for (prompt_var, source_var) in &config.variable_mappings {
                if let Some(value) = eval.variables.get(source_var) {
                    prompt_variables.insert(prompt_var.clone(), value.clone());
                }
            }

            if eval.rate_limited {
                debug!(prompt_id = config.prompt_id, "evaluate_column: acquiring rate limiter");
                services.limiter.acquire().await;
            }

            let run = PromptRun {
                prompt_id: config.prompt_id,
                project_id: config.project_id.unwrap_or(1),
                user_id: config.user_id.unwrap_or(0),
                variables: prompt_variables,
                model_override: config.model_override.clone(),
            };
            match services.invoker.run_prompt(run).await {
                Ok(outcome) => {
                    let details = json!({
                        "tokens": outcome.usage,
                        "execution_time_ms": outcome.latency_ms,
                    });
                    let mut result = ColumnOutcome::from_value(Value::String(outcome.output), None);
                    result.details = Some(details);
                    result
                }
                Err(e) => ColumnOutcome::failure(e.to_string(), e.is_retryable()),
            }
        }

        ColumnSpec::Exact(config) => {
            let verdict = predicate::text::exact(&output, &expected, config);
            ColumnOutcome::from_boolean_verdict(stamp(verdict, &kind_name, &output, &expected))
        }
        ColumnSpec::Contains(config) => {
            let verdict = predicate::text::contains(&output, &expected, config);
            ColumnOutcome::from_boolean_verdict(stamp(verdict, &kind_name, &output, &expected))
        }
        ColumnSpec::Regex(config) => {
            let verdict = predicate::text::regex_match(&output, &expected, config);
            ColumnOutcome::from_boolean_verdict(stamp(verdict, &kind_name, &output, &expected))
        }
        ColumnSpec::ExactMulti(config) => {
            let verdict = predicate::multi::exact_multi(config, eval.variables);
            ColumnOutcome::from_boolean_verdict(stamp(verdict, &kind_name, "", ""))
        }
        ColumnSpec::Keywords(config) => {
            let verdict = predicate::text::keywords(&output, &expected, config);
            ColumnOutcome::from_boolean_verdict(stamp(verdict, &kind_name, &output, &expected))
        }
        ColumnSpec::JsonStructure(config) => {
            let verdict = predicate::json::json_structure(&output, &expected, config);
            ColumnOutcome::from_boolean_verdict(stamp(verdict, &kind_name, &output, &expected))
        }
        ColumnSpec::NumericDistance(config) => {
            let verdict = predicate::numeric::numeric_distance(&output, &expected, config);
            ColumnOutcome::from_boolean_verdict(stamp(verdict, &kind_name, &output, &expected))
        }
        ColumnSpec::CosineSimilarity(config) => {
            let verdict = predicate::llm::cosine_similarity(&output, &expected, config);
            ColumnOutcome::from_boolean_verdict(stamp(verdict, &kind_name, &output, &expected))
        }
        ColumnSpec::TypeValidation(config) => {
            let verdict = predicate::json::type_validation(&output, config);
            ColumnOutcome::from_boolean_verdict(stamp(verdict, &kind_name, &output, &expected))
        }

        ColumnSpec::LlmAssertion(config) => {
            if eval.rate_limited {
                debug!(column_id = column.id, "evaluate_column: acquiring rate limiter for assertion");
                services.limiter.acquire().await;
            }
            let verdict =
                predicate::llm::llm_assertion(&output, config, &services.invoker, services.features.as_ref()).await;
            ColumnOutcome::from_boolean_verdict(stamp(verdict, &kind_name, &output, &expected))
        }

        ColumnSpec::JsonExtraction(config) => {
            let verdict = predicate::json::json_extraction(&output, &expected, config);
            let value = if verdict.passed { helper_value(&verdict, &output) } else { Value::String(output.clone()) };
            let stamped = stamp(verdict, &kind_name, &output, &expected);
            ColumnOutcome::from_value(value, Some(stamped.details))
        }
        ColumnSpec::ParseValue(config) => {
            let verdict = predicate::json::parse_value(&output, &expected, config);
            let value = if verdict.passed { helper_value(&verdict, &output) } else { Value::String(output.clone()) };
            let stamped = stamp(verdict, &kind_name, &output, &expected);
            ColumnOutcome::from_value(value, Some(stamped.details))
        }
        ColumnSpec::StaticValue(config) => {
            let verdict = predicate::helpers::static_value(config);
            let value = helper_value(&verdict, &output);
            let stamped = stamp(verdict, &kind_name, &output, &expected);
            ColumnOutcome::from_value(value, Some(stamped.details))
        }
        ColumnSpec::Coalesce(config) => {
            let verdict = predicate::helpers::coalesce(&output, &expected, config);
            let value = helper_value(&verdict, &output);
            let stamped = stamp(verdict, &kind_name, &output, &expected);
            ColumnOutcome::from_value(value, Some(stamped.details))
        }
        ColumnSpec::Count(config) => {
            let verdict = predicate::numeric::count(&output, &expected, config);
            let value = if verdict.passed { helper_value(&verdict, &output) } else { Value::String(output.clone()) };
            let stamped = stamp(verdict, &kind_name, &output, &expected);
            ColumnOutcome::from_value(value, Some(stamped.details))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::llm::{ChatMessage, LlmError, LlmRequest, LlmResponse, LlmTransport, TokenUsage};
    use crate::prompt::{PromptSource, PromptVersionInfo, StoreFeatureModels};
    use crate::state::StateManager;
    use async_trait::async_trait;
    use promptstore::ColumnKind;

    struct CannedTransport(String);

    #[async_trait]
    impl LlmTransport for CannedTransport {
        async fn invoke(&self, _request: LlmRequest) -> Result<LlmResponse, LlmError> {
            Ok(LlmResponse {
                text: self.0.clone(),
                usage: TokenUsage::default(),
                cost: None,
                latency_ms: 1,
            })
        }
    }

    struct OnePromptSource;

    #[async_trait]
    impl PromptSource for OnePromptSource {
        async fn latest_version(&self, prompt_id: i64) -> Option<PromptVersionInfo> {
            Some(PromptVersionInfo {
                prompt_id,
                version_id: 1,
                version_number: 1,
                name: "p".to_string(),
                messages: vec![ChatMessage::user("{{question}}")],
                model_params: Map::new(),
            })
        }
    }

    async fn services(canned: &str) -> (EvalServices, StateManager) {
        let state = StateManager::spawn_in_memory().unwrap();
        let config = EngineConfig::default();
        let invoker = Arc::new(PromptInvoker::new(
            Arc::new(OnePromptSource),
            Arc::new(CannedTransport(canned.to_string())),
            state.clone(),
        ));
        let services = EvalServices {
            invoker,
            features: Arc::new(StoreFeatureModels::new(state.clone())),
            limiter: Arc::new(RateLimiter::new(config.llm_rate_qps, config.llm_rate_qpm)),
        };
        (services, state)
    }

    fn variables(entries: &[(&str, Value)]) -> Map<String, Value> {
        entries.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[tokio::test]
    async fn test_exact_column_produces_boolean_cell() {
        let (services, state) = services("unused").await;
        let column = Column::new(1, "verdict", ColumnKind::Exact, 2)
            .with_config(json!({"reference_column": "Q", "expected_column": "A"}));
        let vars = variables(&[("Q", json!("hi")), ("A", json!("hi"))]);

        let outcome = evaluate_column(
            &services,
            ColumnEval {
                column: &column,
                variables: &vars,
                existing_cell_value: None,
                rate_limited: false,
            },
        )
        .await;

        assert!(outcome.success);
        assert_eq!(outcome.variable_value, Some(json!(true)));
        assert_eq!(outcome.cell_value, Some(json!({"value": true})));
        assert_eq!(outcome.display_value, Some(json!({"value": "passed"})));
        state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_prompt_template_output_flows_to_variables() {
        let (services, state) = services("the answer").await;
        let column = Column::new(1, "answer", ColumnKind::PromptTemplate, 1)
            .with_config(json!({"prompt_id": 3, "variable_mappings": {"question": "q"}}));
        let vars = variables(&[("q", json!("why?"))]);

        let outcome = evaluate_column(
            &services,
            ColumnEval {
                column: &column,
                variables: &vars,
                existing_cell_value: None,
                rate_limited: false,
            },
        )
        .await;

        assert!(outcome.success);
        assert_eq!(outcome.variable_value, Some(json!("the answer")));
        state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_human_input_prefers_existing_cell() {
        let (services, state) = services("unused").await;
        let column =
            Column::new(1, "note", ColumnKind::HumanInput, 1).with_config(json!({"default_value": "fallback"}));

        let existing = json!({"value": "edited by hand"});
        let outcome = evaluate_column(
            &services,
            ColumnEval {
                column: &column,
                variables: &Map::new(),
                existing_cell_value: Some(&existing),
                rate_limited: false,
            },
        )
        .await;
        assert_eq!(outcome.variable_value, Some(json!("edited by hand")));

        let outcome = evaluate_column(
            &services,
            ColumnEval {
                column: &column,
                variables: &Map::new(),
                existing_cell_value: None,
                rate_limited: false,
            },
        )
        .await;
        assert_eq!(outcome.variable_value, Some(json!("fallback")));
        state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_json_extraction_column_value() {
        let (services, state) = services("unused").await;
        let column = Column::new(1, "extracted", ColumnKind::JsonExtraction, 2)
            .with_config(json!({"reference_column": "payload", "json_path": "items[0].name"}));
        let vars = variables(&[("payload", json!(r#"{"items":[{"name":"ok"}]}"#))]);

        let outcome = evaluate_column(
            &services,
            ColumnEval {
                column: &column,
                variables: &vars,
                existing_cell_value: None,
                rate_limited: false,
            },
        )
        .await;

        assert!(outcome.success);
        assert_eq!(outcome.variable_value, Some(json!("ok")));
        let details = outcome.details.unwrap();
        assert_eq!(details["extracted_value"], json!("ok"));
        state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_llm_assertion_column() {
        let (services, state) = services(r#"{"passed": true, "explanation": "polite enough"}"#).await;
        let column = Column::new(1, "judge", ColumnKind::LlmAssertion, 3)
            .with_config(json!({"assertion": "answer is polite", "reference_column": "answer"}));
        let vars = variables(&[("answer", json!("thank you kindly"))]);

        let outcome = evaluate_column(
            &services,
            ColumnEval {
                column: &column,
                variables: &vars,
                existing_cell_value: None,
                rate_limited: false,
            },
        )
        .await;

        assert!(outcome.success);
        assert_eq!(outcome.variable_value, Some(json!(true)));
        state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_config_is_terminal_failure() {
        let (services, state) = services("unused").await;
        let column = Column::new(1, "answer", ColumnKind::PromptTemplate, 1).with_config(json!({}));

        let outcome = evaluate_column(
            &services,
            ColumnEval {
                column: &column,
                variables: &Map::new(),
                existing_cell_value: None,
                rate_limited: false,
            },
        )
        .await;

        assert!(!outcome.success);
        assert!(!outcome.retryable);
        assert!(outcome.error.unwrap().contains("prompt_template"));
        state.shutdown().await.unwrap();
    }
}

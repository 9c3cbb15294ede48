//! Evaluation predicate library
//!
//! Each strategy is a pure function `(output, expected, config) -> Verdict`
//! over typed configs. The two LLM-backed strategies live in [`llm`] and
//! take the engine ports. Dispatch (resolving reference/expected columns,
//! stamping audit keys) happens in the executors.

pub mod helpers;
pub mod json;
pub mod llm;
pub mod multi;
pub mod numeric;
pub mod path;
pub mod text;

use serde_json::{Map, Value};

/// The outcome of one strategy application.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub passed: bool,
    pub details: Map<String, Value>,
}

impl Verdict {
    pub fn new(passed: bool, details: Value) -> Self {
        let details = match details {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("details".to_string(), other);
                map
            }
        };
        Self { passed, details }
    }

    pub fn pass(details: Value) -> Self {
        Self::new(true, details)
    }

    pub fn fail(details: Value) -> Self {
        Self::new(false, details)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::fail(serde_json::json!({"error": message.into()}))
    }

    /// A specific detail value, mostly for tests.
    pub fn detail(&self, key: &str) -> Option<&Value> {
        self.details.get(key)
    }
}

/// Stamp the audit keys every strategy records.
pub fn stamp(mut verdict: Verdict, strategy: &str, output: &str, expected: &str) -> Verdict {
    verdict
        .details
        .insert("strategy".to_string(), Value::String(strategy.to_string()));
    verdict
        .details
        .insert("output".to_string(), Value::String(output.to_string()));
    verdict
        .details
        .insert("expected_output".to_string(), Value::String(expected.to_string()));
    verdict.details.insert("match".to_string(), Value::Bool(verdict.passed));
    verdict
}

/// Render a JSON value the way a user typed it: strings bare, everything
/// else as compact JSON.
pub fn coerce_str(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

//! Dataset items
//!
//! The dataset itself (upload, CSV parsing, ownership) lives outside this
//! system; items are referenced by `dataset_id` alone. Only enabled items
//! participate in evaluation runs.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::now_ms;

/// One row of input variables plus an optional expected output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetItem {
    pub id: i64,
    pub dataset_id: i64,
    /// Variable name -> value. Always a JSON object, never a string blob.
    pub variables: Map<String, Value>,
    pub expected_output: Option<String>,
    pub enabled: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl DatasetItem {
    pub fn new(dataset_id: i64, variables: Map<String, Value>) -> Self {
        let now = now_ms();
        Self {
            id: 0,
            dataset_id,
            variables,
            expected_output: None,
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_expected(mut self, expected: impl Into<String>) -> Self {
        self.expected_output = Some(expected.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dataset_item_new() {
        let mut vars = Map::new();
        vars.insert("q".to_string(), Value::String("hi".to_string()));
        let item = DatasetItem::new(7, vars).with_expected("hi");

        assert_eq!(item.dataset_id, 7);
        assert!(item.enabled);
        assert_eq!(item.expected_output.as_deref(), Some("hi"));
        assert_eq!(item.variables.get("q").and_then(Value::as_str), Some("hi"));
    }
}

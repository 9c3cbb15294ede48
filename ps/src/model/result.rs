//! Results and cells
//!
//! A result is one execution instance of a pipeline; a cell is the output
//! of one column for one dataset item within that result.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;

use super::{ParseEnumError, now_ms};

/// How a result run was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    /// The mutable working copy used while editing a pipeline. At most one
    /// per pipeline.
    Staging,
    #[default]
    Release,
    Scheduled,
}

impl std::fmt::Display for RunType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Staging => write!(f, "staging"),
            Self::Release => write!(f, "release"),
            Self::Scheduled => write!(f, "scheduled"),
        }
    }
}

impl FromStr for RunType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "staging" => Ok(Self::Staging),
            "release" => Ok(Self::Release),
            "scheduled" => Ok(Self::Scheduled),
            other => Err(ParseEnumError::new("run type", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    #[default]
    New,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for ResultStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(ParseEnumError::new("result status", other)),
        }
    }
}

/// One execution of a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalResult {
    pub id: i64,
    pub pipeline_id: i64,
    pub run_type: RunType,
    pub status: ResultStatus,
    pub total: i64,
    pub passed: i64,
    pub unpassed: i64,
    pub failed: i64,
    pub success_rate: f64,
    /// Captured `prompt_id -> {version_id, version_number, ...}` mapping,
    /// taken at creation and never mutated thereafter.
    pub prompt_versions: Map<String, Value>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl EvalResult {
    pub fn new(pipeline_id: i64, run_type: RunType) -> Self {
        let now = now_ms();
        Self {
            id: 0,
            pipeline_id,
            run_type,
            status: ResultStatus::New,
            total: 0,
            passed: 0,
            unpassed: 0,
            failed: 0,
            success_rate: 0.0,
            prompt_versions: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_prompt_versions(mut self, versions: Map<String, Value>) -> Self {
        self.prompt_versions = versions;
        self
    }

    /// Whether this run contains LLM-bearing columns. Drives the row
    /// executor's serialisation decision.
    pub fn has_llm_calls(&self) -> bool {
        !self.prompt_versions.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CellStatus {
    #[default]
    New,
    Pending,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for CellStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for CellStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(ParseEnumError::new("cell status", other)),
        }
    }
}

/// Output of one column for one dataset item in one result.
///
/// Boolean predicate cells carry `{"value": bool}`; generative and
/// extractive cells carry `{"value": <string|json>}`; dataset-variable
/// cells carry the whole variables map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cell {
    pub id: i64,
    pub pipeline_id: i64,
    pub result_id: i64,
    pub dataset_item_id: i64,
    pub column_id: i64,
    pub status: CellStatus,
    pub value: Option<Value>,
    pub display_value: Option<Value>,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Cell {
    pub fn new(pipeline_id: i64, result_id: i64, dataset_item_id: i64, column_id: i64) -> Self {
        let now = now_ms();
        Self {
            id: 0,
            pipeline_id,
            result_id,
            dataset_item_id,
            column_id,
            status: CellStatus::New,
            value: None,
            display_value: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn completed_with(mut self, value: Value) -> Self {
        self.status = CellStatus::Completed;
        self.display_value = Some(value.clone());
        self.value = Some(value);
        self
    }

    /// The inner `value` key, if this cell holds the `{value: ...}` shape.
    pub fn inner_value(&self) -> Option<&Value> {
        self.value.as_ref().and_then(|v| v.get("value"))
    }

    /// Whether the cell's inner value counts as a pass for verdicts.
    pub fn is_truthy(&self) -> bool {
        match self.inner_value() {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => {
                matches!(s.to_lowercase().as_str(), "true" | "1" | "yes" | "pass" | "passed")
            }
            _ => false,
        }
    }
}

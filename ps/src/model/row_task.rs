//! Row-task execution records
//!
//! A row task runs every column of a pipeline, in position order, for a
//! single dataset item. Unique per `(result, dataset_item)`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;

use super::{ParseEnumError, now_ms};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RowTaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl RowTaskStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for RowTaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl FromStr for RowTaskStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(ParseEnumError::new("row task status", other)),
        }
    }
}

/// The verdict of one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowVerdict {
    /// Final boolean column evaluated truthy.
    Passed,
    /// Final boolean column evaluated falsy.
    Unpassed,
    /// Execution aborted with an error.
    Failed,
}

impl std::fmt::Display for RowVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Passed => write!(f, "passed"),
            Self::Unpassed => write!(f, "unpassed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for RowVerdict {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "passed" => Ok(Self::Passed),
            "unpassed" => Ok(Self::Unpassed),
            "failed" => Ok(Self::Failed),
            other => Err(ParseEnumError::new("row verdict", other)),
        }
    }
}

/// Persistent execution job for one dataset item of one result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowTask {
    pub id: i64,
    pub result_id: i64,
    pub dataset_item_id: i64,
    pub status: RowTaskStatus,
    pub row_result: Option<RowVerdict>,
    pub current_column_position: Option<i64>,
    pub execution_variables: Option<Map<String, Value>>,
    pub error_message: Option<String>,
    pub execution_time_ms: Option<i64>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl RowTask {
    pub fn new(result_id: i64, dataset_item_id: i64) -> Self {
        let now = now_ms();
        Self {
            id: 0,
            result_id,
            dataset_item_id,
            status: RowTaskStatus::Pending,
            row_result: None,
            current_column_position: None,
            execution_variables: None,
            error_message: None,
            execution_time_ms: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_finished()
    }

    pub fn is_successful(&self) -> bool {
        self.status == RowTaskStatus::Completed
            && matches!(self.row_result, Some(RowVerdict::Passed) | Some(RowVerdict::Unpassed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_task_lifecycle_flags() {
        let mut task = RowTask::new(1, 2);
        assert!(!task.is_finished());
        assert!(!task.is_successful());

        task.status = RowTaskStatus::Completed;
        task.row_result = Some(RowVerdict::Unpassed);
        assert!(task.is_finished());
        assert!(task.is_successful());

        task.status = RowTaskStatus::Failed;
        task.row_result = Some(RowVerdict::Failed);
        assert!(task.is_finished());
        assert!(!task.is_successful());
    }

    #[test]
    fn test_row_verdict_roundtrip() {
        for v in [RowVerdict::Passed, RowVerdict::Unpassed, RowVerdict::Failed] {
            assert_eq!(v.to_string().parse::<RowVerdict>().unwrap(), v);
        }
    }
}

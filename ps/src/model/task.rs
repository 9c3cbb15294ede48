//! Column-task execution records
//!
//! A column task advances one column across N dataset items; each item is a
//! task-item bound to exactly one cell. Task logs are append-only.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

use super::{ParseEnumError, now_ms};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Retrying,
}

impl TaskStatus {
    /// States that hold the single-flight key for `(result, column)`.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running | Self::Retrying)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Retrying => "retrying",
        };
        write!(f, "{s}")
    }
}

impl FromStr for TaskStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "retrying" => Ok(Self::Retrying),
            other => Err(ParseEnumError::new("task status", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskItemStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl TaskItemStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for TaskItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

impl FromStr for TaskItemStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(ParseEnumError::new("task item status", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LogLevel {
    #[serde(rename = "DEBUG")]
    Debug,
    #[default]
    #[serde(rename = "INFO")]
    Info,
    #[serde(rename = "WARN")]
    Warn,
    #[serde(rename = "ERROR")]
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

impl FromStr for LogLevel {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEBUG" => Ok(Self::Debug),
            "INFO" => Ok(Self::Info),
            "WARN" => Ok(Self::Warn),
            "ERROR" => Ok(Self::Error),
            other => Err(ParseEnumError::new("log level", other)),
        }
    }
}

/// Persistent execution job for one column of one result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnTask {
    pub id: i64,
    pub pipeline_id: i64,
    pub result_id: i64,
    pub column_id: i64,
    pub user_id: i64,
    pub status: TaskStatus,
    pub priority: i64,
    pub retries_max: i64,
    pub retries_done: i64,
    pub total_items: i64,
    pub completed_items: i64,
    pub failed_items: i64,
    pub config: Value,
    pub error_message: Option<String>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub next_retry_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ColumnTask {
    pub fn new(pipeline_id: i64, result_id: i64, column_id: i64, user_id: i64) -> Self {
        let now = now_ms();
        Self {
            id: 0,
            pipeline_id,
            result_id,
            column_id,
            user_id,
            status: TaskStatus::Pending,
            priority: 0,
            retries_max: 3,
            retries_done: 0,
            total_items: 0,
            completed_items: 0,
            failed_items: 0,
            config: Value::Null,
            error_message: None,
            started_at: None,
            completed_at: None,
            next_retry_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn progress_percentage(&self) -> f64 {
        if self.total_items == 0 {
            return 0.0;
        }
        (self.completed_items as f64 / self.total_items as f64) * 100.0
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn can_retry(&self) -> bool {
        self.status == TaskStatus::Failed && self.retries_done < self.retries_max
    }
}

/// A cell-scoped sub-job of a column task. Unique per `(task, cell)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskItem {
    pub id: i64,
    pub task_id: i64,
    pub cell_id: i64,
    pub dataset_item_id: i64,
    pub status: TaskItemStatus,
    pub retry_count: i64,
    pub input_data: Option<Value>,
    pub output_data: Option<Value>,
    pub error_message: Option<String>,
    pub execution_time_ms: Option<i64>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TaskItem {
    pub fn new(task_id: i64, cell_id: i64, dataset_item_id: i64) -> Self {
        let now = now_ms();
        Self {
            id: 0,
            task_id,
            cell_id,
            dataset_item_id,
            status: TaskItemStatus::Pending,
            retry_count: 0,
            input_data: None,
            output_data: None,
            error_message: None,
            execution_time_ms: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input_data = Some(input);
        self
    }
}

/// Append-only task event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLog {
    pub id: i64,
    pub task_id: i64,
    pub task_item_id: Option<i64>,
    pub level: LogLevel,
    pub message: String,
    pub details: Option<Value>,
    pub created_at: i64,
}

impl TaskLog {
    pub fn new(task_id: i64, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            id: 0,
            task_id,
            task_item_id: None,
            level,
            message: message.into(),
            details: None,
            created_at: now_ms(),
        }
    }

    pub fn with_item(mut self, task_item_id: i64) -> Self {
        self.task_item_id = Some(task_item_id);
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

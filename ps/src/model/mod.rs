//! Row types of the evaluation data model

mod dataset;
mod pipeline;
mod request;
mod result;
mod row_task;
mod task;

pub use dataset::DatasetItem;
pub use pipeline::{Column, ColumnKind, Pipeline};
pub use request::{FeatureModel, RequestRecord};
pub use result::{Cell, CellStatus, EvalResult, ResultStatus, RunType};
pub use row_task::{RowTask, RowTaskStatus, RowVerdict};
pub use task::{ColumnTask, LogLevel, TaskItem, TaskItemStatus, TaskLog, TaskStatus};

/// Current wall-clock time as unix milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Error raised when a stored enum string is not recognised.
#[derive(Debug, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    pub fn new(kind: &'static str, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}

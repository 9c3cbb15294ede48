//! Promptstore - persistent evaluation data model
//!
//! SQLite-backed storage for pipelines, columns, dataset items, results,
//! cells, column-tasks, task-items, row-tasks, task logs, LLM request audit
//! rows and per-project feature-model overrides.
//!
//! The store is intentionally dumb: it owns the schema, the row types and
//! the typed queries the engine needs, and nothing else. Business rules
//! (state machines, retries, aggregation) live in the `promptbench` crate,
//! which drives a `Store` from a single owning task.

pub mod model;
pub mod schema;
pub mod store;

pub use model::{
    Cell, CellStatus, Column, ColumnKind, ColumnTask, DatasetItem, EvalResult, FeatureModel, LogLevel, Pipeline,
    RequestRecord, ResultStatus, RowTask, RowTaskStatus, RowVerdict, RunType, TaskItem, TaskItemStatus, TaskLog,
    TaskStatus, now_ms,
};
pub use store::Store;

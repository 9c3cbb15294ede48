//! Commands processed by the StateManager actor

use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::oneshot;

use promptstore::{
    Cell, CellStatus, Column, ColumnTask, DatasetItem, EvalResult, FeatureModel, Pipeline, RequestRecord, ResultStatus,
    RowTask, RowVerdict, TaskItem, TaskLog, TaskStatus,
};

/// Errors returned by state operations
#[derive(Debug, Clone, Error)]
pub enum StateError {
    #[error("state channel closed")]
    ChannelError,

    #[error("store error: {0}")]
    Store(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A single-flight key is already held.
    #[error("conflict: {0}")]
    Conflict(String),
}

/// Response type for state operations
pub type StateResponse<T> = Result<T, StateError>;

type Reply<T> = oneshot::Sender<StateResponse<T>>;

/// Commands the actor understands. Every variant carries a reply channel;
/// mutations run as their own transaction inside the owning task.
pub enum StateCommand {
    // === pipelines, columns, dataset items ===
    CreatePipeline { pipeline: Pipeline, reply: Reply<i64> },
    GetPipeline { id: i64, reply: Reply<Option<Pipeline>> },
    SetPipelineDataset { pipeline_id: i64, dataset_id: i64, reply: Reply<()> },
    CreateColumn { column: Column, reply: Reply<i64> },
    GetColumn { id: i64, reply: Reply<Option<Column>> },
    ListColumns { pipeline_id: i64, reply: Reply<Vec<Column>> },
    MaxColumnPosition { pipeline_id: i64, reply: Reply<i64> },
    DeleteDatasetVariableColumns { pipeline_id: i64, reply: Reply<usize> },
    CreateDatasetItem { item: DatasetItem, reply: Reply<i64> },
    GetDatasetItem { id: i64, reply: Reply<Option<DatasetItem>> },
    ListDatasetItems {
        dataset_id: i64,
        only_enabled: bool,
        item_ids: Option<Vec<i64>>,
        reply: Reply<Vec<DatasetItem>>,
    },

    // === results and cells ===
    CreateResult { result: EvalResult, reply: Reply<i64> },
    GetResult { id: i64, reply: Reply<Option<EvalResult>> },
    StagingResult { pipeline_id: i64, reply: Reply<Option<EvalResult>> },
    UpdateResultStats {
        result_id: i64,
        status: ResultStatus,
        total: i64,
        passed: i64,
        unpassed: i64,
        failed: i64,
        success_rate: f64,
        reply: Reply<()>,
    },
    SetResultStatus { result_id: i64, status: ResultStatus, reply: Reply<()> },
    InsertCells { cells: Vec<Cell>, reply: Reply<usize> },
    GetCell {
        result_id: i64,
        dataset_item_id: i64,
        column_id: i64,
        reply: Reply<Option<Cell>>,
    },
    GetCellById { id: i64, reply: Reply<Option<Cell>> },
    UpdateCellCompleted {
        cell_id: i64,
        value: Value,
        display_value: Value,
        reply: Reply<()>,
    },
    UpdateCellFailed { cell_id: i64, error: String, reply: Reply<()> },
    ResetCellNew { cell_id: i64, reply: Reply<()> },
    DeleteResultCells { result_id: i64, reply: Reply<usize> },
    CellsForColumn {
        result_id: i64,
        column_id: i64,
        status: Option<CellStatus>,
        reply: Reply<Vec<Cell>>,
    },
    PreviousCells {
        result_id: i64,
        dataset_item_id: i64,
        before_position: i64,
        reply: Reply<Vec<(Column, Cell)>>,
    },

    // === column tasks, items, logs ===
    CreateColumnTask {
        task: ColumnTask,
        items: Vec<TaskItem>,
        reply: Reply<i64>,
    },
    GetColumnTask { id: i64, reply: Reply<Option<ColumnTask>> },
    StartColumnTask { task_id: i64, reply: Reply<()> },
    SetColumnTaskStatus {
        task_id: i64,
        status: TaskStatus,
        error_message: Option<String>,
        stamp_completed: bool,
        reply: Reply<bool>,
    },
    ScheduleColumnTaskRetry {
        task_id: i64,
        retries_done: i64,
        next_retry_at: i64,
        reply: Reply<()>,
    },
    UpdateColumnTaskProgress {
        task_id: i64,
        completed_items: i64,
        failed_items: i64,
        reply: Reply<()>,
    },
    ResetColumnTaskPending { task_id: i64, reply: Reply<()> },
    PendingColumnTasks { limit: usize, reply: Reply<Vec<ColumnTask>> },
    RetryableColumnTasks { now: i64, reply: Reply<Vec<ColumnTask>> },
    RunningColumnTasksStartedBefore { cutoff: i64, reply: Reply<Vec<ColumnTask>> },
    ColumnTasksForResult { result_id: i64, reply: Reply<Vec<ColumnTask>> },
    HasActiveTaskForColumn {
        result_id: i64,
        column_id: i64,
        reply: Reply<bool>,
    },
    GetTaskItem { id: i64, reply: Reply<Option<TaskItem>> },
    PendingTaskItems { task_id: i64, reply: Reply<Vec<TaskItem>> },
    StartTaskItem { item_id: i64, reply: Reply<()> },
    FinishTaskItem {
        item_id: i64,
        status: promptstore::TaskItemStatus,
        output_data: Option<Value>,
        input_data: Option<Value>,
        error_message: Option<String>,
        execution_time_ms: i64,
        reply: Reply<()>,
    },
    ResetFailedTaskItems { task_id: i64, reply: Reply<usize> },
    RunningTaskItem { task_id: i64, reply: Reply<Option<TaskItem>> },
    AppendTaskLog { log: TaskLog, reply: Reply<i64> },
    HasRecentTaskLog { task_id: i64, since: i64, reply: Reply<bool> },
    PurgeFinishedTasks { cutoff: i64, reply: Reply<usize> },
    PurgeLogs { cutoff: i64, reply: Reply<usize> },

    // === row tasks ===
    InsertRowTasks { tasks: Vec<RowTask>, reply: Reply<usize> },
    GetRowTask { id: i64, reply: Reply<Option<RowTask>> },
    PendingRowTasksForResult {
        result_id: i64,
        item_ids: Option<Vec<i64>>,
        reply: Reply<Vec<RowTask>>,
    },
    PendingRowTasks { limit: usize, reply: Reply<Vec<RowTask>> },
    MarkRowTasksRunning { ids: Vec<i64>, reply: Reply<()> },
    UpdateRowTaskPosition {
        row_task_id: i64,
        position: i64,
        reply: Reply<()>,
    },
    CompleteRowTask {
        row_task_id: i64,
        verdict: RowVerdict,
        execution_variables: Map<String, Value>,
        execution_time_ms: i64,
        reply: Reply<()>,
    },
    FailRowTask {
        row_task_id: i64,
        error: String,
        execution_time_ms: i64,
        reply: Reply<()>,
    },
    ResetRowTaskPending { row_task_id: i64, reply: Reply<()> },
    RunningRowTasksStartedBefore { cutoff: i64, reply: Reply<Vec<RowTask>> },
    RowTaskQuietSince {
        row_task_id: i64,
        cutoff: i64,
        reply: Reply<bool>,
    },
    RowTasksForResult { result_id: i64, reply: Reply<Vec<RowTask>> },

    // === requests and feature models ===
    InsertRequest { record: RequestRecord, reply: Reply<i64> },
    FeatureModel {
        project_id: i64,
        feature_key: String,
        reply: Reply<Option<FeatureModel>>,
    },
    UpsertFeatureModel { model: FeatureModel, reply: Reply<()> },

    Shutdown,
}

//! StateManager - actor that owns the Store
//!
//! Processes commands via channels so the SQLite connection lives on
//! exactly one task; callers get a cheap cloneable handle.

use serde_json::{Map, Value};
use std::path::Path;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use promptstore::{
    Cell, CellStatus, Column, ColumnTask, DatasetItem, EvalResult, FeatureModel, Pipeline, RequestRecord, ResultStatus,
    RowTask, RowVerdict, Store, TaskItem, TaskItemStatus, TaskLog, TaskStatus,
};

use super::messages::{StateCommand, StateError, StateResponse};

/// Handle to send commands to the StateManager
#[derive(Clone)]
pub struct StateManager {
    tx: mpsc::Sender<StateCommand>,
}

fn store_err(e: eyre::Report) -> StateError {
    StateError::Store(format!("{e:#}"))
}

impl StateManager {
    /// Spawn a new StateManager actor over the store at `path`.
    pub fn spawn(path: impl AsRef<Path>) -> eyre::Result<Self> {
        debug!(path = %path.as_ref().display(), "spawn: called");
        let store = Store::open(path)?;
        Ok(Self::spawn_with_store(store))
    }

    /// Spawn over an in-memory store, used by tests.
    pub fn spawn_in_memory() -> eyre::Result<Self> {
        Ok(Self::spawn_with_store(Store::open_in_memory()?))
    }

    fn spawn_with_store(store: Store) -> Self {
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(actor_loop(store, rx));
        info!("StateManager spawned");
        Self { tx }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<StateResponse<T>>) -> StateCommand,
    ) -> StateResponse<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| StateError::ChannelError)?;
        reply_rx.await.map_err(|_| StateError::ChannelError)?
    }

    /// Shutdown the StateManager
    pub async fn shutdown(&self) -> Result<(), StateError> {
        debug!("shutdown: called");
        self.tx
            .send(StateCommand::Shutdown)
            .await
            .map_err(|_| StateError::ChannelError)
    }

    // === pipelines, columns, dataset items ===

    pub async fn create_pipeline(&self, pipeline: Pipeline) -> StateResponse<i64> {
        self.request(|reply| StateCommand::CreatePipeline { pipeline, reply }).await
    }

    pub async fn get_pipeline(&self, id: i64) -> StateResponse<Option<Pipeline>> {
        self.request(|reply| StateCommand::GetPipeline { id, reply }).await
    }

    /// Get a pipeline, erroring when absent.
    pub async fn get_pipeline_required(&self, id: i64) -> StateResponse<Pipeline> {
        self.get_pipeline(id)
            .await?
            .ok_or_else(|| StateError::NotFound(format!("pipeline {id}")))
    }

    pub async fn set_pipeline_dataset(&self, pipeline_id: i64, dataset_id: i64) -> StateResponse<()> {
        self.request(|reply| StateCommand::SetPipelineDataset {
            pipeline_id,
            dataset_id,
            reply,
        })
        .await
    }

    pub async fn create_column(&self, column: Column) -> StateResponse<i64> {
        self.request(|reply| StateCommand::CreateColumn { column, reply }).await
    }

    pub async fn get_column(&self, id: i64) -> StateResponse<Option<Column>> {
        self.request(|reply| StateCommand::GetColumn { id, reply }).await
    }

    pub async fn get_column_required(&self, id: i64) -> StateResponse<Column> {
        self.get_column(id)
            .await?
            .ok_or_else(|| StateError::NotFound(format!("column {id}")))
    }

    pub async fn list_columns(&self, pipeline_id: i64) -> StateResponse<Vec<Column>> {
        self.request(|reply| StateCommand::ListColumns { pipeline_id, reply }).await
    }

    pub async fn max_column_position(&self, pipeline_id: i64) -> StateResponse<i64> {
        self.request(|reply| StateCommand::MaxColumnPosition { pipeline_id, reply })
            .await
    }

    pub async fn delete_dataset_variable_columns(&self, pipeline_id: i64) -> StateResponse<usize> {
        self.request(|reply| StateCommand::DeleteDatasetVariableColumns { pipeline_id, reply })
            .await
    }

    pub async fn create_dataset_item(&self, item: DatasetItem) -> StateResponse<i64> {
        self.request(|reply| StateCommand::CreateDatasetItem { item, reply }).await
    }

    pub async fn get_dataset_item(&self, id: i64) -> StateResponse<Option<DatasetItem>> {
        self.request(|reply| StateCommand::GetDatasetItem { id, reply }).await
    }

    pub async fn list_dataset_items(
        &self,
        dataset_id: i64,
        only_enabled: bool,
        item_ids: Option<Vec<i64>>,
    ) -> StateResponse<Vec<DatasetItem>> {
        self.request(|reply| StateCommand::ListDatasetItems {
            dataset_id,
            only_enabled,
            item_ids,
            reply,
        })
        .await
    }

    // === results and cells ===

    pub async fn create_result(&self, result: EvalResult) -> StateResponse<i64> {
        self.request(|reply| StateCommand::CreateResult { result, reply }).await
    }

    pub async fn get_result(&self, id: i64) -> StateResponse<Option<EvalResult>> {
        self.request(|reply| StateCommand::GetResult { id, reply }).await
    }

    pub async fn get_result_required(&self, id: i64) -> StateResponse<EvalResult> {
        self.get_result(id)
            .await?
            .ok_or_else(|| StateError::NotFound(format!("result {id}")))
    }

    pub async fn staging_result(&self, pipeline_id: i64) -> StateResponse<Option<EvalResult>> {
        self.request(|reply| StateCommand::StagingResult { pipeline_id, reply })
            .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn update_result_stats(
        &self,
        result_id: i64,
        status: ResultStatus,
        total: i64,
        passed: i64,
        unpassed: i64,
        failed: i64,
        success_rate: f64,
    ) -> StateResponse<()> {
        self.request(|reply| StateCommand::UpdateResultStats {
            result_id,
            status,
            total,
            passed,
            unpassed,
            failed,
            success_rate,
            reply,
        })
        .await
    }

    pub async fn set_result_status(&self, result_id: i64, status: ResultStatus) -> StateResponse<()> {
        self.request(|reply| StateCommand::SetResultStatus {
            result_id,
            status,
            reply,
        })
        .await
    }

    pub async fn insert_cells(&self, cells: Vec<Cell>) -> StateResponse<usize> {
        self.request(|reply| StateCommand::InsertCells { cells, reply }).await
    }

    pub async fn get_cell(&self, result_id: i64, dataset_item_id: i64, column_id: i64) -> StateResponse<Option<Cell>> {
        self.request(|reply| StateCommand::GetCell {
            result_id,
            dataset_item_id,
            column_id,
            reply,
        })
        .await
    }

    pub async fn get_cell_by_id(&self, id: i64) -> StateResponse<Option<Cell>> {
        self.request(|reply| StateCommand::GetCellById { id, reply }).await
    }

    pub async fn update_cell_completed(&self, cell_id: i64, value: Value, display_value: Value) -> StateResponse<()> {
        self.request(|reply| StateCommand::UpdateCellCompleted {
            cell_id,
            value,
            display_value,
            reply,
        })
        .await
    }

    pub async fn update_cell_failed(&self, cell_id: i64, error: String) -> StateResponse<()> {
        self.request(|reply| StateCommand::UpdateCellFailed { cell_id, error, reply })
            .await
    }

    pub async fn reset_cell_new(&self, cell_id: i64) -> StateResponse<()> {
        self.request(|reply| StateCommand::ResetCellNew { cell_id, reply }).await
    }

    pub async fn delete_result_cells(&self, result_id: i64) -> StateResponse<usize> {
        self.request(|reply| StateCommand::DeleteResultCells { result_id, reply })
            .await
    }

    pub async fn cells_for_column(
        &self,
        result_id: i64,
        column_id: i64,
        status: Option<CellStatus>,
    ) -> StateResponse<Vec<Cell>> {
        self.request(|reply| StateCommand::CellsForColumn {
            result_id,
            column_id,
            status,
            reply,
        })
        .await
    }

    pub async fn previous_cells(
        &self,
        result_id: i64,
        dataset_item_id: i64,
        before_position: i64,
    ) -> StateResponse<Vec<(Column, Cell)>> {
        self.request(|reply| StateCommand::PreviousCells {
            result_id,
            dataset_item_id,
            before_position,
            reply,
        })
        .await
    }

    // === column tasks, items, logs ===

    /// Create a task with its items; fails with `Conflict` when the
    /// `(result, column)` single-flight key is already held.
    pub async fn create_column_task(&self, task: ColumnTask, items: Vec<TaskItem>) -> StateResponse<i64> {
        self.request(|reply| StateCommand::CreateColumnTask { task, items, reply })
            .await
    }

    pub async fn get_column_task(&self, id: i64) -> StateResponse<Option<ColumnTask>> {
        self.request(|reply| StateCommand::GetColumnTask { id, reply }).await
    }

    pub async fn get_column_task_required(&self, id: i64) -> StateResponse<ColumnTask> {
        self.get_column_task(id)
            .await?
            .ok_or_else(|| StateError::NotFound(format!("column task {id}")))
    }

    pub async fn start_column_task(&self, task_id: i64) -> StateResponse<()> {
        self.request(|reply| StateCommand::StartColumnTask { task_id, reply }).await
    }

    pub async fn set_column_task_status(
        &self,
        task_id: i64,
        status: TaskStatus,
        error_message: Option<String>,
        stamp_completed: bool,
    ) -> StateResponse<bool> {
        self.request(|reply| StateCommand::SetColumnTaskStatus {
            task_id,
            status,
            error_message,
            stamp_completed,
            reply,
        })
        .await
    }

    pub async fn schedule_column_task_retry(
        &self,
        task_id: i64,
        retries_done: i64,
        next_retry_at: i64,
    ) -> StateResponse<()> {
        self.request(|reply| StateCommand::ScheduleColumnTaskRetry {
            task_id,
            retries_done,
            next_retry_at,
            reply,
        })
        .await
    }

    pub async fn update_column_task_progress(
        &self,
        task_id: i64,
        completed_items: i64,
        failed_items: i64,
    ) -> StateResponse<()> {
        self.request(|reply| StateCommand::UpdateColumnTaskProgress {
            task_id,
            completed_items,
            failed_items,
            reply,
        })
        .await
    }

    pub async fn reset_column_task_pending(&self, task_id: i64) -> StateResponse<()> {
        self.request(|reply| StateCommand::ResetColumnTaskPending { task_id, reply })
            .await
    }

    pub async fn pending_column_tasks(&self, limit: usize) -> StateResponse<Vec<ColumnTask>> {
        self.request(|reply| StateCommand::PendingColumnTasks { limit, reply })
            .await
    }

    pub async fn retryable_column_tasks(&self, now: i64) -> StateResponse<Vec<ColumnTask>> {
        self.request(|reply| StateCommand::RetryableColumnTasks { now, reply })
            .await
    }

    pub async fn running_column_tasks_started_before(&self, cutoff: i64) -> StateResponse<Vec<ColumnTask>> {
        self.request(|reply| StateCommand::RunningColumnTasksStartedBefore { cutoff, reply })
            .await
    }

    pub async fn column_tasks_for_result(&self, result_id: i64) -> StateResponse<Vec<ColumnTask>> {
        self.request(|reply| StateCommand::ColumnTasksForResult { result_id, reply })
            .await
    }

    pub async fn has_active_task_for_column(&self, result_id: i64, column_id: i64) -> StateResponse<bool> {
        self.request(|reply| StateCommand::HasActiveTaskForColumn {
            result_id,
            column_id,
            reply,
        })
        .await
    }

    pub async fn get_task_item(&self, id: i64) -> StateResponse<Option<TaskItem>> {
        self.request(|reply| StateCommand::GetTaskItem { id, reply }).await
    }

    pub async fn pending_task_items(&self, task_id: i64) -> StateResponse<Vec<TaskItem>> {
        self.request(|reply| StateCommand::PendingTaskItems { task_id, reply })
            .await
    }

    pub async fn start_task_item(&self, item_id: i64) -> StateResponse<()> {
        self.request(|reply| StateCommand::StartTaskItem { item_id, reply }).await
    }

    pub async fn finish_task_item(
        &self,
        item_id: i64,
        status: TaskItemStatus,
        output_data: Option<Value>,
        input_data: Option<Value>,
        error_message: Option<String>,
        execution_time_ms: i64,
    ) -> StateResponse<()> {
        self.request(|reply| StateCommand::FinishTaskItem {
            item_id,
            status,
            output_data,
            input_data,
            error_message,
            execution_time_ms,
            reply,
        })
        .await
    }

    pub async fn reset_failed_task_items(&self, task_id: i64) -> StateResponse<usize> {
        self.request(|reply| StateCommand::ResetFailedTaskItems { task_id, reply })
            .await
    }

    pub async fn running_task_item(&self, task_id: i64) -> StateResponse<Option<TaskItem>> {
        self.request(|reply| StateCommand::RunningTaskItem { task_id, reply })
            .await
    }

    pub async fn append_task_log(&self, log: TaskLog) -> StateResponse<i64> {
        self.request(|reply| StateCommand::AppendTaskLog { log, reply }).await
    }

    pub async fn has_recent_task_log(&self, task_id: i64, since: i64) -> StateResponse<bool> {
        self.request(|reply| StateCommand::HasRecentTaskLog { task_id, since, reply })
            .await
    }

    pub async fn purge_finished_tasks(&self, cutoff: i64) -> StateResponse<usize> {
        self.request(|reply| StateCommand::PurgeFinishedTasks { cutoff, reply })
            .await
    }

    pub async fn purge_logs(&self, cutoff: i64) -> StateResponse<usize> {
        self.request(|reply| StateCommand::PurgeLogs { cutoff, reply }).await
    }

    // === row tasks ===

    pub async fn insert_row_tasks(&self, tasks: Vec<RowTask>) -> StateResponse<usize> {
        self.request(|reply| StateCommand::InsertRowTasks { tasks, reply }).await
    }

    pub async fn get_row_task(&self, id: i64) -> StateResponse<Option<RowTask>> {
        self.request(|reply| StateCommand::GetRowTask { id, reply }).await
    }

    pub async fn get_row_task_required(&self, id: i64) -> StateResponse<RowTask> {
        self.get_row_task(id)
            .await?
            .ok_or_else(|| StateError::NotFound(format!("row task {id}")))
    }

    pub async fn pending_row_tasks_for_result(
        &self,
        result_id: i64,
        item_ids: Option<Vec<i64>>,
    ) -> StateResponse<Vec<RowTask>> {
        self.request(|reply| StateCommand::PendingRowTasksForResult {
            result_id,
            item_ids,
            reply,
        })
        .await
    }

    pub async fn pending_row_tasks(&self, limit: usize) -> StateResponse<Vec<RowTask>> {
        self.request(|reply| StateCommand::PendingRowTasks { limit, reply }).await
    }

    pub async fn mark_row_tasks_running(&self, ids: Vec<i64>) -> StateResponse<()> {
        self.request(|reply| StateCommand::MarkRowTasksRunning { ids, reply })
            .await
    }

    pub async fn update_row_task_position(&self, row_task_id: i64, position: i64) -> StateResponse<()> {
        self.request(|reply| StateCommand::UpdateRowTaskPosition {
            row_task_id,
            position,
            reply,
        })
        .await
    }

    pub async fn complete_row_task(
        &self,
        row_task_id: i64,
        verdict: RowVerdict,
        execution_variables: Map<String, Value>,
        execution_time_ms: i64,
    ) -> StateResponse<()> {
        self.request(|reply| StateCommand::CompleteRowTask {
            row_task_id,
            verdict,
            execution_variables,
            execution_time_ms,
            reply,
        })
        .await
    }

    pub async fn fail_row_task(&self, row_task_id: i64, error: String, execution_time_ms: i64) -> StateResponse<()> {
        self.request(|reply| StateCommand::FailRowTask {
            row_task_id,
            error,
            execution_time_ms,
            reply,
        })
        .await
    }

    pub async fn reset_row_task_pending(&self, row_task_id: i64) -> StateResponse<()> {
        self.request(|reply| StateCommand::ResetRowTaskPending { row_task_id, reply })
            .await
    }

    pub async fn running_row_tasks_started_before(&self, cutoff: i64) -> StateResponse<Vec<RowTask>> {
        self.request(|reply| StateCommand::RunningRowTasksStartedBefore { cutoff, reply })
            .await
    }

    pub async fn row_task_quiet_since(&self, row_task_id: i64, cutoff: i64) -> StateResponse<bool> {
        self.request(|reply| StateCommand::RowTaskQuietSince {
            row_task_id,
            cutoff,
            reply,
        })
        .await
    }

    pub async fn row_tasks_for_result(&self, result_id: i64) -> StateResponse<Vec<RowTask>> {
        self.request(|reply| StateCommand::RowTasksForResult { result_id, reply })
            .await
    }

    // === requests and feature models ===

    pub async fn insert_request(&self, record: RequestRecord) -> StateResponse<i64> {
        self.request(|reply| StateCommand::InsertRequest { record, reply }).await
    }

    pub async fn feature_model(&self, project_id: i64, feature_key: &str) -> StateResponse<Option<FeatureModel>> {
        let feature_key = feature_key.to_string();
        self.request(|reply| StateCommand::FeatureModel {
            project_id,
            feature_key,
            reply,
        })
        .await
    }

    pub async fn upsert_feature_model(&self, model: FeatureModel) -> StateResponse<()> {
        self.request(|reply| StateCommand::UpsertFeatureModel { model, reply })
            .await
    }
}

/// The actor loop that owns the Store and processes commands
async fn actor_loop(mut store: Store, mut rx: mpsc::Receiver<StateCommand>) {
    debug!("StateManager actor started");

    while let Some(cmd) = rx.recv().await {
        match cmd {
            StateCommand::CreatePipeline { pipeline, reply } => {
                let _ = reply.send(store.create_pipeline(&pipeline).map_err(store_err));
            }
            StateCommand::GetPipeline { id, reply } => {
                let _ = reply.send(store.get_pipeline(id).map_err(store_err));
            }
            StateCommand::SetPipelineDataset {
                pipeline_id,
                dataset_id,
                reply,
            } => {
                let _ = reply.send(store.set_pipeline_dataset(pipeline_id, dataset_id).map_err(store_err));
            }
            StateCommand::CreateColumn { column, reply } => {
                let _ = reply.send(store.create_column(&column).map_err(store_err));
            }
            StateCommand::GetColumn { id, reply } => {
                let _ = reply.send(store.get_column(id).map_err(store_err));
            }
            StateCommand::ListColumns { pipeline_id, reply } => {
                let _ = reply.send(store.list_columns(pipeline_id).map_err(store_err));
            }
            StateCommand::MaxColumnPosition { pipeline_id, reply } => {
                let _ = reply.send(store.max_column_position(pipeline_id).map_err(store_err));
            }
            StateCommand::DeleteDatasetVariableColumns { pipeline_id, reply } => {
                let _ = reply.send(store.delete_dataset_variable_columns(pipeline_id).map_err(store_err));
            }
            StateCommand::CreateDatasetItem { item, reply } => {
                let _ = reply.send(store.create_dataset_item(&item).map_err(store_err));
            }
            StateCommand::GetDatasetItem { id, reply } => {
                let _ = reply.send(store.get_dataset_item(id).map_err(store_err));
            }
            StateCommand::ListDatasetItems {
                dataset_id,
                only_enabled,
                item_ids,
                reply,
            } => {
                let _ = reply.send(
                    store
                        .list_dataset_items(dataset_id, only_enabled, item_ids.as_deref())
                        .map_err(store_err),
                );
            }

            StateCommand::CreateResult { result, reply } => {
                let _ = reply.send(store.create_result(&result).map_err(store_err));
            }
            StateCommand::GetResult { id, reply } => {
                let _ = reply.send(store.get_result(id).map_err(store_err));
            }
            StateCommand::StagingResult { pipeline_id, reply } => {
                let _ = reply.send(store.staging_result(pipeline_id).map_err(store_err));
            }
            StateCommand::UpdateResultStats {
                result_id,
                status,
                total,
                passed,
                unpassed,
                failed,
                success_rate,
                reply,
            } => {
                let _ = reply.send(
                    store
                        .update_result_stats(result_id, status, total, passed, unpassed, failed, success_rate)
                        .map_err(store_err),
                );
            }
            StateCommand::SetResultStatus {
                result_id,
                status,
                reply,
            } => {
                let _ = reply.send(store.set_result_status(result_id, status).map_err(store_err));
            }
            StateCommand::InsertCells { cells, reply } => {
                let _ = reply.send(store.insert_cells(&cells).map_err(store_err));
            }
            StateCommand::GetCell {
                result_id,
                dataset_item_id,
                column_id,
                reply,
            } => {
                let _ = reply.send(store.get_cell(result_id, dataset_item_id, column_id).map_err(store_err));
            }
            StateCommand::GetCellById { id, reply } => {
                let _ = reply.send(store.get_cell_by_id(id).map_err(store_err));
            }
            StateCommand::UpdateCellCompleted {
                cell_id,
                value,
                display_value,
                reply,
            } => {
                let _ = reply.send(store.update_cell_completed(cell_id, &value, &display_value).map_err(store_err));
            }
            StateCommand::UpdateCellFailed { cell_id, error, reply } => {
                let _ = reply.send(store.update_cell_failed(cell_id, &error).map_err(store_err));
            }
            StateCommand::ResetCellNew { cell_id, reply } => {
                let _ = reply.send(store.reset_cell_new(cell_id).map_err(store_err));
            }
            StateCommand::DeleteResultCells { result_id, reply } => {
                let _ = reply.send(store.delete_result_cells(result_id).map_err(store_err));
            }
            StateCommand::CellsForColumn {
                result_id,
                column_id,
                status,
                reply,
            } => {
                let _ = reply.send(store.cells_for_column(result_id, column_id, status).map_err(store_err));
            }
            StateCommand::PreviousCells {
                result_id,
                dataset_item_id,
                before_position,
                reply,
            } => {
                let _ = reply.send(
                    store
                        .previous_cells(result_id, dataset_item_id, before_position)
                        .map_err(store_err),
                );
            }

            StateCommand::CreateColumnTask { task, items, reply } => {
                let result = match store.create_column_task(&task, &items) {
                    Ok(Some(id)) => Ok(id),
                    Ok(None) => Err(StateError::Conflict(format!(
                        "an active task already exists for result {} column {}",
                        task.result_id, task.column_id
                    ))),
                    Err(e) => Err(store_err(e)),
                };
                let _ = reply.send(result);
            }
            StateCommand::GetColumnTask { id, reply } => {
                let _ = reply.send(store.get_column_task(id).map_err(store_err));
            }
            StateCommand::StartColumnTask { task_id, reply } => {
                let _ = reply.send(store.start_column_task(task_id).map_err(store_err));
            }
            StateCommand::SetColumnTaskStatus {
                task_id,
                status,
                error_message,
                stamp_completed,
                reply,
            } => {
                let _ = reply.send(
                    store
                        .set_column_task_status(task_id, status, error_message.as_deref(), stamp_completed)
                        .map_err(store_err),
                );
            }
            StateCommand::ScheduleColumnTaskRetry {
                task_id,
                retries_done,
                next_retry_at,
                reply,
            } => {
                let _ = reply.send(
                    store
                        .schedule_column_task_retry(task_id, retries_done, next_retry_at)
                        .map_err(store_err),
                );
            }
            StateCommand::UpdateColumnTaskProgress {
                task_id,
                completed_items,
                failed_items,
                reply,
            } => {
                let _ = reply.send(
                    store
                        .update_column_task_progress(task_id, completed_items, failed_items)
                        .map_err(store_err),
                );
            }
            StateCommand::ResetColumnTaskPending { task_id, reply } => {
                let _ = reply.send(store.reset_column_task_pending(task_id).map_err(store_err));
            }
            StateCommand::PendingColumnTasks { limit, reply } => {
                let _ = reply.send(store.pending_column_tasks(limit).map_err(store_err));
            }
            StateCommand::RetryableColumnTasks { now, reply } => {
                let _ = reply.send(store.retryable_column_tasks(now).map_err(store_err));
            }
            StateCommand::RunningColumnTasksStartedBefore { cutoff, reply } => {
                let _ = reply.send(store.running_column_tasks_started_before(cutoff).map_err(store_err));
            }
            StateCommand::ColumnTasksForResult { result_id, reply } => {
                let _ = reply.send(store.column_tasks_for_result(result_id).map_err(store_err));
            }
            StateCommand::HasActiveTaskForColumn {
                result_id,
                column_id,
                reply,
            } => {
                let _ = reply.send(store.has_active_task_for_column(result_id, column_id).map_err(store_err));
            }
            StateCommand::GetTaskItem { id, reply } => {
                let _ = reply.send(store.get_task_item(id).map_err(store_err));
            }
            StateCommand::PendingTaskItems { task_id, reply } => {
                let _ = reply.send(store.pending_task_items(task_id).map_err(store_err));
            }
            StateCommand::StartTaskItem { item_id, reply } => {
                let _ = reply.send(store.start_task_item(item_id).map_err(store_err));
            }
            StateCommand::FinishTaskItem {
                item_id,
                status,
                output_data,
                input_data,
                error_message,
                execution_time_ms,
                reply,
            } => {
                let _ = reply.send(
                    store
                        .finish_task_item(
                            item_id,
                            status,
                            output_data.as_ref(),
                            input_data.as_ref(),
                            error_message.as_deref(),
                            execution_time_ms,
                        )
                        .map_err(store_err),
                );
            }
            StateCommand::ResetFailedTaskItems { task_id, reply } => {
                let _ = reply.send(store.reset_failed_task_items(task_id).map_err(store_err));
            }
            StateCommand::RunningTaskItem { task_id, reply } => {
                let _ = reply.send(store.running_task_item(task_id).map_err(store_err));
            }
            StateCommand::AppendTaskLog { log, reply } => {
                let _ = reply.send(store.append_task_log(&log).map_err(store_err));
            }
            StateCommand::HasRecentTaskLog { task_id, since, reply } => {
                let _ = reply.send(store.has_recent_task_log(task_id, since).map_err(store_err));
            }
            StateCommand::PurgeFinishedTasks { cutoff, reply } => {
                let _ = reply.send(store.delete_finished_tasks_before(cutoff).map_err(store_err));
            }
            StateCommand::PurgeLogs { cutoff, reply } => {
                let _ = reply.send(store.delete_logs_before(cutoff).map_err(store_err));
            }

            StateCommand::InsertRowTasks { tasks, reply } => {
                let _ = reply.send(store.insert_row_tasks(&tasks).map_err(store_err));
            }
            StateCommand::GetRowTask { id, reply } => {
                let _ = reply.send(store.get_row_task(id).map_err(store_err));
            }
            StateCommand::PendingRowTasksForResult {
                result_id,
                item_ids,
                reply,
            } => {
                let _ = reply.send(
                    store
                        .pending_row_tasks_for_result(result_id, item_ids.as_deref())
                        .map_err(store_err),
                );
            }
            StateCommand::PendingRowTasks { limit, reply } => {
                let _ = reply.send(store.pending_row_tasks(limit).map_err(store_err));
            }
            StateCommand::MarkRowTasksRunning { ids, reply } => {
                let _ = reply.send(store.mark_row_tasks_running(&ids).map_err(store_err));
            }
            StateCommand::UpdateRowTaskPosition {
                row_task_id,
                position,
                reply,
            } => {
                let _ = reply.send(store.update_row_task_position(row_task_id, position).map_err(store_err));
            }
            StateCommand::CompleteRowTask {
                row_task_id,
                verdict,
                execution_variables,
                execution_time_ms,
                reply,
            } => {
                let _ = reply.send(
                    store
                        .complete_row_task(row_task_id, verdict, &execution_variables, execution_time_ms)
                        .map_err(store_err),
                );
            }
            StateCommand::FailRowTask {
                row_task_id,
                error,
                execution_time_ms,
                reply,
            } => {
                let _ = reply.send(store.fail_row_task(row_task_id, &error, execution_time_ms).map_err(store_err));
            }
            StateCommand::ResetRowTaskPending { row_task_id, reply } => {
                let _ = reply.send(store.reset_row_task_pending(row_task_id).map_err(store_err));
            }
            StateCommand::RunningRowTasksStartedBefore { cutoff, reply } => {
                let _ = reply.send(store.running_row_tasks_started_before(cutoff).map_err(store_err));
            }
            StateCommand::RowTaskQuietSince {
                row_task_id,
                cutoff,
                reply,
            } => {
                let _ = reply.send(store.row_task_quiet_since(row_task_id, cutoff).map_err(store_err));
            }
            StateCommand::RowTasksForResult { result_id, reply } => {
                let _ = reply.send(store.row_tasks_for_result(result_id).map_err(store_err));
            }

            StateCommand::InsertRequest { record, reply } => {
                let _ = reply.send(store.insert_request(&record).map_err(store_err));
            }
            StateCommand::FeatureModel {
                project_id,
                feature_key,
                reply,
            } => {
                let _ = reply.send(store.feature_model(project_id, &feature_key).map_err(store_err));
            }
            StateCommand::UpsertFeatureModel { model, reply } => {
                let _ = reply.send(store.upsert_feature_model(&model).map_err(store_err));
            }

            StateCommand::Shutdown => {
                info!("StateManager shutting down");
                break;
            }
        }
    }

    debug!("StateManager actor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use promptstore::ColumnKind;

    #[tokio::test]
    async fn test_pipeline_and_column_crud() {
        let state = StateManager::spawn_in_memory().unwrap();

        let pid = state.create_pipeline(Pipeline::new(1, 1, 1, "p")).await.unwrap();
        let pipeline = state.get_pipeline_required(pid).await.unwrap();
        assert_eq!(pipeline.name, "p");

        state
            .create_column(Column::new(pid, "vars", ColumnKind::DatasetVariable, 0))
            .await
            .unwrap();
        state
            .create_column(Column::new(pid, "v", ColumnKind::Exact, 1))
            .await
            .unwrap();
        assert_eq!(state.list_columns(pid).await.unwrap().len(), 2);
        assert_eq!(state.max_column_position(pid).await.unwrap(), 1);

        assert!(matches!(
            state.get_pipeline_required(999).await.unwrap_err(),
            StateError::NotFound(_)
        ));

        state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_single_flight_surfaces_conflict() {
        let state = StateManager::spawn_in_memory().unwrap();

        let pid = state.create_pipeline(Pipeline::new(1, 1, 1, "p")).await.unwrap();
        let rid = state
            .create_result(EvalResult::new(pid, promptstore::RunType::Release))
            .await
            .unwrap();
        let cid = state
            .create_column(Column::new(pid, "v", ColumnKind::Exact, 1))
            .await
            .unwrap();

        let task = ColumnTask::new(pid, rid, cid, 1);
        state.create_column_task(task.clone(), vec![]).await.unwrap();

        let err = state.create_column_task(task, vec![]).await.unwrap_err();
        assert!(matches!(err, StateError::Conflict(_)));

        state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_row_task_flow_through_actor() {
        let state = StateManager::spawn_in_memory().unwrap();

        let pid = state.create_pipeline(Pipeline::new(1, 1, 1, "p")).await.unwrap();
        let rid = state
            .create_result(EvalResult::new(pid, promptstore::RunType::Release))
            .await
            .unwrap();

        state
            .insert_row_tasks(vec![RowTask::new(rid, 1), RowTask::new(rid, 2)])
            .await
            .unwrap();
        let pending = state.pending_row_tasks_for_result(rid, None).await.unwrap();
        assert_eq!(pending.len(), 2);

        state
            .mark_row_tasks_running(pending.iter().map(|t| t.id).collect())
            .await
            .unwrap();
        state
            .complete_row_task(pending[0].id, RowVerdict::Passed, Map::new(), 10)
            .await
            .unwrap();
        state.fail_row_task(pending[1].id, "boom".to_string(), 5).await.unwrap();

        let all = state.row_tasks_for_result(rid).await.unwrap();
        assert!(all.iter().all(|t| t.is_finished()));

        state.shutdown().await.unwrap();
    }
}

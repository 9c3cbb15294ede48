//! Task manager
//!
//! Transactional state transitions for column tasks and row tasks, the
//! retry delay table, progress queries, result aggregation for both
//! execution modes, and the maintenance sweeps.

use serde_json::{Value, json};
use tracing::{debug, info, warn};

use promptstore::{
    Cell, CellStatus, Column, ColumnTask, DatasetItem, EvalResult, LogLevel, ResultStatus, RowTask, RowTaskStatus,
    RowVerdict, TaskItem, TaskLog, TaskStatus, now_ms,
};

use crate::config::ConfigHandle;
use crate::error::{EngineError, EngineResult};
use crate::state::StateManager;

/// Progress descriptor for one column task.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskProgress {
    pub task_id: i64,
    pub status: TaskStatus,
    pub progress_percentage: f64,
    pub total_items: i64,
    pub completed_items: i64,
    pub failed_items: i64,
    /// Estimated seconds left, from the average time per completed item.
    pub estimated_remaining_secs: Option<i64>,
    /// Label of the item currently being processed.
    pub current_item: Option<String>,
    pub last_updated: i64,
}

/// Progress descriptor for one result.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ResultProgress {
    pub result_id: i64,
    /// "row" when the result runs row tasks, "column" otherwise.
    pub mode: &'static str,
    pub total: i64,
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub progress_percentage: f64,
    /// Verdict tallies; only populated in row mode.
    pub passed: i64,
    pub unpassed: i64,
    pub failed_rows: i64,
}

#[derive(Clone)]
pub struct TaskManager {
    state: StateManager,
    config: ConfigHandle,
}

impl TaskManager {
    pub fn new(state: StateManager, config: ConfigHandle) -> Self {
        Self { state, config }
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    // === creation ===

    /// Create a column task plus one task item per `new` cell of the
    /// column. Enforces the single-flight invariant; a held key surfaces
    /// as `Conflict`.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_column_task(
        &self,
        result_id: i64,
        column: &Column,
        dataset_items: &[DatasetItem],
        user_id: i64,
        priority: i64,
        retries_max: i64,
        task_config: Value,
    ) -> EngineResult<ColumnTask> {
        if dataset_items.is_empty() {
            return Err(EngineError::validation("no dataset items to process"));
        }

        let cells = self
            .state
            .cells_for_column(result_id, column.id, Some(CellStatus::New))
            .await?;
        let item_lookup: std::collections::HashMap<i64, &DatasetItem> =
            dataset_items.iter().map(|item| (item.id, item)).collect();

        let items: Vec<TaskItem> = cells
            .iter()
            .filter_map(|cell| {
                item_lookup.get(&cell.dataset_item_id).map(|item| {
                    TaskItem::new(0, cell.id, cell.dataset_item_id)
                        .with_input(json!({"variables": item.variables}))
                })
            })
            .collect();

        let mut task = ColumnTask::new(column.pipeline_id, result_id, column.id, user_id).with_priority(priority);
        task.retries_max = retries_max;
        task.config = task_config;

        let task_id = self.state.create_column_task(task, items.clone()).await?;
        self.log(task_id, LogLevel::Info, format!("task created with {} items", items.len()), None, None)
            .await;

        let created = self.state.get_column_task_required(task_id).await?;
        info!(task_id, column_id = column.id, result_id, "Column task created");
        Ok(created)
    }

    /// Create row tasks for the given dataset items, skipping pairs that
    /// already exist.
    pub async fn create_row_tasks(&self, result_id: i64, dataset_items: &[DatasetItem]) -> EngineResult<usize> {
        if dataset_items.is_empty() {
            return Err(EngineError::validation("no dataset items to process"));
        }
        let tasks: Vec<RowTask> = dataset_items.iter().map(|item| RowTask::new(result_id, item.id)).collect();
        let inserted = self.state.insert_row_tasks(tasks).await?;
        info!(result_id, inserted, "Row tasks created");
        Ok(inserted)
    }

    // === transitions ===

    pub async fn start_task(&self, task_id: i64) -> EngineResult<()> {
        self.state.start_column_task(task_id).await?;
        self.log(task_id, LogLevel::Info, "task started", None, None).await;
        Ok(())
    }

    pub async fn pause_task(&self, task_id: i64) -> EngineResult<bool> {
        let task = self.state.get_column_task_required(task_id).await?;
        if task.status != TaskStatus::Running {
            return Err(EngineError::validation("only running tasks can be paused"));
        }
        let updated = self
            .state
            .set_column_task_status(task_id, TaskStatus::Paused, None, false)
            .await?;
        self.log(task_id, LogLevel::Info, "task paused", None, None).await;
        Ok(updated)
    }

    pub async fn resume_task(&self, task_id: i64) -> EngineResult<bool> {
        let task = self.state.get_column_task_required(task_id).await?;
        if task.status != TaskStatus::Paused {
            return Err(EngineError::validation("only paused tasks can be resumed"));
        }
        let updated = self
            .state
            .set_column_task_status(task_id, TaskStatus::Pending, None, false)
            .await?;
        self.log(task_id, LogLevel::Info, "task resumed", None, None).await;
        Ok(updated)
    }

    pub async fn cancel_task(&self, task_id: i64) -> EngineResult<bool> {
        let task = self.state.get_column_task_required(task_id).await?;
        if task.is_finished() {
            return Err(EngineError::validation("task is already finished"));
        }
        let updated = self
            .state
            .set_column_task_status(task_id, TaskStatus::Cancelled, None, true)
            .await?;
        self.log(task_id, LogLevel::Info, "task cancelled", None, None).await;
        Ok(updated)
    }

    /// Manual retry of a failed task.
    pub async fn retry_task(&self, task_id: i64) -> EngineResult<bool> {
        let task = self.state.get_column_task_required(task_id).await?;
        if !task.can_retry() {
            self.log(
                task_id,
                LogLevel::Warn,
                format!(
                    "task cannot be retried: {} of {} retries used, status {}",
                    task.retries_done, task.retries_max, task.status
                ),
                None,
                None,
            )
            .await;
            return Ok(false);
        }
        self.schedule_retry(&task).await?;
        Ok(true)
    }

    /// Schedule the next retry round for a task, honouring the configured
    /// delay table.
    pub async fn schedule_retry(&self, task: &ColumnTask) -> EngineResult<()> {
        let delay_secs = self.config.get().retry_delay_secs(task.retries_done as usize);
        let next_retry_at = now_ms() + delay_secs * 1000;
        self.state
            .schedule_column_task_retry(task.id, task.retries_done + 1, next_retry_at)
            .await?;
        self.log(
            task.id,
            LogLevel::Info,
            format!("retry {} of {} scheduled in {delay_secs}s", task.retries_done + 1, task.retries_max),
            None,
            None,
        )
        .await;
        Ok(())
    }

    /// Retry when the budget allows, otherwise fail the task.
    pub async fn retry_or_fail(&self, task_id: i64, error: &str) -> EngineResult<()> {
        let task = self.state.get_column_task_required(task_id).await?;
        if task.retries_done < task.retries_max {
            self.schedule_retry(&task).await
        } else {
            warn!(task_id, "Retry budget exhausted, failing task");
            self.complete_task(task_id, false, Some(error)).await
        }
    }

    pub async fn update_task_progress(&self, task_id: i64, completed_items: i64, failed_items: i64) -> EngineResult<()> {
        self.state
            .update_column_task_progress(task_id, completed_items, failed_items)
            .await?;
        Ok(())
    }

    /// Finish a task and, when it closed the pipeline's last column,
    /// roll the statistics up to the result.
    pub async fn complete_task(&self, task_id: i64, success: bool, error: Option<&str>) -> EngineResult<()> {
        let status = if success { TaskStatus::Completed } else { TaskStatus::Failed };
        let task = self.state.get_column_task_required(task_id).await?;

        self.state
            .set_column_task_status(task_id, status, error.map(String::from), true)
            .await?;
        self.log(
            task_id,
            if success { LogLevel::Info } else { LogLevel::Error },
            if success { "task completed" } else { "task failed" },
            None,
            None,
        )
        .await;

        self.check_and_update_column_result_stats(task.pipeline_id, task.result_id, task.column_id)
            .await?;
        Ok(())
    }

    // === progress queries ===

    pub async fn task_progress(&self, task_id: i64) -> EngineResult<TaskProgress> {
        let task = self.state.get_column_task_required(task_id).await?;

        let estimated_remaining_secs = match (task.status, task.started_at) {
            (TaskStatus::Running, Some(started_at)) if task.completed_items > 0 => {
                let elapsed_ms = (now_ms() - started_at).max(0);
                let avg_ms = elapsed_ms / task.completed_items;
                let remaining = task.total_items - task.completed_items;
                Some(avg_ms * remaining / 1000)
            }
            _ => None,
        };

        let current_item = if task.status == TaskStatus::Running {
            self.state
                .running_task_item(task_id)
                .await?
                .map(|item| format!("dataset item {}", item.dataset_item_id))
        } else {
            None
        };

        Ok(TaskProgress {
            task_id: task.id,
            status: task.status,
            progress_percentage: task.progress_percentage(),
            total_items: task.total_items,
            completed_items: task.completed_items,
            failed_items: task.failed_items,
            estimated_remaining_secs,
            current_item,
            last_updated: task.updated_at,
        })
    }

    pub async fn result_progress(&self, result_id: i64) -> EngineResult<ResultProgress> {
        self.state.get_result_required(result_id).await?;

        let row_tasks = self.state.row_tasks_for_result(result_id).await?;
        if !row_tasks.is_empty() {
            return Ok(row_progress(result_id, &row_tasks));
        }

        let tasks = self.state.column_tasks_for_result(result_id).await?;
        let total = tasks.len() as i64;
        let pending = tasks
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Retrying))
            .count() as i64;
        let running = tasks.iter().filter(|t| t.status == TaskStatus::Running).count() as i64;
        let completed = tasks.iter().filter(|t| t.status == TaskStatus::Completed).count() as i64;
        let failed = tasks
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Failed | TaskStatus::Cancelled))
            .count() as i64;

        Ok(ResultProgress {
            result_id,
            mode: "column",
            total,
            pending,
            running,
            completed,
            failed,
            progress_percentage: percentage(completed + failed, total),
            passed: 0,
            unpassed: 0,
            failed_rows: 0,
        })
    }

    // === result aggregation ===

    /// Row mode: recompute the result's counters from its row tasks.
    pub async fn update_row_result_stats(&self, result_id: i64) -> EngineResult<()> {
        let row_tasks = self.state.row_tasks_for_result(result_id).await?;
        if row_tasks.is_empty() {
            return Ok(());
        }

        let total = row_tasks.len() as i64;
        let passed = verdict_count(&row_tasks, RowVerdict::Passed);
        let unpassed = verdict_count(&row_tasks, RowVerdict::Unpassed);
        let failed = verdict_count(&row_tasks, RowVerdict::Failed);

        let finished = passed + unpassed;
        let success_rate = if total > 0 { finished as f64 / total as f64 } else { 0.0 };
        let all_finished = row_tasks.iter().all(|t| t.is_finished());
        let status = if all_finished { ResultStatus::Completed } else { ResultStatus::Running };

        self.state
            .update_result_stats(result_id, status, total, passed, unpassed, failed, round2(success_rate))
            .await?;
        debug!(result_id, total, passed, unpassed, failed, "Row result stats updated");
        Ok(())
    }

    /// Column mode: when the just-finished task belonged to the last
    /// evaluation column and no task for that column is still in flight,
    /// derive the result counters from the final column's cells.
    pub async fn check_and_update_column_result_stats(
        &self,
        pipeline_id: i64,
        result_id: i64,
        completed_column_id: i64,
    ) -> EngineResult<()> {
        let columns = self.state.list_columns(pipeline_id).await?;
        let last = columns
            .iter()
            .filter(|c| !c.kind.is_static())
            .max_by_key(|c| c.position);
        let Some(last) = last else {
            return Ok(());
        };
        if last.id != completed_column_id {
            return Ok(());
        }

        if self.state.has_active_task_for_column(result_id, last.id).await? {
            return Ok(());
        }

        let cells = self
            .state
            .cells_for_column(result_id, last.id, Some(CellStatus::Completed))
            .await?;
        let total = cells.len() as i64;
        let passed = cells.iter().filter(|cell| cell.is_truthy()).count() as i64;
        let failed = total - passed;
        let success_rate = if total > 0 { passed as f64 / total as f64 } else { 0.0 };

        let tasks = self.state.column_tasks_for_result(result_id).await?;
        let all_terminal = tasks.iter().all(|t| t.is_finished());
        let status = if all_terminal { ResultStatus::Completed } else { ResultStatus::Running };

        self.state
            .update_result_stats(result_id, status, total, passed, 0, failed, round2(success_rate))
            .await?;
        info!(
            result_id,
            total, passed, failed, "Column result stats updated from final column"
        );
        Ok(())
    }

    // === maintenance ===

    /// Delete finished tasks older than the configured horizon.
    pub async fn cleanup_completed_tasks(&self, days: Option<i64>) -> EngineResult<usize> {
        let days = days.unwrap_or_else(|| self.config.get().cleanup_completed_tasks_days);
        let cutoff = now_ms() - days * 24 * 60 * 60 * 1000;
        let deleted = self.state.purge_finished_tasks(cutoff).await?;
        if deleted > 0 {
            info!(deleted, days, "Cleaned up finished tasks");
        }
        Ok(deleted)
    }

    /// Delete task logs older than the retention window.
    pub async fn purge_old_logs(&self) -> EngineResult<usize> {
        let days = self.config.get().log_retention_days;
        let cutoff = now_ms() - days * 24 * 60 * 60 * 1000;
        let deleted = self.state.purge_logs(cutoff).await?;
        if deleted > 0 {
            info!(deleted, days, "Purged old task logs");
        }
        Ok(deleted)
    }

    /// Append a task event; failures are logged, never propagated.
    pub async fn log(
        &self,
        task_id: i64,
        level: LogLevel,
        message: impl Into<String>,
        task_item_id: Option<i64>,
        details: Option<Value>,
    ) {
        let mut entry = TaskLog::new(task_id, level, message);
        entry.task_item_id = task_item_id;
        entry.details = details;
        if let Err(e) = self.state.append_task_log(entry).await {
            warn!(task_id, error = %e, "Failed to append task log");
        }
    }
}

fn percentage(done: i64, total: i64) -> f64 {
    if total == 0 { 0.0 } else { done as f64 / total as f64 * 100.0 }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn verdict_count(tasks: &[RowTask], verdict: RowVerdict) -> i64 {
    tasks.iter().filter(|t| t.row_result == Some(verdict)).count() as i64
}

fn row_progress(result_id: i64, row_tasks: &[RowTask]) -> ResultProgress {
    let total = row_tasks.len() as i64;
    let count = |status: RowTaskStatus| row_tasks.iter().filter(|t| t.status == status).count() as i64;
    let completed = count(RowTaskStatus::Completed);
    let failed = count(RowTaskStatus::Failed);

    ResultProgress {
        result_id,
        mode: "row",
        total,
        pending: count(RowTaskStatus::Pending),
        running: count(RowTaskStatus::Running),
        completed,
        failed,
        progress_percentage: percentage(completed + failed, total),
        passed: verdict_count(row_tasks, RowVerdict::Passed),
        unpassed: verdict_count(row_tasks, RowVerdict::Unpassed),
        failed_rows: verdict_count(row_tasks, RowVerdict::Failed),
    }
}

/// Build the full set of cells for a result: static columns are written
/// complete, everything else starts `new`. Shared by the lifecycle and
/// staging rebuild paths.
pub(crate) fn build_cells(result: &EvalResult, columns: &[Column], items: &[DatasetItem]) -> Vec<Cell> {
    use promptstore::ColumnKind;

    let mut cells = Vec::with_capacity(columns.len() * items.len());
    for item in items {
        for column in columns {
            let cell = Cell::new(column.pipeline_id, result.id, item.id, column.id);
            let cell = match column.kind {
                ColumnKind::DatasetVariable => cell.completed_with(Value::Object(item.variables.clone())),
                ColumnKind::HumanInput => {
                    let default = column
                        .config
                        .get("default_value")
                        .cloned()
                        .unwrap_or(Value::String(String::new()));
                    cell.completed_with(json!({"value": default}))
                }
                _ => cell,
            };
            cells.push(cell);
        }
    }
    cells
}

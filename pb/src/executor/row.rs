//! Row-task executor
//!
//! Runs every column of a pipeline, in position order, for one dataset
//! item per task. A batch over one result is processed serially when the
//! run contains LLM-bearing columns (so the rate limiter can pace the
//! calls) and concurrently otherwise.

use serde_json::{Map, Value};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use promptstore::{Cell, Column, ColumnKind, EvalResult, RowTask, RowTaskStatus, RowVerdict};

use crate::error::{EngineError, EngineResult};
use crate::state::StateManager;
use crate::tasks::TaskManager;

use super::eval::{ColumnEval, EvalServices, evaluate_column};

/// Outcome of one batch run.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchStats {
    pub total: usize,
    pub succeeded: usize,
}

pub struct RowTaskExecutor {
    state: StateManager,
    tasks: TaskManager,
    services: EvalServices,
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => matches!(s.to_lowercase().as_str(), "true" | "1" | "yes" | "pass" | "passed"),
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        _ => false,
    }
}

impl RowTaskExecutor {
    pub fn new(state: StateManager, tasks: TaskManager, services: EvalServices) -> Self {
        Self {
            state,
            tasks,
            services,
        }
    }

    /// Execute every pending row task of a result, optionally narrowed to
    /// a selection of dataset items.
    pub async fn execute_batch(&self, result_id: i64, item_ids: Option<Vec<i64>>) -> EngineResult<BatchStats> {
        let result = self.state.get_result_required(result_id).await?;
        let columns = self.pipeline_columns(&result).await?;

        let row_tasks = self.state.pending_row_tasks_for_result(result_id, item_ids).await?;
        if row_tasks.is_empty() {
            info!(result_id, "No pending row tasks in batch");
            return Ok(BatchStats::default());
        }

        // LLM-bearing runs are serialised so the limiter paces the calls;
        // pure-predicate runs fan out freely.
        let rate_limited = result.has_llm_calls();
        info!(
            result_id,
            rows = row_tasks.len(),
            rate_limited,
            "Executing row task batch"
        );

        self.state
            .mark_row_tasks_running(row_tasks.iter().map(|t| t.id).collect())
            .await?;

        let mut succeeded = 0;
        if rate_limited {
            for (index, row_task) in row_tasks.iter().enumerate() {
                debug!(row_task_id = row_task.id, index, total = row_tasks.len(), "Serial row execution");
                match self.execute_single(row_task, &columns, true).await {
                    Ok(true) => succeeded += 1,
                    Ok(false) => {}
                    Err(e) => error!(row_task_id = row_task.id, error = %e, "Row task errored"),
                }
            }
        } else {
            let runs = row_tasks.iter().map(|row_task| self.execute_single(row_task, &columns, false));
            for (row_task, outcome) in row_tasks.iter().zip(futures::future::join_all(runs).await) {
                match outcome {
                    Ok(true) => succeeded += 1,
                    Ok(false) => {}
                    Err(e) => error!(row_task_id = row_task.id, error = %e, "Row task errored"),
                }
            }
        }

        info!(result_id, succeeded, total = row_tasks.len(), "Row task batch finished");
        self.tasks.update_row_result_stats(result_id).await?;

        Ok(BatchStats {
            total: row_tasks.len(),
            succeeded,
        })
    }

    /// Execute one row task picked up by the scheduler's pending dispatch.
    pub async fn execute_row_task(&self, row_task_id: i64) -> EngineResult<bool> {
        let row_task = self.state.get_row_task_required(row_task_id).await?;
        if row_task.status != RowTaskStatus::Pending {
            warn!(row_task_id, status = %row_task.status, "Row task is not pending, skipping");
            return Ok(false);
        }

        let result = self.state.get_result_required(row_task.result_id).await?;
        let columns = self.pipeline_columns(&result).await?;
        let rate_limited = result.has_llm_calls();

        self.state.mark_row_tasks_running(vec![row_task_id]).await?;
        let outcome = self.execute_single(&row_task, &columns, rate_limited).await?;
        self.tasks.update_row_result_stats(row_task.result_id).await?;
        Ok(outcome)
    }

    async fn pipeline_columns(&self, result: &EvalResult) -> EngineResult<Vec<Column>> {
        let columns = self.state.list_columns(result.pipeline_id).await?;
        if columns.is_empty() {
            return Err(EngineError::validation(format!(
                "pipeline {} has no columns",
                result.pipeline_id
            )));
        }
        Ok(columns)
    }

    /// Run all columns, in position order, for one row. Returns whether
    /// the row reached a verdict (passed or unpassed both count).
    async fn execute_single(&self, row_task: &RowTask, columns: &[Column], rate_limited: bool) -> EngineResult<bool> {
        let started = Instant::now();

        let dataset_item = match self.state.get_dataset_item(row_task.dataset_item_id).await? {
            Some(item) => item,
            None => {
                let message = format!("dataset item {} not found", row_task.dataset_item_id);
                self.state.fail_row_task(row_task.id, message, 0).await?;
                return Ok(false);
            }
        };

        let mut execution_variables: Map<String, Value> = dataset_item.variables.clone();

        for column in columns {
            self.state.update_row_task_position(row_task.id, column.position).await?;
            debug!(row_task_id = row_task.id, column = %column.name, position = column.position, "Executing column");

            let cell = self.get_or_create_cell(row_task, column).await?;
            let outcome = evaluate_column(
                &self.services,
                ColumnEval {
                    column,
                    variables: &execution_variables,
                    existing_cell_value: cell.value.as_ref(),
                    rate_limited,
                },
            )
            .await;

            if !outcome.success {
                let message = outcome
                    .error
                    .unwrap_or_else(|| format!("column {} failed", column.name));
                warn!(row_task_id = row_task.id, column = %column.name, %message, "Row failed at column");
                self.state.update_cell_failed(cell.id, message.clone()).await?;
                self.state
                    .fail_row_task(row_task.id, message, started.elapsed().as_millis() as i64)
                    .await?;
                return Ok(false);
            }

            let value = outcome.cell_value.clone().unwrap_or(Value::Null);
            let display = outcome.display_value.clone().unwrap_or_else(|| value.clone());
            self.state.update_cell_completed(cell.id, value, display).await?;

            if let Some(value) = outcome.variable_value {
                execution_variables.insert(column.name.clone(), value);
            }
        }

        // The last boolean column decides the verdict; non-boolean tails
        // default to passed.
        let last = columns.last().expect("columns checked non-empty");
        let verdict = if last.kind.is_boolean() {
            match execution_variables.get(&last.name) {
                Some(value) if truthy(value) => RowVerdict::Passed,
                _ => RowVerdict::Unpassed,
            }
        } else {
            RowVerdict::Passed
        };

        self.state
            .complete_row_task(
                row_task.id,
                verdict,
                execution_variables,
                started.elapsed().as_millis() as i64,
            )
            .await?;
        debug!(row_task_id = row_task.id, %verdict, "Row task completed");
        Ok(true)
    }

    async fn get_or_create_cell(&self, row_task: &RowTask, column: &Column) -> EngineResult<Cell> {
        if let Some(cell) = self
            .state
            .get_cell(row_task.result_id, row_task.dataset_item_id, column.id)
            .await?
        {
            return Ok(cell);
        }

        let mut cell = Cell::new(column.pipeline_id, row_task.result_id, row_task.dataset_item_id, column.id);
        cell.status = promptstore::CellStatus::Pending;
        self.state.insert_cells(vec![cell]).await?;
        self.state
            .get_cell(row_task.result_id, row_task.dataset_item_id, column.id)
            .await?
            .ok_or_else(|| EngineError::Runtime("cell vanished after insert".to_string()))
    }
}

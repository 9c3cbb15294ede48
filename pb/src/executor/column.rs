//! Column-task executor
//!
//! Advances one column task to a terminal state: fans its pending items
//! out under a semaphore, writes cells and items as they finish, tolerates
//! per-item failures, and schedules a retry round when everything failed
//! for transient reasons.

use serde_json::{Map, Value, json};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use promptstore::{Cell, ColumnKind, LogLevel, TaskItem, TaskItemStatus, TaskStatus};

use crate::config::ConfigHandle;
use crate::error::{EngineError, EngineResult};
use crate::state::StateManager;
use crate::tasks::TaskManager;

use super::eval::{ColumnEval, EvalServices, evaluate_column};

enum ItemOutcome {
    Completed,
    Failed { retryable: bool },
    /// The item was no longer pending when the worker reached it.
    Skipped,
    /// The task was cancelled; the item stays pending.
    Cancelled,
}

pub struct ColumnTaskExecutor {
    state: StateManager,
    tasks: TaskManager,
    services: EvalServices,
    config: ConfigHandle,
}

/// Union of every earlier column's cell for this dataset item: the whole
/// map for dataset-variable cells, a single `name -> value` entry for the
/// rest.
fn merge_previous(previous: Vec<(promptstore::Column, Cell)>) -> Map<String, Value> {
    let mut merged = Map::new();
    for (column, cell) in previous {
        match column.kind {
            ColumnKind::DatasetVariable => {
                if let Some(Value::Object(variables)) = &cell.value {
                    for (key, value) in variables {
                        merged.insert(key.clone(), value.clone());
                    }
                }
            }
            _ => match cell.inner_value() {
                Some(value) => {
                    merged.insert(column.name.clone(), value.clone());
                }
                None => {
                    warn!(cell_id = cell.id, column = %column.name, "Previous cell holds no value");
                }
            },
        }
    }
    merged
}

impl ColumnTaskExecutor {
    pub fn new(state: StateManager, tasks: TaskManager, services: EvalServices, config: ConfigHandle) -> Self {
        Self {
            state,
            tasks,
            services,
            config,
        }
    }

    /// Run a column task to a terminal state. Returns whether the task
    /// completed (partial success counts).
    pub async fn execute_task(&self, task_id: i64) -> EngineResult<bool> {
        let task = self.state.get_column_task_required(task_id).await?;
        if !matches!(task.status, TaskStatus::Pending | TaskStatus::Retrying) {
            warn!(task_id, status = %task.status, "Task is not runnable, skipping");
            return Ok(false);
        }

        self.tasks.start_task(task_id).await?;
        self.tasks
            .log(
                task_id,
                LogLevel::Info,
                format!("executing task over {} items", task.total_items),
                None,
                None,
            )
            .await;

        let pending = self.state.pending_task_items(task_id).await?;
        if pending.is_empty() {
            debug!(task_id, "No pending items, completing immediately");
            self.tasks.complete_task(task_id, true, None).await?;
            return Ok(true);
        }

        let max_items = self.config.get().max_concurrent_items_per_task.max(1);
        let semaphore = Arc::new(Semaphore::new(max_items));

        let runs = pending.iter().map(|item| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore never closed");
                self.execute_item(task_id, item).await
            }
        });
        let outcomes = futures::future::join_all(runs).await;

        let completed = outcomes.iter().filter(|o| matches!(o, ItemOutcome::Completed)).count() as i64;
        let failed = outcomes
            .iter()
            .filter(|o| matches!(o, ItemOutcome::Failed { .. }))
            .count() as i64;
        let any_retryable = outcomes.iter().any(|o| matches!(o, ItemOutcome::Failed { retryable: true }));
        let cancelled = outcomes.iter().any(|o| matches!(o, ItemOutcome::Cancelled));

        self.tasks
            .update_task_progress(task_id, task.completed_items + completed, task.failed_items + failed)
            .await?;
        self.tasks
            .log(
                task_id,
                LogLevel::Info,
                format!("item execution finished: {completed} succeeded, {failed} failed"),
                None,
                None,
            )
            .await;

        if cancelled {
            // Leave the terminal state that cancel_task already wrote.
            info!(task_id, "Task was cancelled between items");
            return Ok(false);
        }

        if completed > 0 || failed == 0 {
            self.tasks.complete_task(task_id, true, None).await?;
            Ok(true)
        } else if any_retryable {
            self.tasks.retry_or_fail(task_id, "all items failed with transient errors").await?;
            Ok(false)
        } else {
            self.tasks.complete_task(task_id, false, Some("all items failed")).await?;
            Ok(false)
        }
    }

    /// Execute one task item end to end, writing its cell and record.
    async fn execute_item(&self, task_id: i64, item: &TaskItem) -> ItemOutcome {
        let started = Instant::now();

        // Cooperative cancellation: check the task between items.
        match self.state.get_column_task(task_id).await {
            Ok(Some(task)) if task.status == TaskStatus::Cancelled => {
                debug!(task_id, item_id = item.id, "Task cancelled, leaving item pending");
                return ItemOutcome::Cancelled;
            }
            Ok(_) => {}
            Err(e) => {
                error!(task_id, item_id = item.id, error = %e, "Failed to re-check task status");
            }
        }

        match self.run_item(task_id, item).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let elapsed = started.elapsed().as_millis() as i64;
                error!(task_id, item_id = item.id, error = %e, "Task item errored");
                let retryable = e.is_retryable();
                self.record_item_failure(task_id, item, &e.to_string(), elapsed).await;
                ItemOutcome::Failed { retryable }
            }
        }
    }

    async fn run_item(&self, task_id: i64, item: &TaskItem) -> EngineResult<ItemOutcome> {
        let started = Instant::now();

        let fresh = self
            .state
            .get_task_item(item.id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("task item {}", item.id)))?;
        if fresh.status != TaskItemStatus::Pending {
            warn!(item_id = item.id, status = %fresh.status, "Task item is not pending, skipping");
            return Ok(ItemOutcome::Skipped);
        }

        self.state.start_task_item(item.id).await?;

        let task = self.state.get_column_task_required(task_id).await?;
        let cell = self
            .state
            .get_cell_by_id(item.cell_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("cell {}", item.cell_id)))?;
        let column = self.state.get_column_required(task.column_id).await?;

        // Variables: the item's captured dataset variables, overlaid with
        // every earlier column's output for this row.
        let mut variables = fresh
            .input_data
            .as_ref()
            .and_then(|input| input.get("variables"))
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let previous = self
            .state
            .previous_cells(task.result_id, item.dataset_item_id, column.position)
            .await?;
        for (key, value) in merge_previous(previous) {
            variables.insert(key, value);
        }

        let outcome = evaluate_column(
            &self.services,
            ColumnEval {
                column: &column,
                variables: &variables,
                existing_cell_value: cell.value.as_ref(),
                rate_limited: false,
            },
        )
        .await;

        let elapsed = started.elapsed().as_millis() as i64;

        if outcome.success {
            let value = outcome.cell_value.clone().unwrap_or(Value::Null);
            let display = outcome.display_value.clone().unwrap_or_else(|| value.clone());
            self.state.update_cell_completed(cell.id, value, display).await?;

            let output_data = json!({
                "success": true,
                "value": outcome.cell_value,
                "display_value": outcome.display_value,
                "details": outcome.details,
            });
            self.state
                .finish_task_item(
                    item.id,
                    TaskItemStatus::Completed,
                    Some(output_data),
                    Some(json!({"variables": variables})),
                    None,
                    elapsed,
                )
                .await?;
            self.tasks
                .log(
                    task_id,
                    LogLevel::Info,
                    format!("task item {} completed", item.id),
                    Some(item.id),
                    Some(json!({"execution_time_ms": elapsed})),
                )
                .await;
            Ok(ItemOutcome::Completed)
        } else {
            let message = outcome.error.unwrap_or_else(|| "evaluation failed".to_string());
            self.record_item_failure(task_id, item, &message, elapsed).await;
            Ok(ItemOutcome::Failed {
                retryable: outcome.retryable,
            })
        }
    }

    async fn record_item_failure(&self, task_id: i64, item: &TaskItem, message: &str, elapsed_ms: i64) {
        if let Err(e) = self.state.update_cell_failed(item.cell_id, message.to_string()).await {
            error!(cell_id = item.cell_id, error = %e, "Failed to mark cell failed");
        }
        if let Err(e) = self
            .state
            .finish_task_item(
                item.id,
                TaskItemStatus::Failed,
                Some(json!({"success": false, "error": message})),
                None,
                Some(message.to_string()),
                elapsed_ms,
            )
            .await
        {
            error!(item_id = item.id, error = %e, "Failed to mark task item failed");
        }
        self.tasks
            .log(
                task_id,
                LogLevel::Error,
                format!("task item {} failed: {message}", item.id),
                Some(item.id),
                Some(json!({"execution_time_ms": elapsed_ms})),
            )
            .await;
    }
}

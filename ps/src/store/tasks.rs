//! Column-task, task-item and task-log queries

use eyre::{Context, Result};
use rusqlite::{OptionalExtension, Row, params};
use serde_json::Value;
use tracing::debug;

use crate::model::{ColumnTask, TaskItem, TaskItemStatus, TaskLog, TaskStatus, now_ms};

use super::{Store, json_text, opt_json_text, parse_enum, parse_json};

fn row_to_task(row: &Row) -> rusqlite::Result<ColumnTask> {
    Ok(ColumnTask {
        id: row.get("id")?,
        pipeline_id: row.get("pipeline_id")?,
        result_id: row.get("result_id")?,
        column_id: row.get("column_id")?,
        user_id: row.get("user_id")?,
        status: parse_enum::<TaskStatus>(row.get("status")?)?,
        priority: row.get("priority")?,
        retries_max: row.get("retries_max")?,
        retries_done: row.get("retries_done")?,
        total_items: row.get("total_items")?,
        completed_items: row.get("completed_items")?,
        failed_items: row.get("failed_items")?,
        config: parse_json(row.get("config")?).unwrap_or(Value::Null),
        error_message: row.get("error_message")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
        next_retry_at: row.get("next_retry_at")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn row_to_task_item(row: &Row) -> rusqlite::Result<TaskItem> {
    Ok(TaskItem {
        id: row.get("id")?,
        task_id: row.get("task_id")?,
        cell_id: row.get("cell_id")?,
        dataset_item_id: row.get("dataset_item_id")?,
        status: parse_enum::<TaskItemStatus>(row.get("status")?)?,
        retry_count: row.get("retry_count")?,
        input_data: parse_json(row.get("input_data")?),
        output_data: parse_json(row.get("output_data")?),
        error_message: row.get("error_message")?,
        execution_time_ms: row.get("execution_time_ms")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn row_to_log(row: &Row) -> rusqlite::Result<TaskLog> {
    Ok(TaskLog {
        id: row.get("id")?,
        task_id: row.get("task_id")?,
        task_item_id: row.get("task_item_id")?,
        level: parse_enum(row.get("level")?)?,
        message: row.get("message")?,
        details: parse_json(row.get("details")?),
        created_at: row.get("created_at")?,
    })
}

impl Store {
    /// Insert a task and its items atomically, enforcing the single-flight
    /// invariant: at most one task per `(result, column)` may be in
    /// `{pending, running, retrying}`. Returns `Ok(None)` on conflict.
    pub fn create_column_task(&mut self, task: &ColumnTask, items: &[TaskItem]) -> Result<Option<i64>> {
        let tx = self.conn_mut().transaction()?;

        let conflict: Option<i64> = tx
            .query_row(
                "SELECT id FROM column_tasks
                 WHERE result_id = ?1 AND column_id = ?2
                   AND status IN ('pending', 'running', 'retrying')
                 LIMIT 1",
                params![task.result_id, task.column_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(existing) = conflict {
            debug!(
                result_id = task.result_id,
                column_id = task.column_id,
                existing,
                "Single-flight conflict on column task creation"
            );
            return Ok(None);
        }

        tx.execute(
            "INSERT INTO column_tasks (pipeline_id, result_id, column_id, user_id, status, priority,
                                       retries_max, retries_done, total_items, completed_items, failed_items,
                                       config, error_message, started_at, completed_at, next_retry_at,
                                       created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                task.pipeline_id,
                task.result_id,
                task.column_id,
                task.user_id,
                task.status.to_string(),
                task.priority,
                task.retries_max,
                task.retries_done,
                items.len() as i64,
                task.completed_items,
                task.failed_items,
                json_text(&task.config),
                task.error_message,
                task.started_at,
                task.completed_at,
                task.next_retry_at,
                task.created_at,
                task.updated_at,
            ],
        )?;
        let task_id = tx.last_insert_rowid();

        {
            let mut stmt = tx.prepare(
                "INSERT INTO task_items (task_id, cell_id, dataset_item_id, status, retry_count,
                                         input_data, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for item in items {
                stmt.execute(params![
                    task_id,
                    item.cell_id,
                    item.dataset_item_id,
                    item.status.to_string(),
                    item.retry_count,
                    opt_json_text(&item.input_data),
                    item.created_at,
                    item.updated_at,
                ])?;
            }
        }

        tx.commit().context("Failed to commit column task insert")?;
        Ok(Some(task_id))
    }

    pub fn get_column_task(&self, id: i64) -> Result<Option<ColumnTask>> {
        self.conn()
            .query_row("SELECT * FROM column_tasks WHERE id = ?1", params![id], row_to_task)
            .optional()
            .context("Failed to get column task")
    }

    pub fn start_column_task(&mut self, task_id: i64) -> Result<()> {
        let now = now_ms();
        self.conn()
            .execute(
                "UPDATE column_tasks SET status = 'running', started_at = ?2, updated_at = ?2 WHERE id = ?1",
                params![task_id, now],
            )
            .context("Failed to start column task")?;
        Ok(())
    }

    /// Move a task into a state, optionally stamping completion.
    pub fn set_column_task_status(
        &mut self,
        task_id: i64,
        status: TaskStatus,
        error_message: Option<&str>,
        stamp_completed: bool,
    ) -> Result<bool> {
        let now = now_ms();
        let completed_at = if stamp_completed { Some(now) } else { None };
        let updated = self
            .conn()
            .execute(
                "UPDATE column_tasks
                 SET status = ?2,
                     error_message = COALESCE(?3, error_message),
                     completed_at = COALESCE(?4, completed_at),
                     updated_at = ?5
                 WHERE id = ?1",
                params![task_id, status.to_string(), error_message, completed_at, now],
            )
            .context("Failed to update column task status")?;
        Ok(updated > 0)
    }

    pub fn schedule_column_task_retry(&mut self, task_id: i64, retries_done: i64, next_retry_at: i64) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE column_tasks
                 SET status = 'retrying', retries_done = ?2, next_retry_at = ?3,
                     error_message = NULL, updated_at = ?4
                 WHERE id = ?1",
                params![task_id, retries_done, next_retry_at, now_ms()],
            )
            .context("Failed to schedule column task retry")?;
        Ok(())
    }

    pub fn update_column_task_progress(&mut self, task_id: i64, completed_items: i64, failed_items: i64) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE column_tasks SET completed_items = ?2, failed_items = ?3, updated_at = ?4 WHERE id = ?1",
                params![task_id, completed_items, failed_items, now_ms()],
            )
            .context("Failed to update column task progress")?;
        Ok(())
    }

    /// Orphan recovery: put a task back to pending and release its running
    /// items so a fresh worker can pick them up.
    pub fn reset_column_task_pending(&mut self, task_id: i64) -> Result<()> {
        let now = now_ms();
        let tx = self.conn_mut().transaction()?;
        tx.execute(
            "UPDATE column_tasks SET status = 'pending', started_at = NULL, updated_at = ?2 WHERE id = ?1",
            params![task_id, now],
        )?;
        tx.execute(
            "UPDATE task_items SET status = 'pending', started_at = NULL, updated_at = ?2
             WHERE task_id = ?1 AND status = 'running'",
            params![task_id, now],
        )?;
        tx.commit().context("Failed to reset column task")?;
        Ok(())
    }

    /// Pending tasks, at most one per result. Within a result the lowest
    /// priority (= column position) wins so columns dispatch in pipeline
    /// order; across results higher priorities go first.
    pub fn pending_column_tasks(&self, limit: usize) -> Result<Vec<ColumnTask>> {
        let mut stmt = self.conn().prepare(
            "SELECT * FROM (
                 SELECT column_tasks.*,
                        ROW_NUMBER() OVER (PARTITION BY result_id ORDER BY priority ASC, id ASC) AS rn
                 FROM column_tasks
                 WHERE status = 'pending'
             )
             WHERE rn = 1
             ORDER BY priority DESC, result_id ASC
             LIMIT ?1",
        )?;
        let tasks = stmt
            .query_map(params![limit as i64], row_to_task)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list pending column tasks")?;
        Ok(tasks)
    }

    /// Tasks whose retry delay has elapsed.
    pub fn retryable_column_tasks(&self, now: i64) -> Result<Vec<ColumnTask>> {
        let mut stmt = self.conn().prepare(
            "SELECT * FROM column_tasks
             WHERE status = 'retrying' AND (next_retry_at IS NULL OR next_retry_at <= ?1)
             ORDER BY priority DESC, next_retry_at ASC",
        )?;
        let tasks = stmt
            .query_map(params![now], row_to_task)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list retryable column tasks")?;
        Ok(tasks)
    }

    /// Running tasks started at or before the cutoff - timeout candidates,
    /// pending the log-recency confirmation.
    pub fn running_column_tasks_started_before(&self, cutoff: i64) -> Result<Vec<ColumnTask>> {
        let mut stmt = self.conn().prepare(
            "SELECT * FROM column_tasks
             WHERE status = 'running' AND started_at IS NOT NULL AND started_at <= ?1",
        )?;
        let tasks = stmt
            .query_map(params![cutoff], row_to_task)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list stale running tasks")?;
        Ok(tasks)
    }

    pub fn column_tasks_for_result(&self, result_id: i64) -> Result<Vec<ColumnTask>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT * FROM column_tasks WHERE result_id = ?1 ORDER BY id ASC")?;
        let tasks = stmt
            .query_map(params![result_id], row_to_task)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list result tasks")?;
        Ok(tasks)
    }

    /// Whether any task holds the single-flight key for `(result, column)`.
    pub fn has_active_task_for_column(&self, result_id: i64, column_id: i64) -> Result<bool> {
        let count: i64 = self
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM column_tasks
                 WHERE result_id = ?1 AND column_id = ?2
                   AND status IN ('pending', 'running', 'retrying')",
                params![result_id, column_id],
                |row| row.get(0),
            )
            .context("Failed to probe single-flight key")?;
        Ok(count > 0)
    }

    pub fn get_task_item(&self, id: i64) -> Result<Option<TaskItem>> {
        self.conn()
            .query_row("SELECT * FROM task_items WHERE id = ?1", params![id], row_to_task_item)
            .optional()
            .context("Failed to get task item")
    }

    pub fn pending_task_items(&self, task_id: i64) -> Result<Vec<TaskItem>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT * FROM task_items WHERE task_id = ?1 AND status = 'pending' ORDER BY id ASC")?;
        let items = stmt
            .query_map(params![task_id], row_to_task_item)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list pending task items")?;
        Ok(items)
    }

    pub fn start_task_item(&mut self, item_id: i64) -> Result<()> {
        let now = now_ms();
        self.conn()
            .execute(
                "UPDATE task_items SET status = 'running', started_at = ?2, updated_at = ?2 WHERE id = ?1",
                params![item_id, now],
            )
            .context("Failed to start task item")?;
        Ok(())
    }

    pub fn finish_task_item(
        &mut self,
        item_id: i64,
        status: TaskItemStatus,
        output_data: Option<&Value>,
        input_data: Option<&Value>,
        error_message: Option<&str>,
        execution_time_ms: i64,
    ) -> Result<()> {
        let now = now_ms();
        self.conn()
            .execute(
                "UPDATE task_items
                 SET status = ?2, output_data = ?3, input_data = COALESCE(?4, input_data),
                     error_message = ?5, execution_time_ms = ?6, completed_at = ?7, updated_at = ?7
                 WHERE id = ?1",
                params![
                    item_id,
                    status.to_string(),
                    output_data.map(|v| v.to_string()),
                    input_data.map(|v| v.to_string()),
                    error_message,
                    execution_time_ms,
                    now,
                ],
            )
            .context("Failed to finish task item")?;
        Ok(())
    }

    /// Put failed items back to pending for a retry round; bumps each
    /// item's retry counter.
    pub fn reset_failed_task_items(&mut self, task_id: i64) -> Result<usize> {
        let reset = self
            .conn()
            .execute(
                "UPDATE task_items
                 SET status = 'pending', retry_count = retry_count + 1, error_message = NULL,
                     started_at = NULL, completed_at = NULL, updated_at = ?2
                 WHERE task_id = ?1 AND status = 'failed'",
                params![task_id, now_ms()],
            )
            .context("Failed to reset failed task items")?;
        Ok(reset)
    }

    pub fn running_task_item(&self, task_id: i64) -> Result<Option<TaskItem>> {
        self.conn()
            .query_row(
                "SELECT * FROM task_items WHERE task_id = ?1 AND status = 'running' LIMIT 1",
                params![task_id],
                row_to_task_item,
            )
            .optional()
            .context("Failed to get running task item")
    }

    pub fn append_task_log(&mut self, log: &TaskLog) -> Result<i64> {
        self.conn()
            .execute(
                "INSERT INTO task_logs (task_id, task_item_id, level, message, details, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    log.task_id,
                    log.task_item_id,
                    log.level.to_string(),
                    log.message,
                    opt_json_text(&log.details),
                    log.created_at,
                ],
            )
            .context("Failed to append task log")?;
        Ok(self.conn().last_insert_rowid())
    }

    /// Whether the task logged anything after `since`. Used to tell a
    /// genuinely stuck task from a slow one.
    pub fn has_recent_task_log(&self, task_id: i64, since: i64) -> Result<bool> {
        let count: i64 = self
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM task_logs WHERE task_id = ?1 AND created_at > ?2",
                params![task_id, since],
                |row| row.get(0),
            )
            .context("Failed to probe task logs")?;
        Ok(count > 0)
    }

    pub fn recent_task_logs(&self, task_id: i64, limit: usize) -> Result<Vec<TaskLog>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT * FROM task_logs WHERE task_id = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2")?;
        let logs = stmt
            .query_map(params![task_id, limit as i64], row_to_log)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list task logs")?;
        Ok(logs)
    }

    /// Maintenance: drop finished tasks older than the cutoff. Items and
    /// logs cascade through foreign keys.
    pub fn delete_finished_tasks_before(&mut self, cutoff: i64) -> Result<usize> {
        let deleted = self
            .conn()
            .execute(
                "DELETE FROM column_tasks
                 WHERE status IN ('completed', 'cancelled') AND completed_at IS NOT NULL AND completed_at < ?1",
                params![cutoff],
            )
            .context("Failed to delete finished tasks")?;
        Ok(deleted)
    }

    /// Maintenance: drop logs older than the cutoff.
    pub fn delete_logs_before(&mut self, cutoff: i64) -> Result<usize> {
        let deleted = self
            .conn()
            .execute("DELETE FROM task_logs WHERE created_at < ?1", params![cutoff])
            .context("Failed to delete old logs")?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Cell, ColumnKind, DatasetItem, EvalResult, LogLevel, Pipeline, RunType};
    use crate::model::Column as PipelineColumn;
    use serde_json::json;

    struct Seed {
        pipeline_id: i64,
        result_id: i64,
        column_id: i64,
        cell_id: i64,
        item_id: i64,
    }

    fn seed(store: &mut Store) -> Seed {
        let pipeline_id = store.create_pipeline(&Pipeline::new(1, 1, 1, "p")).unwrap();
        let result_id = store.create_result(&EvalResult::new(pipeline_id, RunType::Release)).unwrap();
        let item_id = store
            .create_dataset_item(&DatasetItem::new(1, serde_json::Map::new()))
            .unwrap();
        let column_id = store
            .create_column(&PipelineColumn::new(pipeline_id, "v", ColumnKind::Exact, 1))
            .unwrap();
        store
            .insert_cells(&[Cell::new(pipeline_id, result_id, item_id, column_id)])
            .unwrap();
        let cell_id = store.get_cell(result_id, item_id, column_id).unwrap().unwrap().id;
        Seed {
            pipeline_id,
            result_id,
            column_id,
            cell_id,
            item_id,
        }
    }

    fn make_task(store: &mut Store, seed: &Seed) -> i64 {
        let task = ColumnTask::new(seed.pipeline_id, seed.result_id, seed.column_id, 1);
        let item = TaskItem::new(0, seed.cell_id, seed.item_id);
        store.create_column_task(&task, &[item]).unwrap().unwrap()
    }

    #[test]
    fn test_single_flight_enforced() {
        let mut store = Store::open_in_memory().unwrap();
        let s = seed(&mut store);
        let first = make_task(&mut store, &s);
        assert!(first > 0);

        // Second creation for the same (result, column) must be refused.
        let task = ColumnTask::new(s.pipeline_id, s.result_id, s.column_id, 1);
        assert!(store.create_column_task(&task, &[]).unwrap().is_none());
        assert!(store.has_active_task_for_column(s.result_id, s.column_id).unwrap());

        // Once the first task is terminal the key is free again.
        store
            .set_column_task_status(first, TaskStatus::Completed, None, true)
            .unwrap();
        assert!(!store.has_active_task_for_column(s.result_id, s.column_id).unwrap());
        assert!(store.create_column_task(&task, &[]).unwrap().is_some());
    }

    #[test]
    fn test_pending_window_picks_one_per_result() {
        let mut store = Store::open_in_memory().unwrap();
        let s = seed(&mut store);
        // Same result, three columns -> three pending tasks.
        for pos in [2, 3, 4] {
            let col = store
                .create_column(&PipelineColumn::new(s.pipeline_id, format!("c{pos}"), ColumnKind::Contains, pos))
                .unwrap();
            let task = ColumnTask::new(s.pipeline_id, s.result_id, col, 1).with_priority(pos);
            store.create_column_task(&task, &[]).unwrap().unwrap();
        }

        let picked = store.pending_column_tasks(10).unwrap();
        assert_eq!(picked.len(), 1, "one task per result");
        assert_eq!(picked[0].priority, 2, "the earliest column wins the partition");
    }

    #[test]
    fn test_retry_scheduling_and_query() {
        let mut store = Store::open_in_memory().unwrap();
        let s = seed(&mut store);
        let task_id = make_task(&mut store, &s);

        let now = now_ms();
        store.schedule_column_task_retry(task_id, 1, now + 60_000).unwrap();
        assert!(store.retryable_column_tasks(now).unwrap().is_empty());
        assert_eq!(store.retryable_column_tasks(now + 61_000).unwrap().len(), 1);

        let task = store.get_column_task(task_id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Retrying);
        assert_eq!(task.retries_done, 1);
    }

    #[test]
    fn test_task_item_lifecycle() {
        let mut store = Store::open_in_memory().unwrap();
        let s = seed(&mut store);
        let task_id = make_task(&mut store, &s);

        let items = store.pending_task_items(task_id).unwrap();
        assert_eq!(items.len(), 1);

        store.start_task_item(items[0].id).unwrap();
        assert!(store.running_task_item(task_id).unwrap().is_some());

        store
            .finish_task_item(
                items[0].id,
                TaskItemStatus::Failed,
                Some(&json!({"error": "x"})),
                None,
                Some("x"),
                12,
            )
            .unwrap();
        assert!(store.pending_task_items(task_id).unwrap().is_empty());

        // Retry reset puts it back and bumps the counter.
        assert_eq!(store.reset_failed_task_items(task_id).unwrap(), 1);
        let item = store.get_task_item(items[0].id).unwrap().unwrap();
        assert_eq!(item.status, TaskItemStatus::Pending);
        assert_eq!(item.retry_count, 1);
        assert!(item.error_message.is_none());
    }

    #[test]
    fn test_reset_column_task_pending_releases_running_items() {
        let mut store = Store::open_in_memory().unwrap();
        let s = seed(&mut store);
        let task_id = make_task(&mut store, &s);

        store.start_column_task(task_id).unwrap();
        let items = store.pending_task_items(task_id).unwrap();
        store.start_task_item(items[0].id).unwrap();

        store.reset_column_task_pending(task_id).unwrap();
        let task = store.get_column_task(task_id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.started_at.is_none());
        assert_eq!(store.pending_task_items(task_id).unwrap().len(), 1);
    }

    #[test]
    fn test_log_recency_probe() {
        let mut store = Store::open_in_memory().unwrap();
        let s = seed(&mut store);
        let task_id = make_task(&mut store, &s);

        let before = now_ms() - 1;
        assert!(!store.has_recent_task_log(task_id, before).unwrap());

        store
            .append_task_log(&TaskLog::new(task_id, LogLevel::Info, "working"))
            .unwrap();
        assert!(store.has_recent_task_log(task_id, before).unwrap());
        assert!(!store.has_recent_task_log(task_id, now_ms() + 1000).unwrap());

        let logs = store.recent_task_logs(task_id, 10).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].message, "working");
    }

    #[test]
    fn test_maintenance_sweeps() {
        let mut store = Store::open_in_memory().unwrap();
        let s = seed(&mut store);
        let task_id = make_task(&mut store, &s);

        store
            .append_task_log(&TaskLog::new(task_id, LogLevel::Info, "old"))
            .unwrap();
        // The log purge honours its cutoff independently of the task.
        assert_eq!(store.delete_logs_before(now_ms() - 10_000).unwrap(), 0);
        assert_eq!(store.delete_logs_before(now_ms() + 10_000).unwrap(), 1);

        store
            .append_task_log(&TaskLog::new(task_id, LogLevel::Info, "newer"))
            .unwrap();
        store
            .set_column_task_status(task_id, TaskStatus::Completed, None, true)
            .unwrap();

        // Not old enough yet.
        assert_eq!(store.delete_finished_tasks_before(now_ms() - 10_000).unwrap(), 0);
        // Far-future cutoff sweeps the task; its remaining logs and items
        // cascade with it.
        assert_eq!(store.delete_finished_tasks_before(now_ms() + 10_000).unwrap(), 1);
        assert!(store.recent_task_logs(task_id, 10).unwrap().is_empty());
    }
}

//! Row-task queries

use eyre::{Context, Result};
use rusqlite::{OptionalExtension, Row, params};
use serde_json::Map;
use tracing::debug;

use crate::model::{RowTask, RowTaskStatus, RowVerdict, now_ms};

use super::{Store, parse_enum, parse_opt_enum, parse_opt_map};

fn row_to_row_task(row: &Row) -> rusqlite::Result<RowTask> {
    Ok(RowTask {
        id: row.get("id")?,
        result_id: row.get("result_id")?,
        dataset_item_id: row.get("dataset_item_id")?,
        status: parse_enum::<RowTaskStatus>(row.get("status")?)?,
        row_result: parse_opt_enum::<RowVerdict>(row.get("row_result")?)?,
        current_column_position: row.get("current_column_position")?,
        execution_variables: parse_opt_map(row.get("execution_variables")?),
        error_message: row.get("error_message")?,
        execution_time_ms: row.get("execution_time_ms")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

impl Store {
    /// Insert row tasks, skipping `(result, dataset_item)` pairs that
    /// already exist. Returns the number actually inserted.
    pub fn insert_row_tasks(&mut self, tasks: &[RowTask]) -> Result<usize> {
        let tx = self.conn_mut().transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO row_tasks (result_id, dataset_item_id, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for task in tasks {
                inserted += stmt.execute(params![
                    task.result_id,
                    task.dataset_item_id,
                    task.status.to_string(),
                    task.created_at,
                    task.updated_at,
                ])?;
            }
        }
        tx.commit().context("Failed to commit row task insert")?;
        debug!(requested = tasks.len(), inserted, "Inserted row tasks");
        Ok(inserted)
    }

    pub fn get_row_task(&self, id: i64) -> Result<Option<RowTask>> {
        self.conn()
            .query_row("SELECT * FROM row_tasks WHERE id = ?1", params![id], row_to_row_task)
            .optional()
            .context("Failed to get row task")
    }

    /// Pending row tasks of one result, optionally narrowed to a selection
    /// of dataset items.
    pub fn pending_row_tasks_for_result(&self, result_id: i64, item_ids: Option<&[i64]>) -> Result<Vec<RowTask>> {
        let mut sql = "SELECT * FROM row_tasks WHERE result_id = ?1 AND status = 'pending'".to_string();
        if let Some(ids) = item_ids {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            let placeholders = ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(", ");
            sql.push_str(&format!(" AND dataset_item_id IN ({placeholders})"));
        }
        sql.push_str(" ORDER BY id ASC");

        let mut stmt = self.conn().prepare(&sql)?;
        let tasks = stmt
            .query_map(params![result_id], row_to_row_task)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list pending row tasks")?;
        Ok(tasks)
    }

    /// Pending row tasks, at most one per result, for the unified pending
    /// dispatch.
    pub fn pending_row_tasks(&self, limit: usize) -> Result<Vec<RowTask>> {
        let mut stmt = self.conn().prepare(
            "SELECT * FROM (
                 SELECT row_tasks.*,
                        ROW_NUMBER() OVER (PARTITION BY result_id ORDER BY id ASC) AS rn
                 FROM row_tasks
                 WHERE status = 'pending'
             )
             WHERE rn = 1
             ORDER BY result_id ASC
             LIMIT ?1",
        )?;
        let tasks = stmt
            .query_map(params![limit as i64], row_to_row_task)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list pending row tasks")?;
        Ok(tasks)
    }

    pub fn mark_row_tasks_running(&mut self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let now = now_ms();
        let placeholders = ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(", ");
        self.conn()
            .execute(
                &format!(
                    "UPDATE row_tasks SET status = 'running', started_at = ?1, updated_at = ?1
                     WHERE id IN ({placeholders})"
                ),
                params![now],
            )
            .context("Failed to mark row tasks running")?;
        Ok(())
    }

    pub fn update_row_task_position(&mut self, row_task_id: i64, position: i64) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE row_tasks SET current_column_position = ?2, updated_at = ?3 WHERE id = ?1",
                params![row_task_id, position, now_ms()],
            )
            .context("Failed to update row task position")?;
        Ok(())
    }

    pub fn complete_row_task(
        &mut self,
        row_task_id: i64,
        verdict: RowVerdict,
        execution_variables: &Map<String, serde_json::Value>,
        execution_time_ms: i64,
    ) -> Result<()> {
        let now = now_ms();
        self.conn()
            .execute(
                "UPDATE row_tasks
                 SET status = 'completed', row_result = ?2, execution_variables = ?3,
                     execution_time_ms = ?4, completed_at = ?5, updated_at = ?5
                 WHERE id = ?1",
                params![
                    row_task_id,
                    verdict.to_string(),
                    serde_json::Value::Object(execution_variables.clone()).to_string(),
                    execution_time_ms,
                    now,
                ],
            )
            .context("Failed to complete row task")?;
        Ok(())
    }

    pub fn fail_row_task(&mut self, row_task_id: i64, error: &str, execution_time_ms: i64) -> Result<()> {
        let now = now_ms();
        self.conn()
            .execute(
                "UPDATE row_tasks
                 SET status = 'failed', row_result = 'failed', error_message = ?2,
                     execution_time_ms = ?3, completed_at = ?4, updated_at = ?4
                 WHERE id = ?1",
                params![row_task_id, error, execution_time_ms, now],
            )
            .context("Failed to fail row task")?;
        Ok(())
    }

    /// Orphan recovery: wipe execution state and put the row back to
    /// pending.
    pub fn reset_row_task_pending(&mut self, row_task_id: i64) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE row_tasks
                 SET status = 'pending', row_result = NULL, current_column_position = NULL,
                     execution_variables = NULL, error_message = NULL,
                     started_at = NULL, completed_at = NULL, updated_at = ?2
                 WHERE id = ?1",
                params![row_task_id, now_ms()],
            )
            .context("Failed to reset row task")?;
        Ok(())
    }

    pub fn running_row_tasks_started_before(&self, cutoff: i64) -> Result<Vec<RowTask>> {
        let mut stmt = self.conn().prepare(
            "SELECT * FROM row_tasks
             WHERE status = 'running' AND started_at IS NOT NULL AND started_at <= ?1",
        )?;
        let tasks = stmt
            .query_map(params![cutoff], row_to_row_task)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list stale running row tasks")?;
        Ok(tasks)
    }

    /// Whether the row task has seen no update since the cutoff - the
    /// really-stuck confirmation for rows, which have no log stream.
    pub fn row_task_quiet_since(&self, row_task_id: i64, cutoff: i64) -> Result<bool> {
        let quiet: Option<i64> = self
            .conn()
            .query_row(
                "SELECT id FROM row_tasks WHERE id = ?1 AND updated_at < ?2",
                params![row_task_id, cutoff],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to probe row task quiescence")?;
        Ok(quiet.is_some())
    }

    pub fn row_tasks_for_result(&self, result_id: i64) -> Result<Vec<RowTask>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT * FROM row_tasks WHERE result_id = ?1 ORDER BY id ASC")?;
        let tasks = stmt
            .query_map(params![result_id], row_to_row_task)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list result row tasks")?;
        Ok(tasks)
    }
}

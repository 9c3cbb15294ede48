//! Result and cell queries

use eyre::{Context, Result};
use rusqlite::{OptionalExtension, Row, params};
use serde_json::Value;
use tracing::debug;

use crate::model::{Cell, CellStatus, Column, EvalResult, ResultStatus, RunType, now_ms};

use super::{Store, map_text, opt_json_text, parse_enum, parse_json, parse_map};

fn row_to_result(row: &Row) -> rusqlite::Result<EvalResult> {
    Ok(EvalResult {
        id: row.get("id")?,
        pipeline_id: row.get("pipeline_id")?,
        run_type: parse_enum::<RunType>(row.get("run_type")?)?,
        status: parse_enum::<ResultStatus>(row.get("status")?)?,
        total: row.get("total")?,
        passed: row.get("passed")?,
        unpassed: row.get("unpassed")?,
        failed: row.get("failed")?,
        success_rate: row.get("success_rate")?,
        prompt_versions: parse_map(row.get("prompt_versions")?),
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn row_to_cell(row: &Row) -> rusqlite::Result<Cell> {
    Ok(Cell {
        id: row.get("id")?,
        pipeline_id: row.get("pipeline_id")?,
        result_id: row.get("result_id")?,
        dataset_item_id: row.get("dataset_item_id")?,
        column_id: row.get("column_id")?,
        status: parse_enum::<CellStatus>(row.get("status")?)?,
        value: parse_json(row.get("value")?),
        display_value: parse_json(row.get("display_value")?),
        error_message: row.get("error_message")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

impl Store {
    pub fn create_result(&mut self, result: &EvalResult) -> Result<i64> {
        self.conn()
            .execute(
                "INSERT INTO results (pipeline_id, run_type, status, total, passed, unpassed, failed,
                                      success_rate, prompt_versions, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    result.pipeline_id,
                    result.run_type.to_string(),
                    result.status.to_string(),
                    result.total,
                    result.passed,
                    result.unpassed,
                    result.failed,
                    result.success_rate,
                    map_text(&result.prompt_versions),
                    result.created_at,
                    result.updated_at,
                ],
            )
            .context("Failed to insert result")?;
        Ok(self.conn().last_insert_rowid())
    }

    pub fn get_result(&self, id: i64) -> Result<Option<EvalResult>> {
        self.conn()
            .query_row("SELECT * FROM results WHERE id = ?1", params![id], row_to_result)
            .optional()
            .context("Failed to get result")
    }

    /// The staging result of a pipeline, if any (at most one by invariant).
    pub fn staging_result(&self, pipeline_id: i64) -> Result<Option<EvalResult>> {
        self.conn()
            .query_row(
                "SELECT * FROM results WHERE pipeline_id = ?1 AND run_type = 'staging'
                 ORDER BY created_at DESC LIMIT 1",
                params![pipeline_id],
                row_to_result,
            )
            .optional()
            .context("Failed to get staging result")
    }

    #[allow(clippy::too_many_arguments)]
    pub fn update_result_stats(
        &mut self,
        result_id: i64,
        status: ResultStatus,
        total: i64,
        passed: i64,
        unpassed: i64,
        failed: i64,
        success_rate: f64,
    ) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE results SET status = ?2, total = ?3, passed = ?4, unpassed = ?5, failed = ?6,
                                    success_rate = ?7, updated_at = ?8
                 WHERE id = ?1",
                params![
                    result_id,
                    status.to_string(),
                    total,
                    passed,
                    unpassed,
                    failed,
                    success_rate,
                    now_ms()
                ],
            )
            .context("Failed to update result stats")?;
        Ok(())
    }

    pub fn set_result_status(&mut self, result_id: i64, status: ResultStatus) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE results SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![result_id, status.to_string(), now_ms()],
            )
            .context("Failed to update result status")?;
        Ok(())
    }

    /// Bulk-insert cells inside one transaction.
    pub fn insert_cells(&mut self, cells: &[Cell]) -> Result<usize> {
        let tx = self.conn_mut().transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO cells (pipeline_id, result_id, dataset_item_id, column_id, status,
                                    value, display_value, error_message, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for cell in cells {
                stmt.execute(params![
                    cell.pipeline_id,
                    cell.result_id,
                    cell.dataset_item_id,
                    cell.column_id,
                    cell.status.to_string(),
                    opt_json_text(&cell.value),
                    opt_json_text(&cell.display_value),
                    cell.error_message,
                    cell.created_at,
                    cell.updated_at,
                ])?;
            }
        }
        tx.commit().context("Failed to commit cell insert")?;
        debug!(count = cells.len(), "Inserted cells");
        Ok(cells.len())
    }

    pub fn get_cell_by_id(&self, id: i64) -> Result<Option<Cell>> {
        self.conn()
            .query_row("SELECT * FROM cells WHERE id = ?1", params![id], row_to_cell)
            .optional()
            .context("Failed to get cell")
    }

    pub fn get_cell(&self, result_id: i64, dataset_item_id: i64, column_id: i64) -> Result<Option<Cell>> {
        self.conn()
            .query_row(
                "SELECT * FROM cells WHERE result_id = ?1 AND dataset_item_id = ?2 AND column_id = ?3",
                params![result_id, dataset_item_id, column_id],
                row_to_cell,
            )
            .optional()
            .context("Failed to get cell")
    }

    pub fn update_cell_completed(&mut self, cell_id: i64, value: &Value, display_value: &Value) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE cells SET status = 'completed', value = ?2, display_value = ?3,
                                  error_message = NULL, updated_at = ?4
                 WHERE id = ?1",
                params![cell_id, value.to_string(), display_value.to_string(), now_ms()],
            )
            .context("Failed to mark cell completed")?;
        Ok(())
    }

    pub fn update_cell_failed(&mut self, cell_id: i64, error: &str) -> Result<()> {
        let display = serde_json::json!({"value": error});
        self.conn()
            .execute(
                "UPDATE cells SET status = 'failed', error_message = ?2, display_value = ?3, updated_at = ?4
                 WHERE id = ?1",
                params![cell_id, error, display.to_string(), now_ms()],
            )
            .context("Failed to mark cell failed")?;
        Ok(())
    }

    pub fn reset_cell_new(&mut self, cell_id: i64) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE cells SET status = 'new', value = NULL, display_value = NULL,
                                  error_message = NULL, updated_at = ?2
                 WHERE id = ?1",
                params![cell_id, now_ms()],
            )
            .context("Failed to reset cell")?;
        Ok(())
    }

    pub fn delete_result_cells(&mut self, result_id: i64) -> Result<usize> {
        let deleted = self
            .conn()
            .execute("DELETE FROM cells WHERE result_id = ?1", params![result_id])
            .context("Failed to delete result cells")?;
        debug!(result_id, deleted, "Deleted result cells");
        Ok(deleted)
    }

    /// Cells of one column within a result, optionally filtered by status.
    pub fn cells_for_column(&self, result_id: i64, column_id: i64, status: Option<CellStatus>) -> Result<Vec<Cell>> {
        let mut sql = "SELECT * FROM cells WHERE result_id = ?1 AND column_id = ?2".to_string();
        if let Some(status) = status {
            sql.push_str(&format!(" AND status = '{status}'"));
        }
        sql.push_str(" ORDER BY id ASC");

        let mut stmt = self.conn().prepare(&sql)?;
        let cells = stmt
            .query_map(params![result_id, column_id], row_to_cell)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list column cells")?;
        Ok(cells)
    }

    /// Cells of earlier columns for one dataset item, joined with their
    /// column, in ascending position order. Feeds inter-column data flow.
    pub fn previous_cells(
        &self,
        result_id: i64,
        dataset_item_id: i64,
        before_position: i64,
    ) -> Result<Vec<(Column, Cell)>> {
        let mut stmt = self.conn().prepare(
            "SELECT c.id AS c_id, c.pipeline_id AS c_pipeline_id, c.name AS c_name, c.kind AS c_kind,
                    c.position AS c_position, c.config AS c_config,
                    c.created_at AS c_created_at, c.updated_at AS c_updated_at,
                    cells.*
             FROM cells
             JOIN columns c ON c.id = cells.column_id
             WHERE cells.result_id = ?1 AND cells.dataset_item_id = ?2 AND c.position < ?3
             ORDER BY c.position ASC",
        )?;
        let rows = stmt
            .query_map(params![result_id, dataset_item_id, before_position], |row| {
                use crate::model::ColumnKind;
                let column = Column {
                    id: row.get("c_id")?,
                    pipeline_id: row.get("c_pipeline_id")?,
                    name: row.get("c_name")?,
                    kind: parse_enum::<ColumnKind>(row.get("c_kind")?)?,
                    position: row.get("c_position")?,
                    config: parse_json(row.get("c_config")?).unwrap_or(Value::Null),
                    created_at: row.get("c_created_at")?,
                    updated_at: row.get("c_updated_at")?,
                };
                Ok((column, row_to_cell(row)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list previous cells")?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ColumnKind, Pipeline};
    use serde_json::json;

    fn seed(store: &mut Store) -> (i64, i64) {
        let pid = store.create_pipeline(&Pipeline::new(1, 1, 1, "p")).unwrap();
        let rid = store.create_result(&EvalResult::new(pid, RunType::Release)).unwrap();
        (pid, rid)
    }

    #[test]
    fn test_result_roundtrip_and_stats() {
        let mut store = Store::open_in_memory().unwrap();
        let (_pid, rid) = seed(&mut store);

        let result = store.get_result(rid).unwrap().unwrap();
        assert_eq!(result.status, ResultStatus::New);
        assert_eq!(result.total, 0);

        store
            .update_result_stats(rid, ResultStatus::Completed, 10, 6, 3, 1, 0.9)
            .unwrap();
        let result = store.get_result(rid).unwrap().unwrap();
        assert_eq!(result.status, ResultStatus::Completed);
        assert_eq!(result.total, result.passed + result.unpassed + result.failed);
        assert!((result.success_rate - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn test_staging_result_lookup() {
        let mut store = Store::open_in_memory().unwrap();
        let pid = store.create_pipeline(&Pipeline::new(1, 1, 1, "p")).unwrap();
        assert!(store.staging_result(pid).unwrap().is_none());

        let sid = store.create_result(&EvalResult::new(pid, RunType::Staging)).unwrap();
        store.create_result(&EvalResult::new(pid, RunType::Release)).unwrap();

        assert_eq!(store.staging_result(pid).unwrap().unwrap().id, sid);
    }

    #[test]
    fn test_prompt_versions_survive_roundtrip() {
        let mut store = Store::open_in_memory().unwrap();
        let pid = store.create_pipeline(&Pipeline::new(1, 1, 1, "p")).unwrap();

        let mut result = EvalResult::new(pid, RunType::Release);
        result
            .prompt_versions
            .insert("4".to_string(), json!({"version_id": 17, "version_number": 2}));
        let rid = store.create_result(&result).unwrap();

        let loaded = store.get_result(rid).unwrap().unwrap();
        assert_eq!(loaded.prompt_versions["4"]["version_id"], json!(17));
        assert!(loaded.has_llm_calls());
    }

    #[test]
    fn test_cell_updates() {
        let mut store = Store::open_in_memory().unwrap();
        let (pid, rid) = seed(&mut store);
        let item = store
            .create_dataset_item(&crate::model::DatasetItem::new(1, serde_json::Map::new()))
            .unwrap();
        let col = store.create_column(&Column::new(pid, "v", ColumnKind::Exact, 1)).unwrap();

        store.insert_cells(&[Cell::new(pid, rid, item, col)]).unwrap();
        let cell = store.get_cell(rid, item, col).unwrap().unwrap();
        assert_eq!(cell.status, CellStatus::New);

        store
            .update_cell_completed(cell.id, &json!({"value": true}), &json!({"value": "passed"}))
            .unwrap();
        let cell = store.get_cell_by_id(cell.id).unwrap().unwrap();
        assert_eq!(cell.status, CellStatus::Completed);
        assert!(cell.is_truthy());

        store.update_cell_failed(cell.id, "boom").unwrap();
        let cell = store.get_cell_by_id(cell.id).unwrap().unwrap();
        assert_eq!(cell.status, CellStatus::Failed);
        assert_eq!(cell.error_message.as_deref(), Some("boom"));

        store.reset_cell_new(cell.id).unwrap();
        let cell = store.get_cell_by_id(cell.id).unwrap().unwrap();
        assert_eq!(cell.status, CellStatus::New);
        assert!(cell.value.is_none());
    }

    #[test]
    fn test_previous_cells_ordered_and_bounded() {
        let mut store = Store::open_in_memory().unwrap();
        let (pid, rid) = seed(&mut store);
        let item = store
            .create_dataset_item(&crate::model::DatasetItem::new(1, serde_json::Map::new()))
            .unwrap();

        let c0 = store
            .create_column(&Column::new(pid, "vars", ColumnKind::DatasetVariable, 0))
            .unwrap();
        let c1 = store
            .create_column(&Column::new(pid, "answer", ColumnKind::PromptTemplate, 1))
            .unwrap();
        let c2 = store.create_column(&Column::new(pid, "v", ColumnKind::Exact, 2)).unwrap();

        store
            .insert_cells(&[
                Cell::new(pid, rid, item, c0).completed_with(json!({"q": "hi"})),
                Cell::new(pid, rid, item, c1).completed_with(json!({"value": "out"})),
                Cell::new(pid, rid, item, c2),
            ])
            .unwrap();

        let previous = store.previous_cells(rid, item, 2).unwrap();
        assert_eq!(previous.len(), 2);
        assert_eq!(previous[0].0.name, "vars");
        assert_eq!(previous[1].0.name, "answer");
        assert_eq!(previous[1].1.inner_value(), Some(&json!("out")));
    }
}

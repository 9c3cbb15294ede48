//! Pipeline, column and dataset-item queries

use eyre::{Context, Result};
use rusqlite::{OptionalExtension, Row, params};
use tracing::debug;

use crate::model::{Column, ColumnKind, DatasetItem, Pipeline, now_ms};

use super::{Store, json_text, map_text, parse_enum, parse_json, parse_map};

fn row_to_pipeline(row: &Row) -> rusqlite::Result<Pipeline> {
    Ok(Pipeline {
        id: row.get("id")?,
        project_id: row.get("project_id")?,
        dataset_id: row.get("dataset_id")?,
        user_id: row.get("user_id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn row_to_column(row: &Row) -> rusqlite::Result<Column> {
    Ok(Column {
        id: row.get("id")?,
        pipeline_id: row.get("pipeline_id")?,
        name: row.get("name")?,
        kind: parse_enum::<ColumnKind>(row.get("kind")?)?,
        position: row.get("position")?,
        config: parse_json(row.get("config")?).unwrap_or(serde_json::Value::Null),
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn row_to_dataset_item(row: &Row) -> rusqlite::Result<DatasetItem> {
    Ok(DatasetItem {
        id: row.get("id")?,
        dataset_id: row.get("dataset_id")?,
        variables: parse_map(row.get("variables")?),
        expected_output: row.get("expected_output")?,
        enabled: row.get("enabled")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

impl Store {
    pub fn create_pipeline(&mut self, pipeline: &Pipeline) -> Result<i64> {
        self.conn()
            .execute(
                "INSERT INTO pipelines (project_id, dataset_id, user_id, name, description, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    pipeline.project_id,
                    pipeline.dataset_id,
                    pipeline.user_id,
                    pipeline.name,
                    pipeline.description,
                    pipeline.created_at,
                    pipeline.updated_at,
                ],
            )
            .context("Failed to insert pipeline")?;
        Ok(self.conn().last_insert_rowid())
    }

    pub fn get_pipeline(&self, id: i64) -> Result<Option<Pipeline>> {
        self.conn()
            .query_row("SELECT * FROM pipelines WHERE id = ?1", params![id], row_to_pipeline)
            .optional()
            .context("Failed to get pipeline")
    }

    pub fn set_pipeline_dataset(&mut self, pipeline_id: i64, dataset_id: i64) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE pipelines SET dataset_id = ?2, updated_at = ?3 WHERE id = ?1",
                params![pipeline_id, dataset_id, now_ms()],
            )
            .context("Failed to update pipeline dataset")?;
        Ok(())
    }

    pub fn create_column(&mut self, column: &Column) -> Result<i64> {
        self.conn()
            .execute(
                "INSERT INTO columns (pipeline_id, name, kind, position, config, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    column.pipeline_id,
                    column.name,
                    column.kind.to_string(),
                    column.position,
                    json_text(&column.config),
                    column.created_at,
                    column.updated_at,
                ],
            )
            .context("Failed to insert column")?;
        Ok(self.conn().last_insert_rowid())
    }

    pub fn get_column(&self, id: i64) -> Result<Option<Column>> {
        self.conn()
            .query_row("SELECT * FROM columns WHERE id = ?1", params![id], row_to_column)
            .optional()
            .context("Failed to get column")
    }

    /// All columns of a pipeline in ascending position order.
    pub fn list_columns(&self, pipeline_id: i64) -> Result<Vec<Column>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT * FROM columns WHERE pipeline_id = ?1 ORDER BY position ASC")?;
        let columns = stmt
            .query_map(params![pipeline_id], row_to_column)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list columns")?;
        Ok(columns)
    }

    pub fn max_column_position(&self, pipeline_id: i64) -> Result<i64> {
        let max: Option<i64> = self
            .conn()
            .query_row(
                "SELECT MAX(position) FROM columns WHERE pipeline_id = ?1",
                params![pipeline_id],
                |row| row.get(0),
            )
            .context("Failed to query max position")?;
        Ok(max.unwrap_or(0))
    }

    pub fn delete_dataset_variable_columns(&mut self, pipeline_id: i64) -> Result<usize> {
        let deleted = self
            .conn()
            .execute(
                "DELETE FROM columns WHERE pipeline_id = ?1 AND kind = 'dataset_variable'",
                params![pipeline_id],
            )
            .context("Failed to delete dataset variable columns")?;
        debug!(pipeline_id, deleted, "Deleted dataset variable columns");
        Ok(deleted)
    }

    pub fn create_dataset_item(&mut self, item: &DatasetItem) -> Result<i64> {
        self.conn()
            .execute(
                "INSERT INTO dataset_items (dataset_id, variables, expected_output, enabled, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    item.dataset_id,
                    map_text(&item.variables),
                    item.expected_output,
                    item.enabled,
                    item.created_at,
                    item.updated_at,
                ],
            )
            .context("Failed to insert dataset item")?;
        Ok(self.conn().last_insert_rowid())
    }

    pub fn get_dataset_item(&self, id: i64) -> Result<Option<DatasetItem>> {
        self.conn()
            .query_row(
                "SELECT * FROM dataset_items WHERE id = ?1",
                params![id],
                row_to_dataset_item,
            )
            .optional()
            .context("Failed to get dataset item")
    }

    /// Items of a dataset, optionally narrowed to a selection, optionally
    /// restricted to enabled rows.
    pub fn list_dataset_items(
        &self,
        dataset_id: i64,
        only_enabled: bool,
        item_ids: Option<&[i64]>,
    ) -> Result<Vec<DatasetItem>> {
        let mut sql = "SELECT * FROM dataset_items WHERE dataset_id = ?1".to_string();
        if only_enabled {
            sql.push_str(" AND enabled = 1");
        }
        if let Some(ids) = item_ids {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            let placeholders = ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(", ");
            sql.push_str(&format!(" AND id IN ({placeholders})"));
        }
        sql.push_str(" ORDER BY id ASC");

        let mut stmt = self.conn().prepare(&sql)?;
        let items = stmt
            .query_map(params![dataset_id], row_to_dataset_item)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list dataset items")?;
        Ok(items)
    }
}

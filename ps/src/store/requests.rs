//! LLM request audit and feature-model queries

use eyre::{Context, Result};
use rusqlite::{OptionalExtension, Row, params};

use crate::model::{FeatureModel, RequestRecord, now_ms};

use super::{Store, map_text, opt_json_text, parse_map};

fn row_to_request(row: &Row) -> rusqlite::Result<RequestRecord> {
    Ok(RequestRecord {
        id: row.get("id")?,
        project_id: row.get("project_id")?,
        user_id: row.get("user_id")?,
        prompt_id: row.get("prompt_id")?,
        prompt_version_id: row.get("prompt_version_id")?,
        source: row.get("source")?,
        input: super::parse_json(row.get("input")?),
        variables_values: parse_map(row.get("variables_values")?),
        output: row.get("output")?,
        prompt_tokens: row.get("prompt_tokens")?,
        completion_tokens: row.get("completion_tokens")?,
        total_tokens: row.get("total_tokens")?,
        execution_time_ms: row.get("execution_time_ms")?,
        cost: row.get("cost")?,
        success: row.get("success")?,
        error_message: row.get("error_message")?,
        created_at: row.get("created_at")?,
    })
}

fn row_to_feature_model(row: &Row) -> rusqlite::Result<FeatureModel> {
    Ok(FeatureModel {
        id: row.get("id")?,
        project_id: row.get("project_id")?,
        feature_key: row.get("feature_key")?,
        provider: row.get("provider")?,
        model_id: row.get("model_id")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

impl Store {
    pub fn insert_request(&mut self, record: &RequestRecord) -> Result<i64> {
        self.conn()
            .execute(
                "INSERT INTO requests (project_id, user_id, prompt_id, prompt_version_id, source, input,
                                       variables_values, output, prompt_tokens, completion_tokens, total_tokens,
                                       execution_time_ms, cost, success, error_message, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                params![
                    record.project_id,
                    record.user_id,
                    record.prompt_id,
                    record.prompt_version_id,
                    record.source,
                    opt_json_text(&record.input),
                    map_text(&record.variables_values),
                    record.output,
                    record.prompt_tokens,
                    record.completion_tokens,
                    record.total_tokens,
                    record.execution_time_ms,
                    record.cost,
                    record.success,
                    record.error_message,
                    record.created_at,
                ],
            )
            .context("Failed to insert request record")?;
        Ok(self.conn().last_insert_rowid())
    }

    pub fn recent_requests(&self, limit: usize) -> Result<Vec<RequestRecord>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT * FROM requests ORDER BY created_at DESC, id DESC LIMIT ?1")?;
        let records = stmt
            .query_map(params![limit as i64], row_to_request)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list requests")?;
        Ok(records)
    }

    pub fn feature_model(&self, project_id: i64, feature_key: &str) -> Result<Option<FeatureModel>> {
        self.conn()
            .query_row(
                "SELECT * FROM feature_models WHERE project_id = ?1 AND feature_key = ?2",
                params![project_id, feature_key],
                row_to_feature_model,
            )
            .optional()
            .context("Failed to get feature model")
    }

    pub fn upsert_feature_model(&mut self, model: &FeatureModel) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO feature_models (project_id, feature_key, provider, model_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT (project_id, feature_key)
                 DO UPDATE SET provider = ?3, model_id = ?4, updated_at = ?5",
                params![
                    model.project_id,
                    model.feature_key,
                    model.provider,
                    model.model_id,
                    now_ms()
                ],
            )
            .context("Failed to upsert feature model")?;
        Ok(())
    }
}

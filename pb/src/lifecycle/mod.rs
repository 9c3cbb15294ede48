//! Result lifecycle
//!
//! Creates results for both execution modes, captures the prompt-version
//! snapshot, validates the pipeline shape, fans the column-mode cells and
//! tasks out, and rebuilds staging cells when the dataset is swapped or a
//! column is appended.

use serde_json::{Map, Value, json};
use std::sync::Arc;
use tracing::{info, warn};

use promptstore::{
    Cell, CellStatus, Column, ColumnKind, DatasetItem, EvalResult, Pipeline, RowTask, RunType,
};

use crate::error::{EngineError, EngineResult};
use crate::prompt::PromptSource;
use crate::scheduler::UnifiedScheduler;
use crate::state::StateManager;
use crate::tasks::{TaskManager, build_cells};

/// How a result executes: one task per column, or one task per row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Column,
    Row,
}

/// Per-item status returned by `start_column_evaluation`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ColumnEvalStart {
    pub task_id: i64,
    pub result_id: i64,
    pub items: Vec<(i64, &'static str)>,
}

pub struct ResultLifecycle {
    state: StateManager,
    tasks: TaskManager,
    prompts: Arc<dyn PromptSource>,
    scheduler: UnifiedScheduler,
}

impl ResultLifecycle {
    pub fn new(
        state: StateManager,
        tasks: TaskManager,
        prompts: Arc<dyn PromptSource>,
        scheduler: UnifiedScheduler,
    ) -> Self {
        Self {
            state,
            tasks,
            prompts,
            scheduler,
        }
    }

    /// Capture `prompt_id -> version` for every prompt-template column.
    /// Taken once at result creation and never touched again.
    async fn snapshot_prompt_versions(&self, columns: &[Column]) -> Map<String, Value> {
        let mut snapshot = Map::new();
        for column in columns {
            if column.kind != ColumnKind::PromptTemplate {
                continue;
            }
            let Some(prompt_id) = column.config.get("prompt_id").and_then(Value::as_i64) else {
                warn!(column_id = column.id, "prompt_template column without prompt_id, skipping snapshot");
                continue;
            };

            let entry = match self.prompts.latest_version(prompt_id).await {
                Some(version) => json!({
                    "prompt_id": prompt_id,
                    "prompt_name": version.name,
                    "version_id": version.version_id,
                    "version_number": version.version_number,
                    "column_id": column.id,
                    "column_name": column.name,
                }),
                None => {
                    warn!(prompt_id, column_id = column.id, "Prompt has no resolvable version");
                    json!({
                        "prompt_id": prompt_id,
                        "prompt_name": format!("prompt {prompt_id}"),
                        "version_id": Value::Null,
                        "version_number": 1,
                        "column_id": column.id,
                        "column_name": column.name,
                        "error": "prompt has no versions",
                    })
                }
            };
            snapshot.insert(prompt_id.to_string(), entry);
        }
        snapshot
    }

    async fn selected_items(&self, pipeline: &Pipeline, selection: Option<Vec<i64>>) -> EngineResult<Vec<DatasetItem>> {
        let items = self
            .state
            .list_dataset_items(pipeline.dataset_id, true, selection)
            .await?;
        if items.is_empty() {
            return Err(EngineError::validation("dataset is empty"));
        }
        Ok(items)
    }

    fn validate_columns(columns: &[Column]) -> EngineResult<()> {
        let evaluation_columns: Vec<&Column> = columns.iter().filter(|c| c.kind != ColumnKind::DatasetVariable).collect();
        if evaluation_columns.is_empty() {
            return Err(EngineError::validation("no evaluation columns"));
        }
        let last = evaluation_columns
            .iter()
            .max_by_key(|c| c.position)
            .expect("non-empty checked");
        if !last.kind.is_boolean() {
            return Err(EngineError::validation(
                "the last column must be a boolean-producing predicate",
            ));
        }
        Ok(())
    }

    /// Create a result and everything it needs to run.
    ///
    /// Staging results get their cell grid but no tasks: evaluation of the
    /// working copy is driven column by column from the editor.
    pub async fn create_result(
        &self,
        pipeline_id: i64,
        run_type: RunType,
        mode: ExecutionMode,
        selected_item_ids: Option<Vec<i64>>,
    ) -> EngineResult<EvalResult> {
        let pipeline = self.state.get_pipeline_required(pipeline_id).await?;

        if run_type == RunType::Staging && self.state.staging_result(pipeline_id).await?.is_some() {
            return Err(EngineError::Conflict(format!(
                "pipeline {pipeline_id} already has a staging result"
            )));
        }

        let items = self.selected_items(&pipeline, selected_item_ids.clone()).await?;
        let columns = self.state.list_columns(pipeline_id).await?;
        if run_type != RunType::Staging {
            Self::validate_columns(&columns)?;
        }

        let snapshot = self.snapshot_prompt_versions(&columns).await;
        let result = EvalResult::new(pipeline_id, run_type).with_prompt_versions(snapshot);
        let result_id = self.state.create_result(result).await?;
        let mut result = self.state.get_result_required(result_id).await?;
        info!(result_id, pipeline_id, %run_type, ?mode, "Result created");

        if run_type == RunType::Staging {
            let cells = build_cells(&result, &columns, &items);
            self.state.insert_cells(cells).await?;
            return Ok(result);
        }

        match mode {
            ExecutionMode::Column => {
                let cells = build_cells(&result, &columns, &items);
                self.state.insert_cells(cells).await?;

                for column in columns.iter().filter(|c| !c.kind.is_static()) {
                    self.tasks
                        .create_column_task(result_id, column, &items, pipeline.user_id, column.position, 3, Value::Null)
                        .await?;
                }
            }
            ExecutionMode::Row => {
                self.tasks.create_row_tasks(result_id, &items).await?;
                if !self.scheduler.force_schedule_row_task_batch(result_id, selected_item_ids) {
                    info!(result_id, "No slot for immediate batch, the scheduler loop will pick the rows up");
                }
            }
        }

        result = self.state.get_result_required(result_id).await?;
        Ok(result)
    }

    /// Ensure row tasks exist for the selection and kick a batch worker.
    pub async fn execute_row_batch(&self, result_id: i64, item_ids: Option<Vec<i64>>) -> EngineResult<bool> {
        let result = self.state.get_result_required(result_id).await?;
        let pipeline = self.state.get_pipeline_required(result.pipeline_id).await?;
        let items = self.selected_items(&pipeline, item_ids.clone()).await?;

        // Existing (result, item) pairs are skipped by the unique key.
        let tasks: Vec<RowTask> = items.iter().map(|item| RowTask::new(result_id, item.id)).collect();
        self.state.insert_row_tasks(tasks).await?;

        Ok(self.scheduler.force_schedule_row_task_batch(result_id, item_ids))
    }

    /// Start a column evaluation on the pipeline's staging result. The
    /// single-flight invariant is enforced by task creation: a second
    /// start for the same `(result, column)` returns `Conflict`.
    pub async fn start_column_evaluation(
        &self,
        pipeline_id: i64,
        column_id: i64,
        dataset_item_ids: Option<Vec<i64>>,
        user_config: Option<Value>,
    ) -> EngineResult<ColumnEvalStart> {
        let pipeline = self.state.get_pipeline_required(pipeline_id).await?;
        let column = self.state.get_column_required(column_id).await?;
        if column.pipeline_id != pipeline_id {
            return Err(EngineError::not_found(format!(
                "column {column_id} does not belong to pipeline {pipeline_id}"
            )));
        }
        if column.kind.is_static() {
            return Err(EngineError::validation(format!(
                "column {} is written at result creation and cannot be evaluated",
                column.name
            )));
        }

        let items = self.selected_items(&pipeline, dataset_item_ids).await?;

        let result = match self.state.staging_result(pipeline_id).await? {
            Some(result) => result,
            None => {
                self.create_result(pipeline_id, RunType::Staging, ExecutionMode::Column, None)
                    .await?
            }
        };

        // Reset finished cells so the items re-evaluate; create any that
        // are missing.
        for item in &items {
            match self.state.get_cell(result.id, item.id, column_id).await? {
                Some(cell) => {
                    if matches!(cell.status, CellStatus::Completed | CellStatus::Failed) {
                        self.state.reset_cell_new(cell.id).await?;
                    }
                }
                None => {
                    self.state
                        .insert_cells(vec![Cell::new(pipeline_id, result.id, item.id, column_id)])
                        .await?;
                }
            }
        }

        let task = self
            .tasks
            .create_column_task(
                result.id,
                &column,
                &items,
                pipeline.user_id,
                column.position,
                3,
                user_config.unwrap_or(Value::Null),
            )
            .await?;

        Ok(ColumnEvalStart {
            task_id: task.id,
            result_id: result.id,
            items: items.iter().map(|item| (item.id, "pending")).collect(),
        })
    }

    /// Swap the pipeline's dataset. The staging result's cells are all
    /// dropped and rebuilt; history results are never touched.
    pub async fn change_dataset(
        &self,
        pipeline_id: i64,
        dataset_id: i64,
        selected_item_ids: Option<Vec<i64>>,
    ) -> EngineResult<()> {
        let pipeline = self.state.get_pipeline_required(pipeline_id).await?;
        let old_dataset_id = pipeline.dataset_id;
        self.state.set_pipeline_dataset(pipeline_id, dataset_id).await?;

        let staging = match self.state.staging_result(pipeline_id).await? {
            Some(result) => result,
            None => {
                // No working copy yet: creating one builds the full grid
                // against the new dataset.
                self.create_result(pipeline_id, RunType::Staging, ExecutionMode::Column, selected_item_ids)
                    .await?;
                return Ok(());
            }
        };

        let deleted = self.state.delete_result_cells(staging.id).await?;
        info!(pipeline_id, dataset_id, deleted, "Rebuilding staging cells for dataset change");

        if old_dataset_id != dataset_id {
            // New dataset: the variable column describes the old one.
            self.state.delete_dataset_variable_columns(pipeline_id).await?;
            self.state
                .create_column(Column::new(pipeline_id, "dataset", ColumnKind::DatasetVariable, 0))
                .await?;
        } else if !self
            .state
            .list_columns(pipeline_id)
            .await?
            .iter()
            .any(|c| c.kind == ColumnKind::DatasetVariable)
        {
            self.state
                .create_column(Column::new(pipeline_id, "dataset", ColumnKind::DatasetVariable, 0))
                .await?;
        }

        let pipeline = self.state.get_pipeline_required(pipeline_id).await?;
        let items = self.selected_items(&pipeline, selected_item_ids).await?;
        let columns = self.state.list_columns(pipeline_id).await?;
        let cells = build_cells(&staging, &columns, &items);
        self.state.insert_cells(cells).await?;
        Ok(())
    }

    /// Append a column to the pipeline and create its staging cells.
    pub async fn append_column(
        &self,
        pipeline_id: i64,
        name: &str,
        kind: ColumnKind,
        config: Value,
        selected_item_ids: Option<Vec<i64>>,
    ) -> EngineResult<Column> {
        let pipeline = self.state.get_pipeline_required(pipeline_id).await?;

        // Parse eagerly so a malformed config is rejected before anything
        // is written.
        crate::domain::ColumnSpec::parse(kind, &config)?;

        let position = self.state.max_column_position(pipeline_id).await? + 1;
        let column_id = self
            .state
            .create_column(Column::new(pipeline_id, name, kind, position).with_config(config))
            .await?;
        let column = self.state.get_column_required(column_id).await?;
        info!(pipeline_id, column_id, %kind, position, "Column appended");

        if let Some(staging) = self.state.staging_result(pipeline_id).await? {
            let items = self.selected_items(&pipeline, selected_item_ids).await?;
            let cells = build_cells(&staging, std::slice::from_ref(&column), &items);
            self.state.insert_cells(cells).await?;
        }

        Ok(column)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigHandle, EngineConfig};
    use crate::executor::{ColumnTaskExecutor, EvalServices, RowTaskExecutor};
    use crate::llm::{LlmError, LlmRequest, LlmResponse, LlmTransport, RateLimiter, TokenUsage};
    use crate::prompt::{PromptInvoker, PromptVersionInfo, StoreFeatureModels};
    use async_trait::async_trait;
    use promptstore::TaskStatus;

    struct NoTransport;

    #[async_trait]
    impl LlmTransport for NoTransport {
        async fn invoke(&self, _request: LlmRequest) -> Result<LlmResponse, LlmError> {
            Ok(LlmResponse {
                text: "ok".to_string(),
                usage: TokenUsage::default(),
                cost: None,
                latency_ms: 1,
            })
        }
    }

    struct OnePrompt;

    #[async_trait]
    impl crate::prompt::PromptSource for OnePrompt {
        async fn latest_version(&self, prompt_id: i64) -> Option<PromptVersionInfo> {
            (prompt_id == 7).then(|| PromptVersionInfo {
                prompt_id,
                version_id: 71,
                version_number: 4,
                name: "answerer".to_string(),
                messages: vec![crate::llm::ChatMessage::user("{{question}}")],
                model_params: Map::new(),
            })
        }
    }

    struct Fixture {
        state: StateManager,
        lifecycle: ResultLifecycle,
        pipeline_id: i64,
    }

    async fn fixture() -> Fixture {
        let state = StateManager::spawn_in_memory().unwrap();
        let config = ConfigHandle::ephemeral(EngineConfig::default());
        let tasks = TaskManager::new(state.clone(), config.clone());
        let prompts: Arc<dyn PromptSource> = Arc::new(OnePrompt);
        let services = EvalServices {
            invoker: Arc::new(PromptInvoker::new(prompts.clone(), Arc::new(NoTransport), state.clone())),
            features: Arc::new(StoreFeatureModels::new(state.clone())),
            limiter: Arc::new(RateLimiter::new(100.0, 6000.0)),
        };
        let column_exec = Arc::new(ColumnTaskExecutor::new(
            state.clone(),
            tasks.clone(),
            services.clone(),
            config.clone(),
        ));
        let row_exec = Arc::new(RowTaskExecutor::new(state.clone(), tasks.clone(), services));
        let scheduler = UnifiedScheduler::new(state.clone(), config, tasks.clone(), column_exec, row_exec);
        let lifecycle = ResultLifecycle::new(state.clone(), tasks, prompts, scheduler);

        let pipeline_id = state.create_pipeline(Pipeline::new(1, 1, 1, "p")).await.unwrap();
        Fixture {
            state,
            lifecycle,
            pipeline_id,
        }
    }

    async fn seed_columns(f: &Fixture) {
        f.state
            .create_column(Column::new(f.pipeline_id, "vars", ColumnKind::DatasetVariable, 0))
            .await
            .unwrap();
        f.state
            .create_column(
                Column::new(f.pipeline_id, "answer", ColumnKind::PromptTemplate, 1)
                    .with_config(json!({"prompt_id": 7, "variable_mappings": {"question": "q"}})),
            )
            .await
            .unwrap();
        f.state
            .create_column(Column::new(f.pipeline_id, "verdict", ColumnKind::Exact, 2).with_config(
                json!({"reference_column": "answer", "expected_column": "a"}),
            ))
            .await
            .unwrap();
    }

    async fn seed_items(f: &Fixture, count: usize) -> Vec<i64> {
        let mut ids = Vec::new();
        for index in 0..count {
            let mut vars = Map::new();
            vars.insert("q".to_string(), json!(format!("q{index}")));
            vars.insert("a".to_string(), json!("ok"));
            ids.push(f.state.create_dataset_item(DatasetItem::new(1, vars)).await.unwrap());
        }
        ids
    }

    #[tokio::test]
    async fn test_column_mode_creates_cells_and_tasks() {
        let f = fixture().await;
        seed_columns(&f).await;
        seed_items(&f, 2).await;

        let result = f
            .lifecycle
            .create_result(f.pipeline_id, RunType::Release, ExecutionMode::Column, None)
            .await
            .unwrap();

        // Snapshot captured the prompt version.
        assert_eq!(result.prompt_versions["7"]["version_id"], json!(71));
        assert_eq!(result.prompt_versions["7"]["version_number"], json!(4));

        // 3 columns x 2 items cells; dataset_variable cells pre-completed.
        let columns = f.state.list_columns(f.pipeline_id).await.unwrap();
        let vars_cells = f
            .state
            .cells_for_column(result.id, columns[0].id, Some(CellStatus::Completed))
            .await
            .unwrap();
        assert_eq!(vars_cells.len(), 2);
        let new_cells = f
            .state
            .cells_for_column(result.id, columns[1].id, Some(CellStatus::New))
            .await
            .unwrap();
        assert_eq!(new_cells.len(), 2);

        // One task per non-static column, priority = position.
        let tasks = f.state.column_tasks_for_result(result.id).await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Pending));
        assert_eq!(tasks.iter().map(|t| t.total_items).sum::<i64>(), 4);
    }

    #[tokio::test]
    async fn test_row_mode_creates_row_tasks() {
        let f = fixture().await;
        seed_columns(&f).await;
        let items = seed_items(&f, 3).await;

        let result = f
            .lifecycle
            .create_result(
                f.pipeline_id,
                RunType::Release,
                ExecutionMode::Row,
                Some(items[..2].to_vec()),
            )
            .await
            .unwrap();

        let rows = f.state.row_tasks_for_result(result.id).await.unwrap();
        assert_eq!(rows.len(), 2, "only the selected items get row tasks");
    }

    #[tokio::test]
    async fn test_validation_failures() {
        let f = fixture().await;

        // Empty dataset.
        seed_columns(&f).await;
        let err = f
            .lifecycle
            .create_result(f.pipeline_id, RunType::Release, ExecutionMode::Row, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(ref m) if m.contains("dataset")));

        // Unknown pipeline.
        let err = f
            .lifecycle
            .create_result(999, RunType::Release, ExecutionMode::Row, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_no_evaluation_columns_rejected() {
        let f = fixture().await;
        f.state
            .create_column(Column::new(f.pipeline_id, "vars", ColumnKind::DatasetVariable, 0))
            .await
            .unwrap();
        seed_items(&f, 1).await;

        let err = f
            .lifecycle
            .create_result(f.pipeline_id, RunType::Release, ExecutionMode::Column, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(ref m) if m.contains("no evaluation columns")));
    }

    #[tokio::test]
    async fn test_non_boolean_last_column_rejected() {
        let f = fixture().await;
        f.state
            .create_column(Column::new(f.pipeline_id, "count", ColumnKind::Count, 1))
            .await
            .unwrap();
        seed_items(&f, 1).await;

        let err = f
            .lifecycle
            .create_result(f.pipeline_id, RunType::Release, ExecutionMode::Column, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(ref m) if m.contains("boolean")));
    }

    #[tokio::test]
    async fn test_duplicate_staging_result_rejected() {
        let f = fixture().await;
        seed_columns(&f).await;
        seed_items(&f, 1).await;

        f.lifecycle
            .create_result(f.pipeline_id, RunType::Staging, ExecutionMode::Column, None)
            .await
            .unwrap();
        let err = f
            .lifecycle
            .create_result(f.pipeline_id, RunType::Staging, ExecutionMode::Column, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_start_column_evaluation_single_flight() {
        let f = fixture().await;
        seed_columns(&f).await;
        seed_items(&f, 2).await;

        let columns = f.state.list_columns(f.pipeline_id).await.unwrap();
        let verdict_column = columns.iter().find(|c| c.name == "verdict").unwrap();

        let start = f
            .lifecycle
            .start_column_evaluation(f.pipeline_id, verdict_column.id, None, None)
            .await
            .unwrap();
        assert_eq!(start.items.len(), 2);
        assert!(start.items.iter().all(|(_, status)| *status == "pending"));

        // Second start within the same flight: 409-equivalent.
        let err = f
            .lifecycle
            .start_column_evaluation(f.pipeline_id, verdict_column.id, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));

        // Exactly one active task for the key.
        assert!(
            f.state
                .has_active_task_for_column(start.result_id, verdict_column.id)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_change_dataset_rebuilds_staging_cells() {
        let f = fixture().await;
        seed_columns(&f).await;
        seed_items(&f, 2).await;

        let staging = f
            .lifecycle
            .create_result(f.pipeline_id, RunType::Staging, ExecutionMode::Column, None)
            .await
            .unwrap();

        // Complete a cell, then swap to a new dataset.
        let columns = f.state.list_columns(f.pipeline_id).await.unwrap();
        let cells = f
            .state
            .cells_for_column(staging.id, columns[2].id, None)
            .await
            .unwrap();
        f.state
            .update_cell_completed(cells[0].id, json!({"value": true}), json!({"value": "passed"}))
            .await
            .unwrap();

        // Items for the new dataset.
        let mut vars = Map::new();
        vars.insert("q".to_string(), json!("fresh"));
        f.state.create_dataset_item({
            let mut item = DatasetItem::new(2, vars);
            item.enabled = true;
            item
        })
        .await
        .unwrap();

        f.lifecycle.change_dataset(f.pipeline_id, 2, None).await.unwrap();

        // The dataset-variable column was rebuilt and old cells are gone.
        let pipeline = f.state.get_pipeline_required(f.pipeline_id).await.unwrap();
        assert_eq!(pipeline.dataset_id, 2);
        let columns = f.state.list_columns(f.pipeline_id).await.unwrap();
        let verdict = columns.iter().find(|c| c.name == "verdict").unwrap();
        let rebuilt = f.state.cells_for_column(staging.id, verdict.id, None).await.unwrap();
        assert_eq!(rebuilt.len(), 1, "one cell per item of the new dataset");
        assert!(rebuilt.iter().all(|c| c.status == CellStatus::New));
    }

    #[tokio::test]
    async fn test_append_column_creates_staging_cells() {
        let f = fixture().await;
        seed_columns(&f).await;
        seed_items(&f, 2).await;
        f.lifecycle
            .create_result(f.pipeline_id, RunType::Staging, ExecutionMode::Column, None)
            .await
            .unwrap();

        let column = f
            .lifecycle
            .append_column(
                f.pipeline_id,
                "extra",
                ColumnKind::Contains,
                json!({"reference_column": "answer", "expected_column": "a"}),
                None,
            )
            .await
            .unwrap();
        assert_eq!(column.position, 3);

        let staging = f.state.staging_result(f.pipeline_id).await.unwrap().unwrap();
        let cells = f.state.cells_for_column(staging.id, column.id, None).await.unwrap();
        assert_eq!(cells.len(), 2);

        // Malformed configs never land.
        let err = f
            .lifecycle
            .append_column(f.pipeline_id, "bad", ColumnKind::JsonExtraction, json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }
}

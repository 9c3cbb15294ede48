//! End-to-end engine tests
//!
//! Drives the full engine (state actor, scheduler, executors) against an
//! in-memory store with mock LLM and prompt ports.

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use promptbench::config::EngineConfig;
use promptbench::engine::{Engine, EnginePorts};
use promptbench::error::EngineError;
use promptbench::lifecycle::ExecutionMode;
use promptbench::llm::{ChatMessage, LlmError, LlmRequest, LlmResponse, LlmTransport, TokenUsage};
use promptbench::prompt::{PromptSource, PromptVersionInfo};
use promptstore::{
    Column, ColumnKind, DatasetItem, Pipeline, ResultStatus, RowTaskStatus, RowVerdict, RunType, TaskStatus,
};

/// Transport that answers prompts with a canned string and assertion
/// rubrics with a passing judgement, recording when each call landed.
struct ScriptedTransport {
    answer: String,
    calls: Mutex<Vec<Instant>>,
}

impl ScriptedTransport {
    fn new(answer: &str) -> Arc<Self> {
        Arc::new(Self {
            answer: answer.to_string(),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmTransport for ScriptedTransport {
    async fn invoke(&self, request: LlmRequest) -> Result<LlmResponse, LlmError> {
        self.calls.lock().unwrap().push(Instant::now());
        let prompt = &request.messages.last().unwrap().content;
        let text = if prompt.contains("Assertion:") {
            r#"{"passed": true, "explanation": "looks fine"}"#.to_string()
        } else {
            self.answer.clone()
        };
        Ok(LlmResponse {
            text,
            usage: TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            },
            cost: None,
            latency_ms: 2,
        })
    }
}

struct SinglePrompt;

#[async_trait]
impl PromptSource for SinglePrompt {
    async fn latest_version(&self, prompt_id: i64) -> Option<PromptVersionInfo> {
        (prompt_id == 7).then(|| PromptVersionInfo {
            prompt_id,
            version_id: 71,
            version_number: 2,
            name: "answerer".to_string(),
            messages: vec![ChatMessage::user("Answer: {{question}}")],
            model_params: Map::new(),
        })
    }
}

async fn engine_with(transport: Arc<ScriptedTransport>, config: EngineConfig) -> Engine {
    Engine::start_in_memory(
        config,
        EnginePorts {
            transport,
            prompts: Arc::new(SinglePrompt),
        },
    )
    .await
    .unwrap()
}

async fn seed_pipeline(engine: &Engine) -> i64 {
    engine
        .state()
        .create_pipeline(Pipeline::new(1, 1, 1, "integration"))
        .await
        .unwrap()
}

async fn seed_item(engine: &Engine, entries: &[(&str, Value)]) -> i64 {
    let vars: Map<String, Value> = entries.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
    engine
        .state()
        .create_dataset_item(DatasetItem::new(1, vars))
        .await
        .unwrap()
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..2000 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition never became true");
}

async fn wait_for_result_completed(engine: &Engine, result_id: i64) {
    let state = engine.state().clone();
    wait_until(move || {
        let state = state.clone();
        async move {
            state
                .get_result(result_id)
                .await
                .ok()
                .flatten()
                .map(|r| r.status == ResultStatus::Completed)
                .unwrap_or(false)
        }
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn s1_exact_match_row_passes() {
    let engine = engine_with(ScriptedTransport::new("unused"), EngineConfig::default()).await;
    let pipeline_id = seed_pipeline(&engine).await;

    engine
        .state()
        .create_column(Column::new(pipeline_id, "verdict", ColumnKind::Exact, 1).with_config(
            json!({"reference_column": "Q", "expected_column": "A"}),
        ))
        .await
        .unwrap();
    let item_id = seed_item(&engine, &[("Q", json!("hi")), ("A", json!("hi"))]).await;

    let result = engine
        .create_result(pipeline_id, RunType::Release, ExecutionMode::Row, None)
        .await
        .unwrap();
    wait_for_result_completed(&engine, result.id).await;

    let rows = engine.state().row_tasks_for_result(result.id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].row_result, Some(RowVerdict::Passed));

    let columns = engine.state().list_columns(pipeline_id).await.unwrap();
    let cell = engine
        .state()
        .get_cell(result.id, item_id, columns[0].id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cell.value, Some(json!({"value": true})));

    let progress = engine.result_progress(result.id).await.unwrap();
    assert_eq!(progress.mode, "row");
    assert_eq!(progress.passed, 1);

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn s2_exact_multi_failure_reports_failed_pairs() {
    let engine = engine_with(ScriptedTransport::new("unused"), EngineConfig::default()).await;
    let pipeline_id = seed_pipeline(&engine).await;

    engine
        .state()
        .create_column(Column::new(pipeline_id, "pairs", ColumnKind::ExactMulti, 1).with_config(json!({
            "match_pairs": [
                {"input_column": "Q", "expected_column": "A"},
                {"input_column": "X", "expected_column": "Y"}
            ],
            "options": ["ignore_case"]
        })))
        .await
        .unwrap();
    let item_id = seed_item(
        &engine,
        &[
            ("Q", json!("hi")),
            ("A", json!("HI")),
            ("X", json!("1")),
            ("Y", json!("2")),
        ],
    )
    .await;

    let result = engine
        .create_result(pipeline_id, RunType::Release, ExecutionMode::Row, None)
        .await
        .unwrap();
    wait_for_result_completed(&engine, result.id).await;

    let rows = engine.state().row_tasks_for_result(result.id).await.unwrap();
    assert_eq!(rows[0].row_result, Some(RowVerdict::Unpassed));

    let result_row = engine.state().get_result(result.id).await.unwrap().unwrap();
    assert_eq!(result_row.unpassed, 1);
    assert_eq!(result_row.total, result_row.passed + result_row.unpassed + result_row.failed);

    // The cell's details name the failing X/Y pair.
    let columns = engine.state().list_columns(pipeline_id).await.unwrap();
    let cell = engine
        .state()
        .get_cell(result.id, item_id, columns[0].id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cell.value, Some(json!({"value": false})));

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn s3_llm_rows_are_serialised_by_the_limiter() {
    let transport = ScriptedTransport::new("a polite answer");
    let config = EngineConfig {
        llm_rate_qps: 1.0,
        ..Default::default()
    };
    let engine = engine_with(transport.clone(), config).await;
    let pipeline_id = seed_pipeline(&engine).await;

    engine
        .state()
        .create_column(
            Column::new(pipeline_id, "out", ColumnKind::PromptTemplate, 1)
                .with_config(json!({"prompt_id": 7, "variable_mappings": {"question": "q"}})),
        )
        .await
        .unwrap();
    engine
        .state()
        .create_column(Column::new(pipeline_id, "judge", ColumnKind::LlmAssertion, 2).with_config(
            json!({"assertion": "answer is polite", "reference_column": "out"}),
        ))
        .await
        .unwrap();
    // The verdict column closes the pipeline.
    engine
        .state()
        .create_column(Column::new(pipeline_id, "verdict", ColumnKind::Contains, 3).with_config(
            json!({"reference_column": "out", "expected_column": "want"}),
        ))
        .await
        .unwrap();

    seed_item(&engine, &[("q", json!("one")), ("want", json!("polite"))]).await;
    seed_item(&engine, &[("q", json!("two")), ("want", json!("polite"))]).await;

    let result = engine
        .create_result(pipeline_id, RunType::Release, ExecutionMode::Row, None)
        .await
        .unwrap();
    assert!(result.has_llm_calls(), "snapshot must mark the run LLM-bearing");
    wait_for_result_completed(&engine, result.id).await;

    let rows = engine.state().row_tasks_for_result(result.id).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.row_result == Some(RowVerdict::Passed)));

    // Two rows x (prompt + assertion) = four invocations, every
    // consecutive pair at least a second apart.
    let times = transport.call_times();
    assert_eq!(times.len(), 4);
    for window in times.windows(2) {
        assert!(
            window[1] - window[0] >= Duration::from_millis(999),
            "LLM invocations were not paced: {:?}",
            window[1] - window[0],
        );
    }

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn s4_stuck_running_task_is_timed_out() {
    let engine = engine_with(ScriptedTransport::new("unused"), EngineConfig::default()).await;
    engine.pause_scheduler();
    let pipeline_id = seed_pipeline(&engine).await;

    let column_id = engine
        .state()
        .create_column(Column::new(pipeline_id, "verdict", ColumnKind::Exact, 1))
        .await
        .unwrap();
    let result_id = engine
        .state()
        .create_result(promptstore::EvalResult::new(pipeline_id, RunType::Release))
        .await
        .unwrap();

    // A task stuck in running with no log activity.
    let task_id = engine
        .state()
        .create_column_task(promptstore::ColumnTask::new(pipeline_id, result_id, column_id, 1), vec![])
        .await
        .unwrap();
    engine.state().start_column_task(task_id).await.unwrap();

    engine.config().set_key("task_timeout_minutes", json!(0)).unwrap();
    engine.scheduler().tick().await;

    let task = engine.state().get_column_task_required(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error_message.unwrap().contains("timed out"));

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn s4b_recently_logged_task_survives_the_sweep() {
    let engine = engine_with(ScriptedTransport::new("unused"), EngineConfig::default()).await;
    engine.pause_scheduler();
    let pipeline_id = seed_pipeline(&engine).await;

    let column_id = engine
        .state()
        .create_column(Column::new(pipeline_id, "verdict", ColumnKind::Exact, 1))
        .await
        .unwrap();
    let result_id = engine
        .state()
        .create_result(promptstore::EvalResult::new(pipeline_id, RunType::Release))
        .await
        .unwrap();
    let task_id = engine
        .state()
        .create_column_task(promptstore::ColumnTask::new(pipeline_id, result_id, column_id, 1), vec![])
        .await
        .unwrap();
    engine.state().start_column_task(task_id).await.unwrap();
    engine
        .state()
        .append_task_log(promptstore::TaskLog::new(
            task_id,
            promptstore::LogLevel::Info,
            "item 3 in progress",
        ))
        .await
        .unwrap();

    engine.config().set_key("task_timeout_minutes", json!(0)).unwrap();
    engine.scheduler().tick().await;

    let task = engine.state().get_column_task_required(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Running, "log activity proves liveness");

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn s5_single_flight_rejects_second_column_start() {
    let engine = engine_with(ScriptedTransport::new("unused"), EngineConfig::default()).await;
    engine.pause_scheduler();
    let pipeline_id = seed_pipeline(&engine).await;

    engine
        .state()
        .create_column(Column::new(pipeline_id, "vars", ColumnKind::DatasetVariable, 0))
        .await
        .unwrap();
    let column_id = engine
        .state()
        .create_column(Column::new(pipeline_id, "verdict", ColumnKind::Exact, 1).with_config(
            json!({"reference_column": "Q", "expected_column": "A"}),
        ))
        .await
        .unwrap();
    seed_item(&engine, &[("Q", json!("hi")), ("A", json!("hi"))]).await;

    let started = engine
        .start_column_evaluation(pipeline_id, column_id, None, None)
        .await
        .unwrap();
    assert_eq!(started.items.len(), 1);

    let err = engine
        .start_column_evaluation(pipeline_id, column_id, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)), "second start must 409");

    // Exactly one task holds the (result, column) key.
    let tasks = engine.state().column_tasks_for_result(started.result_id).await.unwrap();
    let active = tasks
        .iter()
        .filter(|t| t.column_id == column_id && t.status.is_active())
        .count();
    assert_eq!(active, 1);

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn s6_json_path_extraction_feeds_the_verdict() {
    let engine = engine_with(ScriptedTransport::new("unused"), EngineConfig::default()).await;
    let pipeline_id = seed_pipeline(&engine).await;

    engine
        .state()
        .create_column(
            Column::new(pipeline_id, "extracted", ColumnKind::JsonExtraction, 1)
                .with_config(json!({"reference_column": "payload", "json_path": "items[0].name"})),
        )
        .await
        .unwrap();
    engine
        .state()
        .create_column(Column::new(pipeline_id, "verdict", ColumnKind::Exact, 2).with_config(
            json!({"reference_column": "extracted", "expected_column": "want"}),
        ))
        .await
        .unwrap();

    let item_id = seed_item(
        &engine,
        &[
            ("payload", json!(r#"{"items":[{"name":"ok"}]}"#)),
            ("want", json!("ok")),
        ],
    )
    .await;

    let result = engine
        .create_result(pipeline_id, RunType::Release, ExecutionMode::Row, None)
        .await
        .unwrap();
    wait_for_result_completed(&engine, result.id).await;

    let rows = engine.state().row_tasks_for_result(result.id).await.unwrap();
    assert_eq!(rows[0].row_result, Some(RowVerdict::Passed));

    let columns = engine.state().list_columns(pipeline_id).await.unwrap();
    let cell = engine
        .state()
        .get_cell(result.id, item_id, columns[0].id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cell.value, Some(json!({"value": "ok"})));

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn column_mode_runs_to_completed_result() {
    let engine = engine_with(ScriptedTransport::new("the answer is ok"), EngineConfig::default()).await;
    let pipeline_id = seed_pipeline(&engine).await;

    engine
        .state()
        .create_column(Column::new(pipeline_id, "vars", ColumnKind::DatasetVariable, 0))
        .await
        .unwrap();
    engine
        .state()
        .create_column(
            Column::new(pipeline_id, "answer", ColumnKind::PromptTemplate, 1)
                .with_config(json!({"prompt_id": 7, "variable_mappings": {"question": "q"}})),
        )
        .await
        .unwrap();
    engine
        .state()
        .create_column(Column::new(pipeline_id, "verdict", ColumnKind::Contains, 2).with_config(
            json!({"reference_column": "answer", "expected_column": "a"}),
        ))
        .await
        .unwrap();

    seed_item(&engine, &[("q", json!("say ok")), ("a", json!("ok"))]).await;
    seed_item(&engine, &[("q", json!("say more")), ("a", json!("missing"))]).await;

    let result = engine
        .create_result(pipeline_id, RunType::Release, ExecutionMode::Column, None)
        .await
        .unwrap();

    // Two tasks (prompt column + verdict column), dispatched by the loop
    // in priority order; the verdict column consumes the prompt output
    // through the previous-cells union.
    wait_for_result_completed(&engine, result.id).await;

    let finished = engine.state().get_result(result.id).await.unwrap().unwrap();
    assert_eq!(finished.total, 2);
    assert_eq!(finished.passed, 1);
    assert_eq!(finished.failed, 1);
    assert_eq!(finished.total, finished.passed + finished.unpassed + finished.failed);

    let tasks = engine.state().column_tasks_for_result(result.id).await.unwrap();
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Completed));

    // Every LLM call left an audit row.
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn snapshot_is_immutable_across_reads() {
    let engine = engine_with(ScriptedTransport::new("x"), EngineConfig::default()).await;
    engine.pause_scheduler();
    let pipeline_id = seed_pipeline(&engine).await;

    engine
        .state()
        .create_column(
            Column::new(pipeline_id, "answer", ColumnKind::PromptTemplate, 1)
                .with_config(json!({"prompt_id": 7, "variable_mappings": {}})),
        )
        .await
        .unwrap();
    engine
        .state()
        .create_column(Column::new(pipeline_id, "verdict", ColumnKind::Exact, 2))
        .await
        .unwrap();
    seed_item(&engine, &[("q", json!("x"))]).await;

    let result = engine
        .create_result(pipeline_id, RunType::Release, ExecutionMode::Row, None)
        .await
        .unwrap();
    let snapshot = result.prompt_versions.clone();
    assert_eq!(snapshot["7"]["version_id"], json!(71));

    for _ in 0..3 {
        let reread = engine.state().get_result(result.id).await.unwrap().unwrap();
        assert_eq!(reread.prompt_versions, snapshot);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn force_scheduling_twice_is_a_noop_while_key_held() {
    let engine = engine_with(ScriptedTransport::new("unused"), EngineConfig::default()).await;
    let pipeline_id = seed_pipeline(&engine).await;

    engine
        .state()
        .create_column(Column::new(pipeline_id, "verdict", ColumnKind::Exact, 1).with_config(
            json!({"reference_column": "Q", "expected_column": "A"}),
        ))
        .await
        .unwrap();
    for index in 0..5 {
        seed_item(&engine, &[("Q", json!(format!("{index}"))), ("A", json!("0"))]).await;
    }

    let result = engine
        .create_result(pipeline_id, RunType::Release, ExecutionMode::Row, None)
        .await
        .unwrap();

    // The creation already force-scheduled a batch; a second forced batch
    // while its key is held must be refused.
    let rescheduled = engine.execute_row_batch(result.id, None).await.unwrap();
    let still_held = engine.scheduler_status().active_row_batches > 0;
    assert!(!rescheduled || !still_held);

    wait_for_result_completed(&engine, result.id).await;
    let rows = engine.state().row_tasks_for_result(result.id).await.unwrap();
    assert_eq!(rows.len(), 5);
    assert!(rows.iter().all(|r| r.status == RowTaskStatus::Completed));

    engine.shutdown().await;
}

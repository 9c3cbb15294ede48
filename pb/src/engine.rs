//! The process-wide engine handle
//!
//! Built once at startup from a store path, a config handle and the two
//! consumed ports, passed explicitly to whoever needs it, and shut down on
//! termination. There are no module-level singletons.

use eyre::Result;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use promptstore::{EvalResult, RunType};

use crate::config::{ConfigHandle, EngineConfig};
use crate::error::EngineResult;
use crate::executor::{ColumnTaskExecutor, EvalServices, RowTaskExecutor};
use crate::lifecycle::{ColumnEvalStart, ExecutionMode, ResultLifecycle};
use crate::llm::{LlmTransport, RateLimiter};
use crate::prompt::{PromptInvoker, PromptSource, StoreFeatureModels};
use crate::scheduler::{SchedulerStatus, UnifiedScheduler};
use crate::state::StateManager;
use crate::tasks::{ResultProgress, TaskManager, TaskProgress};

/// The capabilities the engine consumes but does not own.
pub struct EnginePorts {
    pub transport: Arc<dyn LlmTransport>,
    pub prompts: Arc<dyn PromptSource>,
}

pub struct Engine {
    state: StateManager,
    config: ConfigHandle,
    tasks: TaskManager,
    scheduler: UnifiedScheduler,
    lifecycle: ResultLifecycle,
}

impl Engine {
    /// Open the store, wire every component, run orphan recovery and start
    /// the scheduler loop.
    pub async fn start(store_path: impl AsRef<Path>, config: ConfigHandle, ports: EnginePorts) -> Result<Self> {
        let state = StateManager::spawn(store_path)?;
        Self::start_with_state(state, config, ports).await
    }

    /// In-memory engine for tests.
    pub async fn start_in_memory(config: EngineConfig, ports: EnginePorts) -> Result<Self> {
        let state = StateManager::spawn_in_memory()?;
        Self::start_with_state(state, ConfigHandle::ephemeral(config), ports).await
    }

    async fn start_with_state(state: StateManager, config: ConfigHandle, ports: EnginePorts) -> Result<Self> {
        let settings = config.get();
        let limiter = Arc::new(RateLimiter::new(settings.llm_rate_qps, settings.llm_rate_qpm));
        let invoker = Arc::new(PromptInvoker::new(
            ports.prompts.clone(),
            ports.transport,
            state.clone(),
        ));
        let services = EvalServices {
            invoker,
            features: Arc::new(StoreFeatureModels::new(state.clone())),
            limiter,
        };

        let tasks = TaskManager::new(state.clone(), config.clone());
        let column_exec = Arc::new(ColumnTaskExecutor::new(
            state.clone(),
            tasks.clone(),
            services.clone(),
            config.clone(),
        ));
        let row_exec = Arc::new(RowTaskExecutor::new(state.clone(), tasks.clone(), services));
        let scheduler = UnifiedScheduler::new(state.clone(), config.clone(), tasks.clone(), column_exec, row_exec);
        scheduler.start().await;

        let lifecycle = ResultLifecycle::new(state.clone(), tasks.clone(), ports.prompts, scheduler.clone());

        info!("Engine started");
        Ok(Self {
            state,
            config,
            tasks,
            scheduler,
            lifecycle,
        })
    }

    /// Stop the scheduler loop and the state actor. Running workers drain
    /// on their own; persistent state is authoritative for whatever they
    /// leave behind.
    pub async fn shutdown(&self) {
        info!("Engine shutting down");
        self.scheduler.stop();
        let _ = self.state.shutdown().await;
    }

    // === provided engine API ===

    pub async fn create_result(
        &self,
        pipeline_id: i64,
        run_type: RunType,
        mode: ExecutionMode,
        selected_item_ids: Option<Vec<i64>>,
    ) -> EngineResult<EvalResult> {
        self.lifecycle
            .create_result(pipeline_id, run_type, mode, selected_item_ids)
            .await
    }

    pub async fn execute_row_batch(&self, result_id: i64, item_ids: Option<Vec<i64>>) -> EngineResult<bool> {
        self.lifecycle.execute_row_batch(result_id, item_ids).await
    }

    pub async fn start_column_evaluation(
        &self,
        pipeline_id: i64,
        column_id: i64,
        dataset_item_ids: Option<Vec<i64>>,
        user_config: Option<Value>,
    ) -> EngineResult<ColumnEvalStart> {
        self.lifecycle
            .start_column_evaluation(pipeline_id, column_id, dataset_item_ids, user_config)
            .await
    }

    pub async fn task_progress(&self, task_id: i64) -> EngineResult<TaskProgress> {
        self.tasks.task_progress(task_id).await
    }

    pub async fn result_progress(&self, result_id: i64) -> EngineResult<ResultProgress> {
        self.tasks.result_progress(result_id).await
    }

    pub async fn cancel_task(&self, task_id: i64) -> EngineResult<bool> {
        self.tasks.cancel_task(task_id).await
    }

    pub async fn retry_task(&self, task_id: i64) -> EngineResult<bool> {
        self.tasks.retry_task(task_id).await
    }

    pub fn pause_scheduler(&self) {
        self.scheduler.pause();
    }

    pub fn resume_scheduler(&self) {
        self.scheduler.resume();
    }

    pub fn scheduler_status(&self) -> SchedulerStatus {
        self.scheduler.status()
    }

    // === component access for the CLI and tests ===

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn tasks(&self) -> &TaskManager {
        &self.tasks
    }

    pub fn scheduler(&self) -> &UnifiedScheduler {
        &self.scheduler
    }
}

//! Unified scheduler
//!
//! One periodic loop dispatches pending and retrying tasks of both kinds
//! under a global concurrency cap. An in-memory key set guarantees at most
//! one worker per task (`column_task:<id>` / `row_task:<id>`) and one batch
//! worker per result (`row_batch:<result>`). Workers never crash the loop:
//! errors are logged and the key is always released.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use promptstore::{TaskStatus, now_ms};

use crate::config::ConfigHandle;
use crate::executor::{ColumnTaskExecutor, RowTaskExecutor};
use crate::state::{StateManager, recover_orphans};
use crate::tasks::TaskManager;

/// How recent a task's log activity must be before the timeout sweep
/// believes it is really stuck.
const STUCK_QUIET_WINDOW_MS: i64 = 5 * 60 * 1000;

/// How often the maintenance sweeps (task cleanup, log purge) run.
const MAINTENANCE_INTERVAL_MS: i64 = 60 * 60 * 1000;

/// Row tasks outrank column tasks in the unified pending queue.
const ROW_TASK_PRIORITY: i64 = 100;

/// Scheduler state snapshot.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub paused: bool,
    pub active_tasks: usize,
    pub active_column_tasks: usize,
    pub active_row_tasks: usize,
    pub active_row_batches: usize,
    pub active_task_keys: Vec<String>,
    pub max_concurrent_tasks: usize,
}

/// Releases an active key when the worker ends, however it ends.
struct KeyGuard {
    active: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.active.lock().expect("active set poisoned").remove(&self.key);
        debug!(key = %self.key, "Released active key");
    }
}

enum PendingTask {
    Column { id: i64, priority: i64, result_id: i64 },
    Row { id: i64, result_id: i64 },
}

impl PendingTask {
    fn key(&self) -> String {
        match self {
            PendingTask::Column { id, .. } => format!("column_task:{id}"),
            PendingTask::Row { id, .. } => format!("row_task:{id}"),
        }
    }

    fn priority(&self) -> i64 {
        match self {
            PendingTask::Column { priority, .. } => *priority,
            PendingTask::Row { .. } => ROW_TASK_PRIORITY,
        }
    }

    fn result_id(&self) -> i64 {
        match self {
            PendingTask::Column { result_id, .. } => *result_id,
            PendingTask::Row { result_id, .. } => *result_id,
        }
    }
}

struct SchedulerInner {
    state: StateManager,
    config: ConfigHandle,
    tasks: TaskManager,
    column_exec: Arc<ColumnTaskExecutor>,
    row_exec: Arc<RowTaskExecutor>,
    active: Arc<Mutex<HashSet<String>>>,
    running: AtomicBool,
    paused: AtomicBool,
    last_maintenance: AtomicI64,
}

/// The unified scheduler handle.
#[derive(Clone)]
pub struct UnifiedScheduler {
    inner: Arc<SchedulerInner>,
}

impl UnifiedScheduler {
    pub fn new(
        state: StateManager,
        config: ConfigHandle,
        tasks: TaskManager,
        column_exec: Arc<ColumnTaskExecutor>,
        row_exec: Arc<RowTaskExecutor>,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                state,
                config,
                tasks,
                column_exec,
                row_exec,
                active: Arc::new(Mutex::new(HashSet::new())),
                running: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                last_maintenance: AtomicI64::new(now_ms()),
            }),
        }
    }

    /// Recover orphans, then start the tick loop.
    pub async fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            warn!("Scheduler is already running");
            return;
        }
        info!("Starting unified scheduler");

        let timeout_minutes = self.inner.config.get().task_timeout_minutes;
        match recover_orphans(&self.inner.state, timeout_minutes, STUCK_QUIET_WINDOW_MS).await {
            Ok(stats) => {
                if stats.column_tasks_reset > 0 || stats.row_tasks_reset > 0 {
                    info!("Startup orphan recovery: {stats}");
                }
            }
            Err(e) => error!(error = %e, "Startup orphan recovery failed"),
        }

        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.run_loop().await;
        });
    }

    /// Stop the loop; running workers finish on their own.
    pub fn stop(&self) {
        if self.inner.running.swap(false, Ordering::SeqCst) {
            info!("Stopping unified scheduler");
        }
    }

    /// Pause dispatching without stopping running workers.
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
        info!("Scheduler paused");
    }

    pub fn resume(&self) {
        if self.inner.paused.swap(false, Ordering::SeqCst) {
            info!("Scheduler resumed");
        }
    }

    pub fn status(&self) -> SchedulerStatus {
        let keys: Vec<String> = {
            let active = self.inner.active.lock().expect("active set poisoned");
            active.iter().cloned().collect()
        };
        SchedulerStatus {
            running: self.inner.running.load(Ordering::SeqCst),
            paused: self.inner.paused.load(Ordering::SeqCst),
            active_tasks: keys.len(),
            active_column_tasks: keys.iter().filter(|k| k.starts_with("column_task:")).count(),
            active_row_tasks: keys.iter().filter(|k| k.starts_with("row_task:")).count(),
            active_row_batches: keys.iter().filter(|k| k.starts_with("row_batch:")).count(),
            active_task_keys: keys,
            max_concurrent_tasks: self.inner.config.get().max_concurrent_tasks,
        }
    }

    async fn run_loop(&self) {
        debug!("Scheduler loop started");
        while self.inner.running.load(Ordering::SeqCst) {
            if !self.inner.paused.load(Ordering::SeqCst) {
                self.tick().await;
            }
            let interval = self.inner.config.get().scheduler_interval_seconds;
            tokio::time::sleep(Duration::from_secs(interval.max(1))).await;
        }
        debug!("Scheduler loop stopped");
    }

    /// One scheduling round. Public so tests can drive the scheduler
    /// deterministically without waiting for wall-clock ticks.
    pub async fn tick(&self) {
        self.dispatch_pending().await;
        self.dispatch_retries().await;
        self.sweep_timeouts().await;
        self.run_maintenance_if_due().await;
    }

    /// Claim a key if it is free and a slot is available.
    fn try_claim(&self, key: &str, max: usize) -> bool {
        let mut active = self.inner.active.lock().expect("active set poisoned");
        if active.len() >= max || active.contains(key) {
            return false;
        }
        active.insert(key.to_string());
        true
    }

    fn guard(&self, key: String) -> KeyGuard {
        KeyGuard {
            active: self.inner.active.clone(),
            key,
        }
    }

    async fn dispatch_pending(&self) {
        let max = self.inner.config.get().max_concurrent_tasks;
        let active_count = self.inner.active.lock().expect("active set poisoned").len();
        if active_count >= max {
            debug!(active_count, max, "At concurrency cap, skipping dispatch");
            return;
        }
        let slots = max - active_count;
        let per_kind = slots.div_ceil(2);

        let column_tasks = match self.inner.state.pending_column_tasks(per_kind).await {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(error = %e, "Failed to query pending column tasks");
                return;
            }
        };
        let row_tasks = match self.inner.state.pending_row_tasks(per_kind).await {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(error = %e, "Failed to query pending row tasks");
                return;
            }
        };

        let mut unified: Vec<PendingTask> = Vec::new();
        unified.extend(column_tasks.into_iter().map(|t| PendingTask::Column {
            id: t.id,
            priority: t.priority,
            result_id: t.result_id,
        }));
        unified.extend(row_tasks.into_iter().map(|t| PendingTask::Row {
            id: t.id,
            result_id: t.result_id,
        }));
        if unified.is_empty() {
            return;
        }

        unified.sort_by_key(|task| (std::cmp::Reverse(task.priority()), task.result_id()));
        info!(candidates = unified.len(), slots, "Dispatching pending tasks");

        for task in unified.into_iter().take(slots) {
            let key = task.key();
            if !self.try_claim(&key, max) {
                continue;
            }
            debug!(%key, "Dispatching task");
            self.spawn_worker(task, key);
        }
    }

    fn spawn_worker(&self, task: PendingTask, key: String) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let _guard = scheduler.guard(key.clone());
            match task {
                PendingTask::Column { id, .. } => {
                    if let Err(e) = scheduler.inner.column_exec.execute_task(id).await {
                        error!(task_id = id, error = %e, "Column task worker failed");
                    }
                }
                PendingTask::Row { id, .. } => {
                    if let Err(e) = scheduler.inner.row_exec.execute_row_task(id).await {
                        error!(row_task_id = id, error = %e, "Row task worker failed");
                    }
                }
            }
        });
    }

    async fn dispatch_retries(&self) {
        let due = match self.inner.state.retryable_column_tasks(now_ms()).await {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(error = %e, "Failed to query retryable tasks");
                return;
            }
        };
        if due.is_empty() {
            return;
        }
        info!(count = due.len(), "Dispatching retry tasks");

        let max = self.inner.config.get().max_concurrent_tasks;
        for task in due {
            let key = format!("column_task:{}", task.id);
            if !self.try_claim(&key, max) {
                continue;
            }

            // Put the failed items back before the worker starts.
            match self.inner.state.reset_failed_task_items(task.id).await {
                Ok(reset) => debug!(task_id = task.id, reset, "Reset failed items for retry"),
                Err(e) => {
                    error!(task_id = task.id, error = %e, "Failed to reset items for retry");
                    self.inner.active.lock().expect("active set poisoned").remove(&key);
                    continue;
                }
            }

            let scheduler = self.clone();
            tokio::spawn(async move {
                let _guard = scheduler.guard(key);
                if let Err(e) = scheduler.inner.column_exec.execute_task(task.id).await {
                    error!(task_id = task.id, error = %e, "Retry worker failed");
                }
            });
        }
    }

    /// Fail running tasks that exceeded the timeout budget with no recent
    /// sign of life.
    async fn sweep_timeouts(&self) {
        let timeout_minutes = self.inner.config.get().task_timeout_minutes;
        let now = now_ms();
        let cutoff = now - timeout_minutes * 60_000;
        let quiet_since = now - STUCK_QUIET_WINDOW_MS;
        let message = format!("task execution timed out (exceeded {timeout_minutes} minutes)");

        if let Ok(stale) = self.inner.state.running_column_tasks_started_before(cutoff).await {
            for task in stale {
                match self.inner.state.has_recent_task_log(task.id, quiet_since).await {
                    Ok(true) => continue,
                    Ok(false) => {}
                    Err(e) => {
                        error!(task_id = task.id, error = %e, "Timeout log probe failed");
                        continue;
                    }
                }
                warn!(task_id = task.id, "Column task timed out, marking failed");
                if let Err(e) = self
                    .inner
                    .state
                    .set_column_task_status(task.id, TaskStatus::Failed, Some(message.clone()), true)
                    .await
                {
                    error!(task_id = task.id, error = %e, "Failed to fail timed-out task");
                    continue;
                }
                self.inner
                    .active
                    .lock()
                    .expect("active set poisoned")
                    .remove(&format!("column_task:{}", task.id));
            }
        }

        if let Ok(stale) = self.inner.state.running_row_tasks_started_before(cutoff).await {
            for task in stale {
                match self.inner.state.row_task_quiet_since(task.id, quiet_since).await {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => {
                        error!(row_task_id = task.id, error = %e, "Timeout quiescence probe failed");
                        continue;
                    }
                }
                warn!(row_task_id = task.id, "Row task timed out, marking failed");
                if let Err(e) = self.inner.state.fail_row_task(task.id, message.clone(), 0).await {
                    error!(row_task_id = task.id, error = %e, "Failed to fail timed-out row task");
                    continue;
                }
                if let Err(e) = self.inner.tasks.update_row_result_stats(task.result_id).await {
                    error!(result_id = task.result_id, error = %e, "Failed to refresh result stats");
                }
                self.inner
                    .active
                    .lock()
                    .expect("active set poisoned")
                    .remove(&format!("row_task:{}", task.id));
            }
        }
    }

    async fn run_maintenance_if_due(&self) {
        let now = now_ms();
        let last = self.inner.last_maintenance.load(Ordering::SeqCst);
        if now - last < MAINTENANCE_INTERVAL_MS {
            return;
        }
        if self
            .inner
            .last_maintenance
            .compare_exchange(last, now, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        debug!("Running maintenance sweeps");
        if let Err(e) = self.inner.tasks.cleanup_completed_tasks(None).await {
            warn!(error = %e, "Task cleanup sweep failed");
        }
        if let Err(e) = self.inner.tasks.purge_old_logs().await {
            warn!(error = %e, "Log purge sweep failed");
        }
    }

    /// Bypass the single-flight pending query for one result: spawn a
    /// dedicated batch worker under `row_batch:<result>`, provided a slot
    /// is free. Returns whether the batch was scheduled.
    pub fn force_schedule_row_task_batch(&self, result_id: i64, item_ids: Option<Vec<i64>>) -> bool {
        let max = self.inner.config.get().max_concurrent_tasks;
        let key = format!("row_batch:{result_id}");
        if !self.try_claim(&key, max) {
            warn!(result_id, "Cannot force-schedule row batch: key held or no free slot");
            return false;
        }

        info!(result_id, "Force-scheduling row task batch");
        let scheduler = self.clone();
        tokio::spawn(async move {
            let _guard = scheduler.guard(key);
            match scheduler.inner.row_exec.execute_batch(result_id, item_ids).await {
                Ok(stats) => info!(
                    result_id,
                    total = stats.total,
                    succeeded = stats.succeeded,
                    "Row batch finished"
                ),
                Err(e) => error!(result_id, error = %e, "Row batch failed"),
            }
        });
        true
    }
}

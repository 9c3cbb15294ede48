//! Orphan recovery
//!
//! Runs once at scheduler start: tasks left in `running` by a crashed
//! process are reset to `pending` so the next tick re-dispatches them.
//! A task is only reset when it is *really* stuck - nothing logged (or
//! touched, for row tasks) inside the quiet window.

use tracing::{debug, info, warn};

use promptstore::now_ms;

use super::StateManager;

/// Recovery statistics
#[derive(Debug, Default)]
pub struct RecoveryStats {
    /// Column tasks reset to pending
    pub column_tasks_reset: usize,
    /// Row tasks reset to pending
    pub row_tasks_reset: usize,
}

impl std::fmt::Display for RecoveryStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "column tasks: {}, row tasks: {}",
            self.column_tasks_reset, self.row_tasks_reset
        )
    }
}

/// Reset genuinely stuck running tasks. Idempotent: a second run finds
/// nothing left in `running` and does no work.
pub async fn recover_orphans(
    state: &StateManager,
    timeout_minutes: i64,
    quiet_window_ms: i64,
) -> eyre::Result<RecoveryStats> {
    debug!(timeout_minutes, quiet_window_ms, "recover_orphans: called");
    let now = now_ms();
    let cutoff = now - timeout_minutes * 60_000;
    let quiet_since = now - quiet_window_ms;
    let mut stats = RecoveryStats::default();

    let stale_tasks = state
        .running_column_tasks_started_before(cutoff)
        .await
        .map_err(|e| eyre::eyre!("Failed to list stale column tasks: {e}"))?;
    for task in stale_tasks {
        match state.has_recent_task_log(task.id, quiet_since).await {
            Ok(true) => {
                debug!(task_id = task.id, "recover_orphans: column task has recent logs, leaving it");
            }
            Ok(false) => {
                warn!(task_id = task.id, "Resetting orphaned column task to pending");
                state
                    .reset_column_task_pending(task.id)
                    .await
                    .map_err(|e| eyre::eyre!("Failed to reset column task {}: {e}", task.id))?;
                stats.column_tasks_reset += 1;
            }
            Err(e) => warn!(task_id = task.id, error = %e, "recover_orphans: log probe failed"),
        }
    }

    let stale_rows = state
        .running_row_tasks_started_before(cutoff)
        .await
        .map_err(|e| eyre::eyre!("Failed to list stale row tasks: {e}"))?;
    for task in stale_rows {
        match state.row_task_quiet_since(task.id, quiet_since).await {
            Ok(true) => {
                warn!(row_task_id = task.id, "Resetting orphaned row task to pending");
                state
                    .reset_row_task_pending(task.id)
                    .await
                    .map_err(|e| eyre::eyre!("Failed to reset row task {}: {e}", task.id))?;
                stats.row_tasks_reset += 1;
            }
            Ok(false) => {
                debug!(row_task_id = task.id, "recover_orphans: row task recently touched, leaving it");
            }
            Err(e) => warn!(row_task_id = task.id, error = %e, "recover_orphans: quiescence probe failed"),
        }
    }

    if stats.column_tasks_reset > 0 || stats.row_tasks_reset > 0 {
        info!("Orphan recovery reset incomplete work: {stats}");
    } else {
        debug!("recover_orphans: nothing to recover");
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use promptstore::{Column, ColumnKind, ColumnTask, EvalResult, Pipeline, RowTask, RowTaskStatus, RunType,
                      TaskStatus};

    async fn seed(state: &StateManager) -> (i64, i64, i64) {
        let pid = state.create_pipeline(Pipeline::new(1, 1, 1, "p")).await.unwrap();
        let rid = state.create_result(EvalResult::new(pid, RunType::Release)).await.unwrap();
        let cid = state
            .create_column(Column::new(pid, "v", ColumnKind::Exact, 1))
            .await
            .unwrap();
        (pid, rid, cid)
    }

    #[tokio::test]
    async fn test_recovery_empty_store() {
        let state = StateManager::spawn_in_memory().unwrap();
        let stats = recover_orphans(&state, 30, 300_000).await.unwrap();
        assert_eq!(stats.column_tasks_reset, 0);
        assert_eq!(stats.row_tasks_reset, 0);
        state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_recovery_resets_stuck_column_task() {
        let state = StateManager::spawn_in_memory().unwrap();
        let (pid, rid, cid) = seed(&state).await;

        let task_id = state
            .create_column_task(ColumnTask::new(pid, rid, cid, 1), vec![])
            .await
            .unwrap();
        state.start_column_task(task_id).await.unwrap();

        // A zero-minute timeout makes the just-started task stale; no logs
        // were written, so it is really stuck.
        let stats = recover_orphans(&state, 0, 0).await.unwrap();
        assert_eq!(stats.column_tasks_reset, 1);

        let task = state.get_column_task_required(task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.started_at.is_none());

        // Idempotent: a second pass has nothing to do.
        let stats = recover_orphans(&state, 0, 0).await.unwrap();
        assert_eq!(stats.column_tasks_reset, 0);

        state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_recovery_spares_recently_logged_task() {
        let state = StateManager::spawn_in_memory().unwrap();
        let (pid, rid, cid) = seed(&state).await;

        let task_id = state
            .create_column_task(ColumnTask::new(pid, rid, cid, 1), vec![])
            .await
            .unwrap();
        state.start_column_task(task_id).await.unwrap();
        state
            .append_task_log(promptstore::TaskLog::new(
                task_id,
                promptstore::LogLevel::Info,
                "still alive",
            ))
            .await
            .unwrap();

        // Stale by start time, but the quiet window sees the fresh log.
        let stats = recover_orphans(&state, 0, 300_000).await.unwrap();
        assert_eq!(stats.column_tasks_reset, 0);

        let task = state.get_column_task_required(task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Running);

        state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_recovery_resets_stuck_row_task() {
        let state = StateManager::spawn_in_memory().unwrap();
        let (_pid, rid, _cid) = seed(&state).await;

        state.insert_row_tasks(vec![RowTask::new(rid, 1)]).await.unwrap();
        let task = state.pending_row_tasks_for_result(rid, None).await.unwrap().remove(0);
        state.mark_row_tasks_running(vec![task.id]).await.unwrap();

        // Quiet window of -1s puts the cutoff in the future, so the task
        // counts as untouched.
        let stats = recover_orphans(&state, 0, -1_000).await.unwrap();
        assert_eq!(stats.row_tasks_reset, 1);

        let reset = state.get_row_task_required(task.id).await.unwrap();
        assert_eq!(reset.status, RowTaskStatus::Pending);

        state.shutdown().await.unwrap();
    }
}

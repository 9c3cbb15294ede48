//! Database schema
//!
//! All timestamps are unix milliseconds. JSON-typed fields are stored as
//! TEXT holding canonical JSON; parsing back into typed values happens at
//! the store boundary.

use eyre::{Context, Result};
use rusqlite::Connection;
use tracing::debug;

/// Schema DDL, applied idempotently on open.
const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS pipelines (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL,
    dataset_id INTEGER NOT NULL,
    user_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    description TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS columns (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pipeline_id INTEGER NOT NULL REFERENCES pipelines(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    kind TEXT NOT NULL,
    position INTEGER NOT NULL,
    config TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE (pipeline_id, position)
);

CREATE TABLE IF NOT EXISTS dataset_items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    dataset_id INTEGER NOT NULL,
    variables TEXT NOT NULL,
    expected_output TEXT,
    enabled INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_dataset_items_dataset ON dataset_items(dataset_id);

CREATE TABLE IF NOT EXISTS results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pipeline_id INTEGER NOT NULL REFERENCES pipelines(id) ON DELETE CASCADE,
    run_type TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'new',
    total INTEGER NOT NULL DEFAULT 0,
    passed INTEGER NOT NULL DEFAULT 0,
    unpassed INTEGER NOT NULL DEFAULT 0,
    failed INTEGER NOT NULL DEFAULT 0,
    success_rate REAL NOT NULL DEFAULT 0.0,
    prompt_versions TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_results_pipeline ON results(pipeline_id, run_type);

CREATE TABLE IF NOT EXISTS cells (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pipeline_id INTEGER NOT NULL REFERENCES pipelines(id) ON DELETE CASCADE,
    result_id INTEGER NOT NULL REFERENCES results(id) ON DELETE CASCADE,
    dataset_item_id INTEGER NOT NULL REFERENCES dataset_items(id) ON DELETE CASCADE,
    column_id INTEGER NOT NULL REFERENCES columns(id) ON DELETE CASCADE,
    status TEXT NOT NULL DEFAULT 'new',
    value TEXT,
    display_value TEXT,
    error_message TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE (result_id, dataset_item_id, column_id)
);
CREATE INDEX IF NOT EXISTS idx_cells_result_column ON cells(result_id, column_id);
CREATE INDEX IF NOT EXISTS idx_cells_result_item ON cells(result_id, dataset_item_id);

CREATE TABLE IF NOT EXISTS column_tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pipeline_id INTEGER NOT NULL REFERENCES pipelines(id) ON DELETE CASCADE,
    result_id INTEGER NOT NULL REFERENCES results(id) ON DELETE CASCADE,
    column_id INTEGER NOT NULL REFERENCES columns(id) ON DELETE CASCADE,
    user_id INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'pending',
    priority INTEGER NOT NULL DEFAULT 0,
    retries_max INTEGER NOT NULL DEFAULT 3,
    retries_done INTEGER NOT NULL DEFAULT 0,
    total_items INTEGER NOT NULL DEFAULT 0,
    completed_items INTEGER NOT NULL DEFAULT 0,
    failed_items INTEGER NOT NULL DEFAULT 0,
    config TEXT,
    error_message TEXT,
    started_at INTEGER,
    completed_at INTEGER,
    next_retry_at INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_column_tasks_status_priority ON column_tasks(status, priority);
CREATE INDEX IF NOT EXISTS idx_column_tasks_next_retry ON column_tasks(next_retry_at);
CREATE INDEX IF NOT EXISTS idx_column_tasks_result_column ON column_tasks(result_id, column_id);

CREATE TABLE IF NOT EXISTS task_items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id INTEGER NOT NULL REFERENCES column_tasks(id) ON DELETE CASCADE,
    cell_id INTEGER NOT NULL REFERENCES cells(id) ON DELETE CASCADE,
    dataset_item_id INTEGER NOT NULL REFERENCES dataset_items(id) ON DELETE CASCADE,
    status TEXT NOT NULL DEFAULT 'pending',
    retry_count INTEGER NOT NULL DEFAULT 0,
    input_data TEXT,
    output_data TEXT,
    error_message TEXT,
    execution_time_ms INTEGER,
    started_at INTEGER,
    completed_at INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE (task_id, cell_id)
);
CREATE INDEX IF NOT EXISTS idx_task_items_task_status ON task_items(task_id, status);

CREATE TABLE IF NOT EXISTS row_tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    result_id INTEGER NOT NULL REFERENCES results(id) ON DELETE CASCADE,
    dataset_item_id INTEGER NOT NULL REFERENCES dataset_items(id) ON DELETE CASCADE,
    status TEXT NOT NULL DEFAULT 'pending',
    row_result TEXT,
    current_column_position INTEGER,
    execution_variables TEXT,
    error_message TEXT,
    execution_time_ms INTEGER,
    started_at INTEGER,
    completed_at INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE (result_id, dataset_item_id)
);
CREATE INDEX IF NOT EXISTS idx_row_tasks_result_status ON row_tasks(result_id, status);
CREATE INDEX IF NOT EXISTS idx_row_tasks_status ON row_tasks(status);

CREATE TABLE IF NOT EXISTS task_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id INTEGER NOT NULL REFERENCES column_tasks(id) ON DELETE CASCADE,
    task_item_id INTEGER,
    level TEXT NOT NULL DEFAULT 'INFO',
    message TEXT NOT NULL,
    details TEXT,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_task_logs_task_created ON task_logs(task_id, created_at);

CREATE TABLE IF NOT EXISTS requests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL DEFAULT 0,
    user_id INTEGER NOT NULL DEFAULT 0,
    prompt_id INTEGER,
    prompt_version_id INTEGER,
    source TEXT NOT NULL,
    input TEXT,
    variables_values TEXT,
    output TEXT,
    prompt_tokens INTEGER NOT NULL DEFAULT 0,
    completion_tokens INTEGER NOT NULL DEFAULT 0,
    total_tokens INTEGER NOT NULL DEFAULT 0,
    execution_time_ms INTEGER NOT NULL DEFAULT 0,
    cost TEXT,
    success INTEGER NOT NULL DEFAULT 1,
    error_message TEXT,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_requests_source ON requests(source, created_at);

CREATE TABLE IF NOT EXISTS feature_models (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL,
    feature_key TEXT NOT NULL,
    provider TEXT NOT NULL,
    model_id TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE (project_id, feature_key)
);
"#;

/// Apply pragmas and create all tables if they do not exist yet.
pub fn migrate(conn: &Connection) -> Result<()> {
    debug!("migrate: applying schema");
    conn.pragma_update(None, "journal_mode", "WAL")
        .context("Failed to enable WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")
        .context("Failed to enable foreign keys")?;
    conn.execute_batch(DDL).context("Failed to apply schema DDL")?;
    Ok(())
}

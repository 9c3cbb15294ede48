//! Promptstore inspection CLI
//!
//! Small read-mostly companion to the engine: table counts, recent LLM
//! requests, maintenance purges.

use clap::{Parser, Subcommand};
use eyre::Result;
use std::path::PathBuf;

use promptstore::{Store, now_ms};

#[derive(Parser)]
#[command(name = "ps", about = "Inspect a promptbench store", version)]
struct Cli {
    /// Path to the store database
    #[arg(long, short)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show row counts for every table
    Info,
    /// Show recent LLM request audit rows
    Requests {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Delete finished tasks and logs older than the given number of days
    Purge {
        #[arg(long, default_value_t = 7)]
        days: i64,
    },
}

fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("promptbench")
        .join("promptbench.db")
}

fn main() -> Result<()> {
    tracing_subscriber_init();
    let cli = Cli::parse();
    let path = cli.db.unwrap_or_else(default_db_path);
    let mut store = Store::open(&path)?;

    match cli.command {
        Command::Info => {
            for table in [
                "pipelines",
                "columns",
                "dataset_items",
                "results",
                "cells",
                "column_tasks",
                "task_items",
                "row_tasks",
                "task_logs",
                "requests",
            ] {
                println!("{table:>14}: {}", store.table_count(table)?);
            }
        }
        Command::Requests { limit } => {
            for record in store.recent_requests(limit)? {
                println!(
                    "#{} [{}] success={} tokens={} time={}ms {}",
                    record.id,
                    record.source,
                    record.success,
                    record.total_tokens,
                    record.execution_time_ms,
                    record.error_message.unwrap_or_default(),
                );
            }
        }
        Command::Purge { days } => {
            let cutoff = now_ms() - days * 24 * 60 * 60 * 1000;
            let tasks = store.delete_finished_tasks_before(cutoff)?;
            let logs = store.delete_logs_before(cutoff)?;
            println!("purged {tasks} finished tasks and {logs} log rows");
        }
    }

    Ok(())
}

fn tracing_subscriber_init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

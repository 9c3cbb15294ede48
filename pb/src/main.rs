//! Promptbench - prompt evaluation engine
//!
//! CLI entry point: runs the engine daemon, inspects state, manages the
//! configuration document.

use clap::Parser;
use eyre::{Context, Result};
use std::sync::Arc;
use tracing::info;

use promptbench::cli::{Cli, Command, ConfigAction};
use promptbench::config::{ConfigHandle, default_config_path, default_store_path};
use promptbench::engine::{Engine, EnginePorts};
use promptbench::llm::OpenAiTransport;
use promptbench::prompt::FilePromptSource;

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();

    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let store_path = cli.db.clone().unwrap_or_else(default_store_path);
    let config = ConfigHandle::load(&config_path).context("Failed to load configuration")?;

    match cli.command {
        Command::Daemon { prompts } => {
            let transport = OpenAiTransport::from_env().context("Failed to build LLM transport")?;
            let prompt_source = match prompts {
                Some(path) => FilePromptSource::load(&path).context("Failed to load prompt definitions")?,
                None => FilePromptSource::empty(),
            };

            let engine = Engine::start(
                &store_path,
                config,
                EnginePorts {
                    transport: Arc::new(transport),
                    prompts: Arc::new(prompt_source),
                },
            )
            .await
            .context("Failed to start engine")?;

            info!(store = %store_path.display(), "Engine running, press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
            engine.shutdown().await;
        }

        Command::Status => {
            let store = promptstore::Store::open(&store_path)?;
            println!("store: {}", store_path.display());
            for table in ["pipelines", "results", "cells", "column_tasks", "row_tasks", "requests"] {
                println!("{table:>13}: {}", store.table_count(table)?);
            }
        }

        Command::Config { action } => match action {
            ConfigAction::Show => {
                println!("{}", serde_json::to_string_pretty(&config.get())?);
            }
            ConfigAction::Set { key, value } => {
                let parsed = serde_json::from_str(&value).unwrap_or(serde_json::Value::String(value));
                config.set_key(&key, parsed)?;
                println!("{key} updated");
            }
        },

        Command::Purge => {
            let settings = config.get();
            let mut store = promptstore::Store::open(&store_path)?;
            let now = promptstore::now_ms();
            let task_cutoff = now - settings.cleanup_completed_tasks_days * 24 * 60 * 60 * 1000;
            let log_cutoff = now - settings.log_retention_days * 24 * 60 * 60 * 1000;
            let tasks = store.delete_finished_tasks_before(task_cutoff)?;
            let logs = store.delete_logs_before(log_cutoff)?;
            println!("purged {tasks} finished tasks and {logs} log rows");
        }
    }

    Ok(())
}

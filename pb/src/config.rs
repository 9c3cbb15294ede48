//! Engine configuration
//!
//! A small JSON document on disk. Missing keys fall back to defaults, the
//! file is created on first run, and mutations are written back so external
//! tooling can read the effective values. A shared handle supports runtime
//! reload without restarting the scheduler.

use eyre::{Context, Result, eyre};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// Engine configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Global worker cap across column-task, row-task and row-batch workers
    pub max_concurrent_tasks: usize,

    /// Item fan-out within one column task
    pub max_concurrent_items_per_task: usize,

    /// Running tasks older than this without log activity are failed
    pub task_timeout_minutes: i64,

    /// Backoff seconds per retry attempt, clamped to the last entry
    pub retry_delays: Vec<i64>,

    /// Maintenance horizon for completed/cancelled tasks
    pub cleanup_completed_tasks_days: i64,

    /// Scheduler tick period
    pub scheduler_interval_seconds: u64,

    /// Log purge horizon
    pub log_retention_days: i64,

    /// LLM admission: queries per second
    pub llm_rate_qps: f64,

    /// LLM admission: queries per minute
    pub llm_rate_qpm: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 5,
            max_concurrent_items_per_task: 10,
            task_timeout_minutes: 30,
            retry_delays: vec![0, 30, 120, 300],
            cleanup_completed_tasks_days: 7,
            scheduler_interval_seconds: 5,
            log_retention_days: 30,
            llm_rate_qps: 1.0,
            llm_rate_qpm: 60.0,
        }
    }
}

impl EngineConfig {
    /// Backoff delay for the given attempt, clamped to the last entry.
    pub fn retry_delay_secs(&self, attempt: usize) -> i64 {
        if self.retry_delays.is_empty() {
            return 0;
        }
        let index = attempt.min(self.retry_delays.len() - 1);
        self.retry_delays[index]
    }
}

/// Shared, reloadable handle to the configuration document.
#[derive(Clone)]
pub struct ConfigHandle {
    path: PathBuf,
    inner: Arc<RwLock<EngineConfig>>,
}

impl ConfigHandle {
    /// Load from the given path, creating the file with defaults when
    /// missing. A malformed file logs a warning and falls back to defaults
    /// rather than refusing to start.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let config = match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<EngineConfig>(&content) {
                Ok(config) => {
                    info!(path = %path.display(), "Loaded engine config");
                    config
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Malformed config, using defaults");
                    EngineConfig::default()
                }
            },
            Err(_) => {
                let config = EngineConfig::default();
                write_config(&path, &config)?;
                info!(path = %path.display(), "Created default engine config");
                config
            }
        };

        Ok(Self {
            path,
            inner: Arc::new(RwLock::new(config)),
        })
    }

    /// In-memory handle for tests; mutations are not persisted.
    pub fn ephemeral(config: EngineConfig) -> Self {
        Self {
            path: PathBuf::new(),
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// Snapshot of the current configuration.
    pub fn get(&self) -> EngineConfig {
        self.inner.read().expect("config lock poisoned").clone()
    }

    /// Replace the configuration and persist it.
    pub fn replace(&self, config: EngineConfig) -> Result<()> {
        if !self.path.as_os_str().is_empty() {
            write_config(&self.path, &config)?;
        }
        *self.inner.write().expect("config lock poisoned") = config;
        Ok(())
    }

    /// Set one key by name from a JSON value, validate the merged document,
    /// persist, and swap it in.
    pub fn set_key(&self, key: &str, value: serde_json::Value) -> Result<()> {
        let current = self.get();
        let mut doc = serde_json::to_value(&current).context("Failed to serialise config")?;
        let obj = doc.as_object_mut().expect("config serialises to an object");
        if !obj.contains_key(key) {
            return Err(eyre!("unknown config key: {key}"));
        }
        obj.insert(key.to_string(), value);

        let merged: EngineConfig =
            serde_json::from_value(doc).with_context(|| format!("invalid value for config key {key}"))?;
        self.replace(merged)?;
        info!(key, "Updated engine config");
        Ok(())
    }

    /// Re-read the file, keeping current values if it is missing or broken.
    pub fn reload(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Ok(());
        }
        let content = fs::read_to_string(&self.path).context("Failed to read config file")?;
        let config: EngineConfig = serde_json::from_str(&content).context("Failed to parse config file")?;
        *self.inner.write().expect("config lock poisoned") = config;
        info!(path = %self.path.display(), "Reloaded engine config");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_config(path: &Path, config: &EngineConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create config directory")?;
    }
    let content = serde_json::to_string_pretty(config).context("Failed to serialise config")?;
    fs::write(path, content).context("Failed to write config file")?;
    Ok(())
}

/// Default config file location.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("promptbench")
        .join("promptbench.json")
}

/// Default store database location.
pub fn default_store_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("promptbench")
        .join("promptbench.db")
}

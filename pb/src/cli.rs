//! Command-line interface

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "pb", about = "Prompt evaluation engine", version)]
pub struct Cli {
    /// Path to the config file (default: platform config dir)
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Path to the store database (default: platform data dir)
    #[arg(long)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the evaluation engine in the foreground
    Daemon {
        /// JSON file with prompt definitions for the prompt source
        #[arg(long)]
        prompts: Option<PathBuf>,
    },

    /// Show store counts and recent results
    Status,

    /// Show or change the engine configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Delete finished tasks and old logs past the configured horizons
    Purge,
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Set one key (value is parsed as JSON, falling back to a string)
    Set { key: String, value: String },
}

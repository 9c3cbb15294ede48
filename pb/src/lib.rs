//! Promptbench - prompt evaluation execution engine
//!
//! Evaluates prompt templates against datasets by running multi-stage
//! pipelines: an ordered sequence of typed columns (dataset variables, LLM
//! template invocations, human inputs, deterministic predicates, helper
//! transforms) applied to each dataset item. Execution produces a matrix
//! of cells and per-row pass/unpass/fail verdicts.
//!
//! # Architecture
//!
//! - **State in SQLite**: every task, cell and verdict is persisted; on
//!   restart the scheduler recovers orphaned work from the store.
//! - **Two execution modes**: column tasks fan one column out over N
//!   dataset items; row tasks walk all columns of one item in position
//!   order, threading variables from column to column.
//! - **One scheduler**: a periodic loop dispatches both task kinds under a
//!   global cap with single-flight keys, retries transient failures and
//!   times out stuck work.
//! - **Ports, not globals**: LLM transport, prompt resolution and feature
//!   model routing are traits handed to the engine at startup.
//!
//! # Modules
//!
//! - [`engine`] - the process-wide handle wiring everything together
//! - [`predicate`] - the evaluation strategy library
//! - [`executor`] - column-task and row-task executors
//! - [`scheduler`] - the unified dispatch loop
//! - [`lifecycle`] - result creation and staging rebuilds
//! - [`tasks`] - task transitions, progress, aggregation
//! - [`state`] - the actor owning the persistent store
//! - [`llm`] - transport port, OpenAI-compatible client, rate limiter
//! - [`prompt`] - prompt rendering and invocation

pub mod cli;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod executor;
pub mod lifecycle;
pub mod llm;
pub mod predicate;
pub mod prompt;
pub mod scheduler;
pub mod state;
pub mod tasks;

// Re-export commonly used types
pub use config::{ConfigHandle, EngineConfig};
pub use domain::ColumnSpec;
pub use engine::{Engine, EnginePorts};
pub use error::{EngineError, EngineResult};
pub use executor::{ColumnTaskExecutor, EvalServices, RowTaskExecutor};
pub use lifecycle::{ColumnEvalStart, ExecutionMode, ResultLifecycle};
pub use llm::{ChatMessage, LlmError, LlmRequest, LlmResponse, LlmTransport, OpenAiTransport, RateLimiter, TokenUsage};
pub use predicate::Verdict;
pub use prompt::{FeatureModels, FilePromptSource, PromptInvoker, PromptSource, PromptVersionInfo};
pub use scheduler::{SchedulerStatus, UnifiedScheduler};
pub use state::{RecoveryStats, StateError, StateManager, recover_orphans};
pub use tasks::{ResultProgress, TaskManager, TaskProgress};

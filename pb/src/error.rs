//! Engine error taxonomy
//!
//! Retryability is an explicit property of the error value; executors
//! branch on it instead of catching exception types.

use thiserror::Error;

use crate::llm::LlmError;
use crate::state::StateError;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Input shape problems: unknown column type, missing required config,
    /// last column not boolean. Nothing is created when these fire.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A single-flight key is already held (409-equivalent).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Transient failure; the task machinery may retry.
    #[error("retryable error: {0}")]
    Retryable(String),

    /// Terminal failure for the affected item/row/task.
    #[error("non-retryable error: {0}")]
    NonRetryable(String),

    /// Scheduler-induced: a running task exceeded its budget without any
    /// recent log activity.
    #[error("timeout: {0}")]
    Timeout(String),

    #[error("state error: {0}")]
    State(StateError),

    /// Anything else; treated as retryable with conservative bias.
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Retryable(_) | EngineError::Runtime(_) | EngineError::State(_)
        )
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        EngineError::NotFound(msg.into())
    }
}

impl From<StateError> for EngineError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::NotFound(message) => EngineError::NotFound(message),
            StateError::Conflict(message) => EngineError::Conflict(message),
            other => EngineError::State(other),
        }
    }
}

impl From<LlmError> for EngineError {
    fn from(err: LlmError) -> Self {
        if err.is_retryable() {
            EngineError::Retryable(err.to_string())
        } else {
            EngineError::NonRetryable(err.to_string())
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

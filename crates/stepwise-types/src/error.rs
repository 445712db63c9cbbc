use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced by the compiler and the step-resolution interpreter.
///
/// A closed set, always returned as a value and never raised for control
/// flow. Serialized with a `code` tag so it can cross the outer boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum DomainError {
    #[error("workflow '{workflow_id}' not found")]
    WorkflowNotFound { workflow_id: String },

    #[error("invalid state: {message}")]
    InvalidState { message: String },

    #[error("invalid loop '{loop_id}': {message}")]
    InvalidLoop { loop_id: String, message: String },

    #[error("malformed condition at {location}: {message}")]
    ConditionEvalFailed { location: String, message: String },

    #[error("loop '{loop_id}' exceeded max_iterations ({max_iterations})")]
    MaxIterationsExceeded { loop_id: String, max_iterations: u32 },

    #[error("missing context: {message}")]
    MissingContext { message: String },
}

impl DomainError {
    pub fn invalid_state(message: impl Into<String>) -> Self {
        DomainError::InvalidState {
            message: message.into(),
        }
    }

    pub fn invalid_loop(loop_id: impl Into<String>, message: impl Into<String>) -> Self {
        DomainError::InvalidLoop {
            loop_id: loop_id.into(),
            message: message.into(),
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            DomainError::WorkflowNotFound { .. } => "WORKFLOW_NOT_FOUND",
            DomainError::InvalidState { .. } => "INVALID_STATE",
            DomainError::InvalidLoop { .. } => "INVALID_LOOP",
            DomainError::ConditionEvalFailed { .. } => "CONDITION_EVAL_FAILED",
            DomainError::MaxIterationsExceeded { .. } => "MAX_ITERATIONS_EXCEEDED",
            DomainError::MissingContext { .. } => "MISSING_CONTEXT",
        }
    }
}

/// Errors from workflow readers and other read-only repositories.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("parse error in {source_name}: {message}")]
    Parse {
        source_name: String,
        message: String,
    },

    #[error("conflict: {0}")]
    Conflict(String),
}

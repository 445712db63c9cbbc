//! Engine error taxonomy.
//!
//! Every failure that can leave the engine maps to a stable code and a
//! human-readable message. Contract-violation blockers are not errors; they
//! are a `blocked` outcome.

use serde::Serialize;
use stepwise_types::error::{DomainError, RepositoryError};
use stepwise_types::ids::SessionId;
use stepwise_types::token::TokenError;
use thiserror::Error;

use crate::durable::lock::LockError;
use crate::durable::log::EventLogError;
use crate::durable::snapshot::SnapshotError;
use crate::workflow::context::ContextError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    EventLog(#[from] EventLogError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("workflow '{workflow_id}' changed since the run started")]
    WorkflowChanged { workflow_id: String },

    #[error("session {0} not found")]
    SessionNotFound(SessionId),
}

impl EngineError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Domain(e) => e.code(),
            EngineError::Token(e) => e.code(),
            EngineError::Lock(e) | EngineError::EventLog(EventLogError::Lock(e)) => match e {
                LockError::Timeout { .. } => "LOCK_TIMEOUT",
                LockError::Unhealthy { .. } | LockError::WrongSession { .. } => "LOCK_UNHEALTHY",
                LockError::Io(_) => "STORAGE_IO",
            },
            EngineError::EventLog(e) => match e {
                EventLogError::Lock(_) => "LOCK_UNHEALTHY",
                EventLogError::InvalidPlan(_) => "INTERNAL_ERROR",
                EventLogError::Storage(_) => "STORAGE_IO",
                EventLogError::Corrupt { .. } => "EVENT_LOG_CORRUPT",
                EventLogError::Serialization(_) => "EVENT_LOG_CORRUPT",
            },
            EngineError::Snapshot(e) => match e {
                SnapshotError::NotFound(_) => "SNAPSHOT_NOT_FOUND",
                SnapshotError::IntegrityMismatch { .. } => "SNAPSHOT_INTEGRITY",
                SnapshotError::UnsupportedVersion(_) => "SNAPSHOT_UNSUPPORTED_VERSION",
                SnapshotError::Serialization(_) => "SNAPSHOT_INTEGRITY",
                SnapshotError::Storage(_) => "STORAGE_IO",
            },
            EngineError::Repository(_) => "WORKFLOW_READ_FAILED",
            EngineError::Context(ContextError::TooLarge { .. }) => "CONTEXT_TOO_LARGE",
            EngineError::Context(ContextError::NotAnObject) => "INVALID_CONTEXT",
            EngineError::WorkflowChanged { .. } => "WORKFLOW_HASH_MISMATCH",
            EngineError::SessionNotFound(_) => "SESSION_NOT_FOUND",
        }
    }

    /// Whether retrying from a fresh rehydrate may succeed. Nothing partial
    /// was written in either case.
    pub fn is_retryable(&self) -> bool {
        matches!(self.code(), "LOCK_TIMEOUT" | "LOCK_UNHEALTHY" | "STORAGE_IO")
    }

    /// Boundary representation: code and message, no internals.
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code(),
            message: self.to_string(),
            retryable: self.is_retryable(),
        }
    }
}

/// Serializable error shape handed to outer layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    pub retryable: bool,
}

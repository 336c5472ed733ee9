//! Worker error model.

use thiserror::Error;

use crate::status::JobStatus;

/// Result type used across the worker.
pub type WorkerResult<T> = Result<T, WorkerError>;

/// Worker-level error.
///
/// `Configuration` is a startup-time failure; everything else is recoverable and
/// surfaced to whoever called into the worker.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// Duplicate or malformed job definition.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Unknown job name, job or instance.
    #[error("not found: {0}")]
    NotFound(String),

    /// Illegal state transition. Always carries the status the instance was in.
    #[error("{reason}, current status: {current}")]
    InvalidState { current: JobStatus, reason: String },

    /// The job's own business-logic failure.
    #[error("job handler failed: {0}")]
    Handler(String),

    /// The job handler panicked.
    #[error("job handler panicked: {0}")]
    Panic(String),

    /// Job arguments could not be encoded or decoded.
    #[error("invalid job arguments: {0}")]
    Argument(String),

    /// Durable store failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Execution backend failure (crontab, process control, lease table).
    #[error("queue backend error: {0}")]
    Backend(String),
}

impl WorkerError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid_state(current: JobStatus, reason: impl Into<String>) -> Self {
        Self::InvalidState {
            current,
            reason: reason.into(),
        }
    }

    pub fn argument(msg: impl Into<String>) -> Self {
        Self::Argument(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// Status carried by an `InvalidState` error.
    pub fn current_status(&self) -> Option<JobStatus> {
        match self {
            WorkerError::InvalidState { current, .. } => Some(*current),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for WorkerError {
    fn from(err: serde_json::Error) -> Self {
        WorkerError::Argument(err.to_string())
    }
}

//! Error types shared across the orchestration core.
//!
//! Every subsystem error maps onto one [`ErrorCategory`], which decides how a
//! failure is handled:
//! - Configuration errors are rejected at the call that introduced them
//! - Transient execution errors are retried through the dead-letter queue
//! - Permanent execution errors are parked in the dead-letter queue unretried
//! - Resource exhaustion is surfaced to the caller immediately

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse failure classification used for propagation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Invalid pool bounds, unknown routing strategy, duplicate registration.
    Configuration,
    /// Timeouts, unreachable delegates, crashed workers.
    Transient,
    /// The adapter reported the task itself as invalid.
    Permanent,
    /// No healthy pools, registry full, pool closed.
    ResourceExhaustion,
}

impl ErrorCategory {
    /// Returns whether a failure of this category belongs in the dead-letter queue.
    pub fn is_dead_letter(&self) -> bool {
        matches!(self, ErrorCategory::Transient | ErrorCategory::Permanent)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Configuration => write!(f, "configuration"),
            ErrorCategory::Transient => write!(f, "transient"),
            ErrorCategory::Permanent => write!(f, "permanent"),
            ErrorCategory::ResourceExhaustion => write!(f, "resource_exhaustion"),
        }
    }
}

/// Implemented by every error that can reach the dead-letter queue or a caller.
pub trait Categorize {
    /// Returns the handling category of this error.
    fn category(&self) -> ErrorCategory;
}

/// Errors reported by task adapters, delegates and cluster workers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdapterError {
    /// The task did not finish within its timeout.
    #[error("Task timed out after {0:?}")]
    Timeout(Duration),

    /// The remote delegate or scheduler could not be reached.
    #[error("Delegate unreachable: {0}")]
    Unreachable(String),

    /// The worker executing the task died.
    #[error("Worker crashed: {0}")]
    WorkerCrashed(String),

    /// The task is malformed and will never succeed.
    #[error("Invalid task: {0}")]
    InvalidTask(String),

    /// Any other execution failure.
    #[error("Execution failed: {0}")]
    Failed(String),
}

impl Categorize for AdapterError {
    fn category(&self) -> ErrorCategory {
        match self {
            AdapterError::InvalidTask(_) => ErrorCategory::Permanent,
            AdapterError::Timeout(_)
            | AdapterError::Unreachable(_)
            | AdapterError::WorkerCrashed(_)
            | AdapterError::Failed(_) => ErrorCategory::Transient,
        }
    }
}

impl From<reqwest::Error> for AdapterError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            AdapterError::Unreachable(err.to_string())
        } else if err.is_decode() {
            AdapterError::Failed(format!("Malformed response: {}", err))
        } else {
            AdapterError::Failed(err.to_string())
        }
    }
}

/// Errors that can occur while writing to or reading from a sink.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The sink refused or could not accept the operation.
    #[error("Sink unavailable: {0}")]
    Unavailable(String),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Categorize for SinkError {
    fn category(&self) -> ErrorCategory {
        match self {
            SinkError::Unavailable(_) | SinkError::Database(_) => ErrorCategory::Transient,
            SinkError::Serialization(_) => ErrorCategory::Permanent,
        }
    }
}

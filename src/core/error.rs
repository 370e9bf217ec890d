//! Error types for dispatcher, pool and registry operations.

use std::time::Duration;

use thiserror::Error;

use crate::core::WorkloadClass;

/// Invalid construction parameters for a component.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// An object pool was asked to pre-populate more objects than it may hold.
    #[error("initial size {initial} exceeds max size {max}")]
    InitialExceedsMax {
        /// Requested eager population.
        initial: usize,
        /// Configured bound.
        max: usize,
    },
    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// The OS refused to start a worker thread.
    #[error("failed to spawn worker thread: {0}")]
    WorkerSpawn(String),
}

/// Failures of the connection pool.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The pool could not be built or failed its first health check. Startup
    /// cannot proceed without a database.
    #[error("connection pool initialization failed: {0}")]
    Init(String),
    /// No connection could be leased. Recoverable; the caller decides whether to retry.
    #[error("failed to acquire connection after {waited:?}: {reason}")]
    Acquire {
        /// What went wrong.
        reason: String,
        /// How long the caller waited before giving up.
        waited: Duration,
    },
    /// `acquire` was called before any successful `connect`.
    #[error("connection pool is not configured")]
    NotConfigured,
    /// The driver failed to prepare a statement.
    #[error("failed to prepare statement: {0}")]
    Statement(String),
}

/// Terminal failure of a unit of work, observed through its handle.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The work returned an error. The original error is preserved.
    #[error("task failed: {0:#}")]
    Failed(anyhow::Error),
    /// The work panicked; the worker thread survived.
    #[error("task panicked: {0}")]
    Panicked(String),
    /// The work was cancelled before it started running.
    #[error("task cancelled")]
    Cancelled,
    /// The work did not finish within its time budget.
    #[error("task timed out after {0:?}")]
    TimedOut(Duration),
    /// The class queue was full and the pool rejects instead of running on the caller.
    #[error("{0} queue is full")]
    Rejected(WorkloadClass),
    /// The dispatcher is shut down and accepts no new work.
    #[error("dispatcher has been shut down")]
    Shutdown,
}

impl TaskError {
    /// Whether this error is a timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut(_))
    }

    /// Whether this error is a cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// The error returned by the work itself, if that is what failed.
    #[must_use]
    pub const fn source_error(&self) -> Option<&anyhow::Error> {
        match self {
            Self::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Failures while assembling the runtime from configuration.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The database could not be reached at startup.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Application-facing result used by caller-supplied work, handlers and hooks.
pub type AppResult<T> = Result<T, anyhow::Error>;

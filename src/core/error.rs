//! Error types for scheduler operations.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Failure raised by an Export, Transform or Load stage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    /// Ordinary failure; the period is eligible for automatic retry.
    #[error("stage failed: {0}")]
    Failed(String),
    /// Failure the stage declares non-retryable; counts toward the circuit breaker.
    #[error("fatal stage error: {0}")]
    Fatal(String),
}

impl StageError {
    /// Whether this error must not be retried automatically.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    /// Human readable message without the variant prefix.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Failed(msg) | Self::Fatal(msg) => msg,
        }
    }
}

/// Errors produced by ledger backends.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Storage backend failure with context.
    #[error("ledger backend error: {0}")]
    Backend(String),
    /// A stored row could not be decoded.
    #[error("corrupt ledger row: {0}")]
    Corrupt(String),
}

impl From<rusqlite::Error> for LedgerError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Errors produced by scheduler components.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The task's absolute deadline has passed.
    #[error("task expired at {expires_at}")]
    Expired {
        /// Deadline that was exceeded.
        expires_at: DateTime<Utc>,
    },
    /// A single step ran longer than the soft time limit.
    #[error("step took {elapsed:?}, soft time limit is {limit:?}")]
    SoftTimeLimitExceeded {
        /// Configured limit.
        limit: Duration,
        /// Duration of the offending step.
        elapsed: Duration,
    },
    /// A flow stage failed.
    #[error(transparent)]
    Stage(#[from] StageError),
    /// Ledger I/O failed.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    /// A pool name was used that was never registered.
    #[error("unknown pool: {0}")]
    UnknownPool(String),
    /// Schedule arithmetic could not produce a period.
    #[error("schedule error: {0}")]
    Schedule(String),
    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(String),
    /// A worker or scheduler thread could not be started.
    #[error("failed to spawn thread: {0}")]
    Spawn(String),
}

impl SchedulerError {
    /// Whether the error is a deadline violation (`Expired` or `SoftTimeLimitExceeded`).
    #[must_use]
    pub const fn is_deadline(&self) -> bool {
        matches!(self, Self::Expired { .. } | Self::SoftTimeLimitExceeded { .. })
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;

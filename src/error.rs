//! Error types for deferq operations.
//!
//! Defines error types for each subsystem:
//! - Backing store access (Redis or in-memory)
//! - Job records and status transitions
//! - Scheduler lease management
//! - The scheduler loop and submission façade
//! - Configuration loading

use std::time::Duration;

use thiserror::Error;

use crate::job::JobStatus;

/// Errors raised by the backing store.
///
/// Every store failure is treated as transient: the operation may or may not
/// have been applied, and callers must re-check state rather than assume
/// either outcome.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Unexpected store reply for '{operation}': {reason}")]
    Protocol { operation: String, reason: String },
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

impl StoreError {
    /// Store errors are always retryable.
    pub fn is_transient(&self) -> bool {
        true
    }
}

/// Errors that can occur while reading or mutating job records.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Job '{0}' not found")]
    NotFound(String),

    #[error("Job '{0}' already exists")]
    AlreadyExists(String),

    #[error("Job '{job_id}' cannot be deserialized: {reason}")]
    Deserialization { job_id: String, reason: String },

    #[error("Illegal transition for job '{job_id}' from '{from}' to '{to}'")]
    IllegalTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl JobError {
    pub fn is_transient(&self) -> bool {
        matches!(self, JobError::Store(_))
    }

    /// Whether this error should be surfaced to an operator rather than retried.
    pub fn is_actionable(&self) -> bool {
        matches!(
            self,
            JobError::AlreadyExists(_)
                | JobError::IllegalTransition { .. }
                | JobError::Deserialization { .. }
        )
    }
}

/// Errors that can occur while managing the scheduler lease.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Lock '{key}' is held by another scheduler instance")]
    Unavailable { key: String },

    #[error("Ownership of lock '{key}' was lost")]
    OwnershipLost { key: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LockError {
    /// Every lock error means "not the active scheduler right now, retry later".
    pub fn is_transient(&self) -> bool {
        true
    }
}

/// Errors surfaced by the scheduler loop and the submission façade.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Scheduler loop is already running")]
    AlreadyRunning,

    #[error("Lease release timed out after {0:?}")]
    ReleaseTimeout(Duration),
}

impl SchedulerError {
    pub fn is_transient(&self) -> bool {
        match self {
            SchedulerError::Lock(e) => e.is_transient(),
            SchedulerError::Job(e) => e.is_transient(),
            SchedulerError::Store(_) | SchedulerError::ReleaseTimeout(_) => true,
            SchedulerError::AlreadyRunning => false,
        }
    }
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

//! Error types for the batchflow engine.
//!
//! Every failure that crosses an engine boundary is a [`BatchError`]. Item
//! failures raised by readers, processors and writers carry a *kind* string
//! that classifiers, retry policies and skip policies match against. Kinds are
//! dotted hierarchies: a rule registered for `"transient"` also matches
//! `"transient.timeout"`.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type BatchResult<T> = Result<T, BatchError>;

/// The main error type for batchflow operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BatchError {
    /// A failure raised by an item reader, processor or writer.
    #[error("{kind}: {message}")]
    Item {
        /// Classification kind (dotted hierarchy).
        kind: String,
        /// Human readable message.
        message: String,
    },

    /// Retries were exhausted and no recovery path was available.
    #[error("Retry exhausted after {attempts} attempts: {cause}")]
    RetryExhausted {
        /// Number of attempts made.
        attempts: usize,
        /// The last failure.
        cause: Box<BatchError>,
    },

    /// A retry listener vetoed the retry before the first attempt.
    #[error("Retry terminated abnormally by listener: {0}")]
    RetryTerminated(String),

    /// The stateful retry context cache is full.
    #[error("Retry cache capacity of {capacity} exceeded")]
    RetryCacheCapacityExceeded {
        /// The configured capacity.
        capacity: usize,
    },

    /// The skip limit for a step was exceeded.
    #[error("Skip limit of {limit} exceeded: {cause}")]
    SkipLimitExceeded {
        /// The configured limit.
        limit: usize,
        /// The failure that could not be skipped.
        cause: Box<BatchError>,
    },

    /// A cooperative stop request was honoured.
    #[error("Job interrupted: {0}")]
    Interrupted(String),

    /// A component was used in a state that does not allow the operation.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// The job repository failed.
    #[error("Job repository error: {0}")]
    Repository(String),

    /// An execution for this job instance is already running.
    #[error("A job execution for this job is already running: {0}")]
    JobExecutionAlreadyRunning(String),

    /// The job instance already completed and cannot be restarted.
    #[error("A job instance already exists and is complete: {0}")]
    JobInstanceAlreadyComplete(String),

    /// The job cannot be restarted.
    #[error("Job restart error: {0}")]
    JobRestart(String),

    /// A step has been started more often than its start limit allows.
    #[error("Maximum start limit exceeded for step '{step}': {limit}")]
    StartLimitExceeded {
        /// The step name.
        step: String,
        /// The configured start limit.
        limit: usize,
    },

    /// Partition handling failed.
    #[error("Partition error: {0}")]
    Partition(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A worker task panicked or was aborted.
    #[error("Worker task failed: {0}")]
    Worker(String),
}

impl BatchError {
    /// Creates an item error with the given kind.
    #[must_use]
    pub fn item(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Item {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Returns the classification kind of this error.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::Item { kind, .. } => kind,
            Self::RetryExhausted { .. } => "retry_exhausted",
            Self::RetryTerminated(_) => "retry_terminated",
            Self::RetryCacheCapacityExceeded { .. } => "retry_cache_capacity_exceeded",
            Self::SkipLimitExceeded { .. } => "skip_limit_exceeded",
            Self::Interrupted(_) => "interrupted",
            Self::IllegalState(_) => "illegal_state",
            Self::Repository(_) => "repository",
            Self::JobExecutionAlreadyRunning(_) => "job_execution_already_running",
            Self::JobInstanceAlreadyComplete(_) => "job_instance_already_complete",
            Self::JobRestart(_) => "job_restart",
            Self::StartLimitExceeded { .. } => "start_limit_exceeded",
            Self::Partition(_) => "partition",
            Self::Configuration(_) => "configuration",
            Self::Serialization(_) => "serialization",
            Self::Worker(_) => "worker",
        }
    }

    /// Returns the innermost error, unwrapping retry and skip wrappers.
    #[must_use]
    pub fn root_cause(&self) -> &Self {
        match self {
            Self::RetryExhausted { cause, .. } | Self::SkipLimitExceeded { cause, .. } => {
                cause.root_cause()
            }
            other => other,
        }
    }

    /// Returns true for cooperative stop requests.
    #[must_use]
    pub fn is_interruption(&self) -> bool {
        matches!(self, Self::Interrupted(_))
    }
}

impl From<serde_json::Error> for BatchError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<tokio::task::JoinError> for BatchError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Worker(err.to_string())
    }
}

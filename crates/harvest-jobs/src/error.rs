use thiserror::Error;

use crate::types::JobStatus;

/// Errors that can occur within the job queue.
#[derive(Debug, Error)]
pub enum JobsError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// No job with the given ID exists in the store.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    /// The requested status change is not a legal lifecycle transition.
    #[error("Invalid transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: JobStatus,
        to: JobStatus,
    },

    /// A job type tag is empty or contains characters outside `[a-z0-9_-]`.
    #[error("Invalid job type: {0:?}")]
    InvalidJobType(String),

    /// An executor is already registered for this job type.
    #[error("Executor already registered for job type: {0}")]
    DuplicateExecutor(String),

    /// Job input could not be encoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The connection mutex was poisoned by a panicking holder.
    #[error("Store lock poisoned")]
    LockPoisoned,

    /// A blocking store task failed to complete.
    #[error("Store task failed: {0}")]
    Task(String),
}

impl JobsError {
    /// Short error code string used in structured log fields.
    pub fn code(&self) -> &'static str {
        match self {
            JobsError::Database(_) => "DATABASE_ERROR",
            JobsError::JobNotFound { .. } => "JOB_NOT_FOUND",
            JobsError::InvalidTransition { .. } => "INVALID_TRANSITION",
            JobsError::InvalidJobType(_) => "INVALID_JOB_TYPE",
            JobsError::DuplicateExecutor(_) => "DUPLICATE_EXECUTOR",
            JobsError::Serialization(_) => "SERIALIZATION_ERROR",
            JobsError::LockPoisoned => "LOCK_POISONED",
            JobsError::Task(_) => "TASK_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, JobsError>;

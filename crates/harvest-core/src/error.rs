use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid executor for job type '{job_type}': {reason}")]
    InvalidExecutor { job_type: String, reason: String },
}

impl HarvestError {
    /// Short, stable error code for logs and CLI output.
    pub fn code(&self) -> &'static str {
        match self {
            HarvestError::Config(_) => "CONFIG_ERROR",
            HarvestError::InvalidExecutor { .. } => "INVALID_EXECUTOR",
        }
    }
}

pub type Result<T> = std::result::Result<T, HarvestError>;

//! Kindred error type.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, KindredError>;

#[derive(Debug, Error)]
pub enum KindredError {
    /// Job type string not recognised at admission.
    #[error("Invalid job type: {0}")]
    InvalidType(String),

    /// Target category queue already holds `capacity` pending jobs.
    #[error("Queue '{queue}' is full ({capacity} pending)")]
    QueueFull { queue: String, capacity: usize },

    #[error("Job {job_id} timed out after {timeout_ms}ms")]
    JobTimeout { job_id: String, timeout_ms: u64 },

    /// No worker registered for a job type. Retrying cannot help.
    #[error("No worker registered for job type '{0}'")]
    WorkerMissing(String),

    #[error("Worker '{0}' is already running")]
    WorkerBusy(String),

    /// A processor reported its own failure.
    #[error("Job failed: {0}")]
    JobFailed(String),

    #[error("Delivery failed: {0}")]
    DeliveryFailure(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A caller-supplied value outside what the scheduler can represent.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl KindredError {
    /// Whether a queue job that failed with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KindredError::JobTimeout { .. }
                | KindredError::JobFailed(_)
                | KindredError::WorkerBusy(_)
                | KindredError::DeliveryFailure(_)
                | KindredError::Database(_)
                | KindredError::Io(_)
                | KindredError::Json(_)
        )
    }
}

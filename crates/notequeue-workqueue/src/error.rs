//! Queue errors.

use thiserror::Error;

/// Queue error types.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    /// Task not found.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// No queue registered under this id.
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// Database error.
    #[error("Database error: {0}")]
    Database(String),

    /// Payload could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Task execution failed.
    #[error("Task execution failed: {0}")]
    ExecutionFailed(String),

    /// A strict batch was poisoned by an earlier failure.
    #[error("Batch aborted after an earlier failure: {0}")]
    BatchAborted(String),

    /// The worker pool has been shut down.
    #[error("Worker pool shut down: {0}")]
    Shutdown(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Generic error.
    #[error("{0}")]
    Custom(String),
}

impl From<tokio_rusqlite::Error> for QueueError {
    fn from(e: tokio_rusqlite::Error) -> Self {
        QueueError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(e: serde_json::Error) -> Self {
        QueueError::Serialization(e.to_string())
    }
}

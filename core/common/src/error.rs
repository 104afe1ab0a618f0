//! Common error types for the replication engine.

use thiserror::Error;

/// Top-level error type for replication operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Connection could not be established or was dropped.
    #[error("Network error: {0}")]
    Network(String),

    /// Remote call exceeded its deadline.
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Backend answered with a non-success status.
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The owning task was cancelled before the operation finished.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// A replication run failed; carries the rendered cause.
    #[error("Replication failed: {0}")]
    Replication(String),
}

impl Error {
    /// Whether retrying the same operation later may succeed.
    ///
    /// Network drops, timeouts, rate limiting and 5xx responses are transient.
    /// Everything else needs a change on one side before a retry helps.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Network(_) | Error::Timeout(_) | Error::Io(_) => true,
            Error::Http { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

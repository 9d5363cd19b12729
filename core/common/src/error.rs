//! Common error types for shopsync.

use thiserror::Error;

/// Top-level error type for shopsync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Local persistence failed.
    #[error("Storage error: {0}")]
    Storage(String),

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

    /// Transient remote failure (timeout, connection refused, unexpected status).
    #[error("Network error: {0}")]
    Network(String),

    /// The remote store asked us to slow down.
    #[error("Rate limited, retry after {retry_after_ms} ms")]
    RateLimited { retry_after_ms: u64 },

    /// Missing, invalid or expired credentials.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// A remote version precondition did not hold.
    #[error("Conflict: {0}")]
    Conflict(String),
}

impl Error {
    /// Whether the failure is expected to go away on its own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Network(_) | Error::Io(_) | Error::RateLimited { .. }
        )
    }

    /// Stable, machine-readable name of the error variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Storage(_) => "storage",
            Error::Io(_) => "io",
            Error::Serialization(_) => "serialization",
            Error::InvalidInput(_) => "invalidInput",
            Error::NotFound(_) => "notFound",
            Error::Network(_) => "network",
            Error::RateLimited { .. } => "rateLimited",
            Error::Authentication(_) => "authentication",
            Error::Conflict(_) => "conflict",
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

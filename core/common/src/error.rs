//! Common error types for gapsync.

use thiserror::Error;

/// Top-level error type for gapsync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Transport-level failure talking to a remote dependency.
    #[error("Network error: {0}")]
    Network(String),

    /// A request did not complete in time.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The remote source rejected the request.
    #[error("Remote rejected request ({status}): {message}")]
    Remote { status: u16, message: String },

    /// Document store operation failed.
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

    /// A dependency could not be reached when a session was set up.
    #[error("Connectivity check failed: {0}")]
    Connectivity(String),

    /// Another session currently owns the progress store.
    #[error("Progress store is locked by another session: {0}")]
    SessionLocked(String),

    /// Configuration is missing or malformed.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Timeout(_) | Error::Io(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

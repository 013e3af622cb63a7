//! Error types for the storage server.

use objdb_core::CoreError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur while serving.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Malformed request or protocol violation by a client.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A session produced no traffic within the idle window.
    #[error("session idle timeout")]
    IdleTimeout(#[from] tokio::time::error::Elapsed),

    /// Engine-level storage failure.
    #[error("storage error: {0}")]
    Storage(#[from] CoreError),

    /// Socket-level I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Builds a [`ServerError::Protocol`].
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// True when the session itself misbehaved or went quiet, as
    /// opposed to a failure on the server side.
    #[must_use]
    pub fn is_session_fault(&self) -> bool {
        match self {
            ServerError::Protocol(_) | ServerError::IdleTimeout(_) => true,
            ServerError::Io(err) => err.kind() == std::io::ErrorKind::UnexpectedEof,
            ServerError::Storage(_) => false,
        }
    }
}

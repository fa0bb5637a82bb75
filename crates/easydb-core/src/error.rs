//! Error types shared by the client and the server
//!
//! Errors carry plain strings so they can be cloned into events and sent
//! across tasks.

use thiserror::Error;

use crate::hash::Fingerprint;

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while synchronizing a document
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// The server could not be reached, or answered with a failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// A patch was computed against a stale document
    ///
    /// Recoverable: re-fetch the full document and retry.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Malformed or unrecognized message from the peer
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The canonical document could not be written to durable storage
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Missing or malformed request body
    #[error("Invalid request: {0}")]
    Validation(String),

    /// The session was used before `init` completed
    #[error("Session is not initialized")]
    NotInitialized,
}

impl SyncError {
    /// Conflict between the fingerprint a writer expected and the current one
    pub fn stale(expected: Fingerprint, actual: Fingerprint) -> Self {
        SyncError::Conflict(format!(
            "document fingerprint is {}, writer expected {}",
            actual, expected
        ))
    }

    /// Returns true if the caller can recover and retry
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SyncError::Connection(_) | SyncError::Conflict(_) | SyncError::Persistence(_)
        )
    }

    /// Returns true if this error was caused by the request itself
    pub fn is_client_error(&self) -> bool {
        matches!(self, SyncError::Conflict(_) | SyncError::Validation(_))
    }
}

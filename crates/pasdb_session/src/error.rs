//! Error types for session operations.

use std::io;
use thiserror::Error;

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors that can occur while talking to a session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The session has been closed.
    #[error("session is closed")]
    Closed,

    /// A subtransaction was rolled back; the outer transaction must be rolled back first.
    #[error("transaction is inactive due to a rollback in a subtransaction")]
    Inactive,

    /// A row could not be found in storage.
    #[error("row not found: {entity} '{key}'")]
    NotFound {
        /// Entity (table) name.
        entity: String,
        /// Primary key rendered as text.
        key: String,
    },

    /// A constraint would be violated.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// The request does not fit the row's current state.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The backend rejected the operation.
    #[error("backend error: {0}")]
    Backend(String),

    /// The URL names a backend this build cannot serve.
    #[error("unsupported backend: {scheme}")]
    UnsupportedBackend {
        /// The URL scheme that was requested.
        scheme: String,
    },

    /// An I/O error occurred while persisting tables.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Persisted tables could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SessionError {
    /// Creates an invalid request error.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// Creates a backend error.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }
}

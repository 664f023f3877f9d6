//! Error types for pasdb core.

use pasdb_session::SessionError;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for core operations.
pub type DbResult<T> = Result<T, DbError>;

/// Errors that can occur in pasdb core operations.
#[derive(Debug, Error)]
pub enum DbError {
    /// Settings are missing or invalid.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the problem.
        message: String,
    },

    /// The serialization lock could not be acquired in time.
    #[error("timeout waiting for the database lock after {timeout:?}")]
    LockTimeout {
        /// How long the caller waited.
        timeout: Duration,
    },

    /// A lookup returned no usable result.
    #[error("{message}")]
    NothingMatched {
        /// Description of what was looked for.
        message: String,
    },

    /// An instance could not be loaded or reloaded.
    #[error("I/O error: {message}")]
    Io {
        /// Description of the failure.
        message: String,
    },

    /// A file could not be read.
    #[error("file error: {0}")]
    File(#[from] io::Error),

    /// A value or class had the wrong type.
    #[error("type error: {message}")]
    Type {
        /// Description of the mismatch.
        message: String,
    },

    /// A value was out of range or otherwise invalid.
    #[error("value error: {message}")]
    Value {
        /// Description of the invalid value.
        message: String,
    },

    /// An operation is not supported by this instance class.
    #[error("not implemented: {message}")]
    NotImplemented {
        /// The unsupported operation.
        message: String,
    },

    /// JSON content could not be parsed or produced.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The session reported an error.
    #[error("session error: {0}")]
    Session(#[from] SessionError),
}

impl DbError {
    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a nothing-matched error.
    pub fn nothing_matched(message: impl Into<String>) -> Self {
        Self::NothingMatched {
            message: message.into(),
        }
    }

    /// Creates an instance I/O error.
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Creates a type error.
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::Type {
            message: message.into(),
        }
    }

    /// Creates a value error.
    pub fn value(message: impl Into<String>) -> Self {
        Self::Value {
            message: message.into(),
        }
    }

    /// Creates a not-implemented error.
    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::NotImplemented {
            message: message.into(),
        }
    }

    /// Returns true for [`DbError::NothingMatched`].
    #[must_use]
    pub const fn is_nothing_matched(&self) -> bool {
        matches!(self, Self::NothingMatched { .. })
    }
}

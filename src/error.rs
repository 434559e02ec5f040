//! Error types for the Tollgate admission layer.

use std::time::Duration;
use thiserror::Error;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Distributed backend errors
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures talking to the distributed bucket store.
///
/// None of these are surfaced past the limiter façade; every variant makes the
/// façade mark the backend unavailable and decide the request locally.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Connection refused, reset, or otherwise unusable.
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    /// The operation did not complete within the configured timeout.
    #[error("backend timed out after {0:?}")]
    Timeout(Duration),

    /// The backend answered with something we cannot interpret.
    #[error("backend protocol error: {0}")]
    Protocol(String),

    /// Compare-and-swap lost the race on every allowed attempt.
    #[error("bucket update contended after {attempts} attempts")]
    Contention { attempts: u32 },
}

/// Redis timeouts come out as `Timeout(Duration::ZERO)`; the store replaces
/// the zero with its own configured bound.
impl From<redis::RedisError> for BackendError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            BackendError::Timeout(Duration::ZERO)
        } else if err.is_io_error()
            || err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_unrecoverable_error()
        {
            BackendError::Unreachable(err.to_string())
        } else {
            BackendError::Protocol(err.to_string())
        }
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;

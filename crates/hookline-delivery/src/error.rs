//! Error types for delivery operations.
//!
//! Per-attempt failures (transport errors, non-2xx responses) are captured
//! in the retry ledger through [`DeliveryError::error_code`]. Storage and
//! state errors surface to the dispatcher loop or the admin API.

use std::time::Duration;

use hookline_core::{CoreError, ErrorCode};
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Error conditions of webhook delivery.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Network-level connectivity failure.
    #[error("network connection failed: {message}")]
    NetworkError {
        /// Error message describing the network failure
        message: String,
    },

    /// HTTP request timeout exceeded.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// Number of seconds before the request timed out
        timeout_seconds: u64,
    },

    /// The destination answered with a non-2xx status.
    #[error("HTTP {status_code}: {status_text}")]
    HttpStatus {
        /// Status code received
        status_code: u16,
        /// Canonical reason phrase
        status_text: String,
    },

    /// Storage failure while delivering or recording.
    #[error(transparent)]
    Storage(#[from] CoreError),

    /// A referenced record does not exist.
    #[error("{message}")]
    NotFound {
        /// What was missing
        message: String,
    },

    /// The record is not in a state that allows the operation.
    #[error("{message}")]
    InvalidState {
        /// Why the operation was refused
        message: String,
    },

    /// Invalid client or engine configuration.
    #[error("invalid delivery configuration: {message}")]
    ConfigurationError {
        /// Configuration error message
        message: String,
    },

    /// Worker task panicked.
    #[error("worker {worker_id} panicked: {error}")]
    WorkerPanic {
        /// Index of the worker
        worker_id: usize,
        /// Join error text
        error: String,
    },

    /// Workers did not stop within the grace period.
    #[error("shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Grace period that elapsed
        timeout: Duration,
    },
}

impl DeliveryError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates an error for a non-2xx response.
    pub fn http_status(status_code: u16, status_text: impl Into<String>) -> Self {
        Self::HttpStatus { status_code, status_text: status_text.into() }
    }

    /// Creates a not-found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound { message: message.into() }
    }

    /// Creates an invalid-state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Classification recorded in the retry ledger.
    ///
    /// HTTP failures record the status code; transport failures record a
    /// symbolic code; anything else records `-1`.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::HttpStatus { status_code, .. } => ErrorCode::Status(i64::from(*status_code)),
            Self::NetworkError { .. } => ErrorCode::Code("NETWORK_ERROR".into()),
            Self::Timeout { .. } => ErrorCode::Code("TIMEOUT".into()),
            Self::Storage(_) => ErrorCode::Code("STORAGE_ERROR".into()),
            Self::NotFound { .. }
            | Self::InvalidState { .. }
            | Self::ConfigurationError { .. }
            | Self::WorkerPanic { .. }
            | Self::ShutdownTimeout { .. } => ErrorCode::unknown(),
        }
    }
}

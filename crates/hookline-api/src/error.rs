//! Boundary error type and the response envelope.
//!
//! Every handler failure is an [`ApiError`]. The variant decides the status,
//! the machine-readable code and what the caller is allowed to see; the
//! mapping is one exhaustive match per property so a new variant cannot be
//! added without deciding all of them.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use hookline_core::CoreError;
use hookline_delivery::DeliveryError;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, warn};

use crate::crypto::SignatureError;

/// Result type for handlers.
pub type Result<T> = std::result::Result<T, ApiError>;

/// Message substituted for server faults in production.
pub const REDACTED_MESSAGE: &str = "internal server error";

/// Broad classification of an [`ApiError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request itself is malformed.
    ClientInput,
    /// The request could not be authenticated.
    Integrity,
    /// The idempotency key is in use or was reused with another body.
    IdempotencyConflict,
    /// A referenced record does not exist.
    NotFound,
    /// The record exists but refuses the operation.
    InvalidState,
    /// Storage failed.
    Persistence,
    /// An internal contract was broken.
    Invariant,
}

/// Errors returned to HTTP callers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// `X-Webhook-Signature` is absent or empty.
    #[error("missing X-Webhook-Signature header")]
    MissingSignature,

    /// `X-Webhook-Signature` is not hex.
    #[error("X-Webhook-Signature must be a hex encoded HMAC-SHA256 digest")]
    MalformedSignature,

    /// The signature does not match the body.
    #[error("failed signature verification. you are not the sender")]
    SignatureMismatch,

    /// `Idempotency-Key` is absent or empty.
    #[error("missing Idempotency-Key header")]
    MissingIdempotencyKey,

    /// `X-Destination-URL` is absent.
    #[error("missing X-Destination-URL header")]
    MissingDestination,

    /// `X-Destination-URL` is not an absolute http(s) URL.
    #[error("invalid destination url: {reason}")]
    InvalidDestination {
        /// The rejected value
        url: String,
        /// Why it was rejected
        reason: String,
    },

    /// The body is not JSON.
    #[error("request body is not valid JSON: {message}")]
    InvalidJson {
        /// Parser error
        message: String,
    },

    /// A query or body parameter is invalid.
    #[error("{message}")]
    Validation {
        /// What was wrong
        message: String,
    },

    /// Another request holds the key.
    #[error("Request with this key already exists.")]
    IdempotencyConflict,

    /// The key was first used with a different body.
    #[error("Request with this key exists but with a different body")]
    IdempotencyHashMismatch,

    /// Record not found.
    #[error("{message}")]
    NotFound {
        /// What was missing
        message: String,
    },

    /// Record is in the wrong state.
    #[error("{message}")]
    InvalidState {
        /// Why the operation was refused
        message: String,
    },

    /// Storage failure.
    #[error("{message}")]
    Persistence {
        /// Underlying error
        message: String,
    },

    /// Broken internal contract.
    #[error("{message}")]
    Invariant {
        /// Underlying error
        message: String,
    },
}

impl ApiError {
    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into() }
    }

    /// Creates a not-found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound { message: message.into() }
    }

    /// Classification of this error.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingSignature
            | Self::MalformedSignature
            | Self::MissingIdempotencyKey
            | Self::MissingDestination
            | Self::InvalidDestination { .. }
            | Self::InvalidJson { .. }
            | Self::Validation { .. } => ErrorKind::ClientInput,
            Self::SignatureMismatch => ErrorKind::Integrity,
            Self::IdempotencyConflict | Self::IdempotencyHashMismatch => {
                ErrorKind::IdempotencyConflict
            },
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::Persistence { .. } => ErrorKind::Persistence,
            Self::Invariant { .. } => ErrorKind::Invariant,
        }
    }

    /// HTTP status for this error.
    pub const fn http_status(&self) -> StatusCode {
        match self {
            Self::MissingSignature
            | Self::MalformedSignature
            | Self::MissingIdempotencyKey
            | Self::MissingDestination
            | Self::InvalidDestination { .. }
            | Self::InvalidJson { .. }
            | Self::Validation { .. }
            | Self::IdempotencyHashMismatch => StatusCode::BAD_REQUEST,
            Self::SignatureMismatch => StatusCode::FORBIDDEN,
            Self::IdempotencyConflict | Self::InvalidState { .. } => StatusCode::CONFLICT,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Persistence { .. } | Self::Invariant { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            },
        }
    }

    /// Machine-readable error code.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::MissingSignature => "MISSING_SIGNATURE",
            Self::MalformedSignature => "MALFORMED_SIGNATURE",
            Self::SignatureMismatch => "SIGNATURE_MISMATCH",
            Self::MissingIdempotencyKey => "MISSING_IDEMPOTENCY_KEY",
            Self::MissingDestination => "MISSING_DESTINATION",
            Self::InvalidDestination { .. } => "INVALID_DESTINATION",
            Self::InvalidJson { .. } => "INVALID_JSON",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::IdempotencyConflict => "IDEMPOTENCY_CONFLICT",
            Self::IdempotencyHashMismatch => "IDEMPOTENCY_HASH_MISMATCH",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::Persistence { .. } => "PERSISTENCE_ERROR",
            Self::Invariant { .. } => "INTERNAL_ERROR",
        }
    }

    /// Structured context for the caller, if any.
    pub fn details(&self) -> Option<Value> {
        match self {
            Self::InvalidDestination { url, .. } => Some(json!({ "destination_url": url })),
            Self::InvalidJson { message } => Some(json!({ "reason": message })),
            Self::MissingSignature
            | Self::MalformedSignature
            | Self::SignatureMismatch
            | Self::MissingIdempotencyKey
            | Self::MissingDestination
            | Self::Validation { .. }
            | Self::IdempotencyConflict
            | Self::IdempotencyHashMismatch
            | Self::NotFound { .. }
            | Self::InvalidState { .. }
            | Self::Persistence { .. }
            | Self::Invariant { .. } => None,
        }
    }

    /// Whether the error is the service's fault rather than the caller's.
    pub const fn is_server_fault(&self) -> bool {
        matches!(self.kind(), ErrorKind::Persistence | ErrorKind::Invariant)
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::NotFound(message) => Self::NotFound { message },
            CoreError::InvalidState(message) => Self::InvalidState { message },
            CoreError::InvalidInput(message) => Self::Validation { message },
            CoreError::InvariantViolation(_) => Self::Invariant { message: err.to_string() },
            CoreError::Database(_) | CoreError::ConstraintViolation(_) => {
                Self::Persistence { message: err.to_string() }
            },
        }
    }
}

impl From<DeliveryError> for ApiError {
    fn from(err: DeliveryError) -> Self {
        match err {
            DeliveryError::Storage(core) => core.into(),
            DeliveryError::NotFound { message } => Self::NotFound { message },
            DeliveryError::InvalidState { message } => Self::InvalidState { message },
            DeliveryError::NetworkError { .. }
            | DeliveryError::Timeout { .. }
            | DeliveryError::HttpStatus { .. } => Self::Persistence { message: err.to_string() },
            DeliveryError::ConfigurationError { .. }
            | DeliveryError::WorkerPanic { .. }
            | DeliveryError::ShutdownTimeout { .. } => Self::Invariant { message: err.to_string() },
        }
    }
}

impl From<SignatureError> for ApiError {
    fn from(err: SignatureError) -> Self {
        match err {
            SignatureError::Missing => Self::MissingSignature,
            SignatureError::InvalidFormat => Self::MalformedSignature,
            SignatureError::Mismatch => Self::SignatureMismatch,
            SignatureError::InvalidSecret => Self::Invariant { message: err.to_string() },
        }
    }
}

/// `{code, message, details?}` carried in failed responses.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    /// Machine-readable code.
    pub code: &'static str,
    /// Human-readable message.
    pub message: String,
    /// Structured context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// `{success, data, error}` envelope used by every JSON endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse<T> {
    /// Whether the request succeeded.
    pub success: bool,
    /// Payload on success.
    pub data: Option<T>,
    /// Failure description.
    pub error: Option<ErrorBody>,
}

impl<T: Serialize> ApiResponse<T> {
    /// Successful envelope around `data`.
    pub fn ok(data: T) -> Self {
        Self { success: true, data: Some(data), error: None }
    }
}

impl ApiResponse<()> {
    /// Failed envelope.
    pub fn failure(error: ErrorBody) -> Self {
        Self { success: false, data: None, error: Some(error) }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

/// Response extension marking a server fault, so the redaction middleware
/// can hide its message in production.
#[derive(Debug, Clone, Copy)]
pub struct ServerFault {
    /// Code of the original error.
    pub code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.http_status();
        let code = self.code();

        if self.is_server_fault() {
            error!(code, error = %self, "request failed");
        } else {
            warn!(code, error = %self, "request rejected");
        }

        let body = ApiResponse::failure(ErrorBody {
            code,
            message: self.to_string(),
            details: self.details(),
        });

        let mut response = (status, body).into_response();
        if self.is_server_fault() {
            response.extensions_mut().insert(ServerFault { code });
        }
        response
    }
}

//! Delivery attempt ledger produced by one retry execution.
//!
//! The ledger is persisted verbatim as `error_details` on failed events and
//! dead-letter entries, so its JSON shape is part of the storage format:
//!
//! ```json
//! {
//!   "flag": "FAILURE",
//!   "retry_attempts": [
//!     { "attempt": 1, "timestamp": "...", "error": "HTTP 500", "errorCode": 500 }
//!   ]
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Terminal flag of a retry execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetryFlag {
    /// An attempt succeeded.
    Success,
    /// Every permitted attempt failed.
    Failure,
    /// Execution has not reached a terminal state.
    #[default]
    Unknown,
}

impl std::fmt::Display for RetryFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "SUCCESS"),
            Self::Failure => write!(f, "FAILURE"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Machine-readable cause of a failed attempt.
///
/// HTTP failures carry the numeric status; transport and internal failures
/// carry a symbolic code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorCode {
    /// Numeric code, usually an HTTP status.
    Status(i64),
    /// Symbolic code such as `NETWORK_ERROR`.
    Code(String),
}

impl ErrorCode {
    /// Code used when an error carries no better classification.
    pub fn unknown() -> Self {
        Self::Status(-1)
    }
}

impl From<i64> for ErrorCode {
    fn from(status: i64) -> Self {
        Self::Status(status)
    }
}

impl From<&str> for ErrorCode {
    fn from(code: &str) -> Self {
        Self::Code(code.to_string())
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Status(status) => write!(f, "{status}"),
            Self::Code(code) => f.write_str(code),
        }
    }
}

/// One failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// 1-based attempt number.
    pub attempt: u32,
    /// When the failure was observed.
    pub timestamp: DateTime<Utc>,
    /// Human-readable failure message.
    pub error: String,
    /// Classification of the failure.
    #[serde(rename = "errorCode")]
    pub error_code: ErrorCode,
}

/// Ordered record of the failures of one retry execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureLedger {
    /// Terminal flag.
    pub flag: RetryFlag,
    /// Failures in attempt order.
    pub retry_attempts: Vec<LedgerEntry>,
}

impl FailureLedger {
    /// Number of failed attempts recorded.
    pub fn len(&self) -> usize {
        self.retry_attempts.len()
    }

    /// Returns true when no failure was recorded.
    pub fn is_empty(&self) -> bool {
        self.retry_attempts.is_empty()
    }

    /// Appends a failure.
    pub fn record_failure(
        &mut self,
        attempt: u32,
        timestamp: DateTime<Utc>,
        error: impl Into<String>,
        error_code: ErrorCode,
    ) {
        self.retry_attempts.push(LedgerEntry { attempt, timestamp, error: error.into(), error_code });
    }

    /// Most recent failure, if any.
    pub fn last_error(&self) -> Option<&LedgerEntry> {
        self.retry_attempts.last()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn ledger_serializes_in_storage_shape() {
        let timestamp = DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let ledger = FailureLedger {
            flag: RetryFlag::Failure,
            retry_attempts: vec![
                LedgerEntry {
                    attempt: 1,
                    timestamp,
                    error: "HTTP 500: Internal Server Error".into(),
                    error_code: ErrorCode::Status(500),
                },
                LedgerEntry {
                    attempt: 2,
                    timestamp,
                    error: "connection refused".into(),
                    error_code: ErrorCode::Code("NETWORK_ERROR".into()),
                },
            ],
        };

        let value = serde_json::to_value(&ledger).unwrap();

        assert_eq!(value["flag"], "FAILURE");
        assert_eq!(value["retry_attempts"][0]["errorCode"], json!(500));
        assert_eq!(value["retry_attempts"][1]["errorCode"], json!("NETWORK_ERROR"));
        assert_eq!(serde_json::from_value::<FailureLedger>(value).unwrap(), ledger);
    }

    #[test]
    fn default_ledger_is_unknown_and_empty() {
        let ledger = FailureLedger::default();
        assert_eq!(ledger.flag, RetryFlag::Unknown);
        assert!(ledger.is_empty());
        assert!(ledger.last_error().is_none());
    }
}

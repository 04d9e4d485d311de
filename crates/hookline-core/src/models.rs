//! Durable entities and strongly-typed identifiers.
//!
//! Identifiers wrap UUIDs so an event id can never be passed where a
//! dead-letter id is expected. Status enums are stored as upper-case text
//! and decoded strictly; an unknown status in the database is a decode
//! error rather than a silent default.

use std::{collections::HashMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;
use uuid::Uuid;

use crate::{envelope::EventEnvelope, ledger::FailureLedger};

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult = Result<sqlx::encode::IsNull, sqlx::error::BoxDynError>;
type BoxDynError = sqlx::error::BoxDynError;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl sqlx::Type<PgDb> for $name {
            fn type_info() -> PgTypeInfo {
                <Uuid as sqlx::Type<PgDb>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $name {
            fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
                Ok(Self(<Uuid as sqlx::Decode<PgDb>>::decode(value)?))
            }
        }

        impl sqlx::Encode<'_, PgDb> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
                <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
            }
        }
    };
}

macro_rules! text_status {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Database and wire representation.
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!("invalid {}: {other}", stringify!($name))),
                }
            }
        }

        impl sqlx::Type<PgDb> for $name {
            fn type_info() -> PgTypeInfo {
                <&str as sqlx::Type<PgDb>>::type_info()
            }

            fn compatible(ty: &PgTypeInfo) -> bool {
                <&str as sqlx::Type<PgDb>>::compatible(ty)
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $name {
            fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
                let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
                Ok(s.parse::<Self>()?)
            }
        }
    };
}

uuid_id!(
    /// Identifier of a queued webhook event.
    EventId
);

uuid_id!(
    /// Identifier of a dead-letter entry.
    DeadLetterId
);

uuid_id!(
    /// Identifier of one recorded delivery attempt.
    DeliveryAttemptId
);

/// Event lifecycle status.
///
/// ```text
/// RECEIVED -> PROCESSING -> DELIVERED
///                |      \-> FAILED
///                \-> PROCESSING (stale reclaim by another worker)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    /// Persisted by ingress, waiting for a worker.
    Received,
    /// Claimed by a worker.
    Processing,
    /// Delivered to the destination. Terminal.
    Delivered,
    /// Retries exhausted and moved to the dead-letter queue. Terminal.
    Failed,
}

text_status!(EventStatus {
    Received => "RECEIVED",
    Processing => "PROCESSING",
    Delivered => "DELIVERED",
    Failed => "FAILED",
});

impl EventStatus {
    /// Returns true for states that never change again.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Failed)
    }
}

/// Status of an idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdempotencyStatus {
    /// A request owning this key is in flight.
    Processing,
    /// The request completed and its response is cached.
    Processed,
    /// The request failed permanently and its failure response is cached.
    Failed,
}

text_status!(IdempotencyStatus {
    Processing => "PROCESSING",
    Processed => "PROCESSED",
    Failed => "FAILED",
});

/// Status of a dead-letter entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeadLetterStatus {
    /// Waiting for operator action.
    Pending,
    /// A manual retry is in flight.
    Retrying,
    /// Delivered by a manual retry or resolved by an operator.
    Resolved,
    /// Given up on, manually or after the retry budget ran out.
    Abandoned,
}

text_status!(DeadLetterStatus {
    Pending => "PENDING",
    Retrying => "RETRYING",
    Resolved => "RESOLVED",
    Abandoned => "ABANDONED",
});

/// A unit of delivery work.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Event {
    /// Unique identifier.
    pub id: EventId,
    /// Current lifecycle status.
    pub status: EventStatus,
    /// Canonical envelope delivered to the destination.
    pub payload: Json<EventEnvelope>,
    /// Client-supplied key that created this event.
    pub idempotency_key: String,
    /// Where the payload is POSTed.
    pub destination_url: String,
    /// When the current claim was taken.
    pub locked_at: Option<DateTime<Utc>>,
    /// Worker holding the current claim.
    pub locked_by: Option<String>,
    /// Failure ledger recorded on terminal failure.
    pub error_details: Option<Json<FailureLedger>>,
    /// When ingress persisted the event.
    pub created_at: DateTime<Utc>,
    /// When delivery succeeded.
    pub delivered_at: Option<DateTime<Utc>>,
    /// When delivery failed permanently.
    pub failed_at: Option<DateTime<Utc>>,
}

impl Event {
    /// The envelope without the JSON column wrapper.
    pub fn envelope(&self) -> &EventEnvelope {
        &self.payload.0
    }
}

/// Input for creating an event.
#[derive(Debug, Clone)]
pub struct NewEvent {
    /// Client-supplied idempotency key.
    pub idempotency_key: String,
    /// Validated destination URL.
    pub destination_url: String,
    /// Canonical envelope.
    pub payload: EventEnvelope,
}

/// Result of inserting an event.
///
/// Events are unique per idempotency key, so a request that reclaimed a
/// stale key after a crash gets the event the first request already queued.
#[derive(Debug, Clone)]
pub struct EventInsert {
    /// The stored event.
    pub event: Event,
    /// False when the event already existed for the key.
    pub created: bool,
}

/// One row per client-supplied idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct IdempotencyRecord {
    /// The key itself.
    pub key: String,
    /// Hex SHA-256 of the request body. Immutable.
    pub request_hash: String,
    /// Current status.
    pub status: IdempotencyStatus,
    /// HTTP status replayed to later requests.
    pub response_status: Option<i32>,
    /// Body replayed to later requests.
    pub response_body: Option<Json<Value>>,
    /// When the owning request took (or re-took) the key.
    pub locked_at: DateTime<Utc>,
    /// When the key was first seen.
    pub created_at: DateTime<Utc>,
    /// Last modification.
    pub updated_at: DateTime<Utc>,
}

/// A permanently failed delivery awaiting operator action.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeadLetterEntry {
    /// Unique identifier.
    pub id: DeadLetterId,
    /// Event that failed.
    pub original_event_id: EventId,
    /// Idempotency key of the failed event.
    pub idempotency_key: String,
    /// Envelope that could not be delivered.
    pub payload: Json<EventEnvelope>,
    /// Ledger of the failed retry execution.
    pub error_details: Json<FailureLedger>,
    /// Current status.
    pub status: DeadLetterStatus,
    /// Manual retries that failed. Never decreases.
    pub retry_count: i32,
    /// When the entry was created.
    pub failed_at: DateTime<Utc>,
    /// When the latest manual retry claimed the entry.
    pub retry_started_at: Option<DateTime<Utc>>,
    /// When the entry was resolved or abandoned.
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Input for creating a dead-letter entry.
#[derive(Debug, Clone)]
pub struct NewDeadLetter {
    /// Event that failed.
    pub original_event_id: EventId,
    /// Idempotency key of the failed event.
    pub idempotency_key: String,
    /// Envelope that could not be delivered.
    pub payload: EventEnvelope,
    /// Failure ledger.
    pub error_details: FailureLedger,
}

/// Immutable audit record of one outbound HTTP call.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryAttempt {
    /// Unique identifier.
    pub id: DeliveryAttemptId,
    /// Event being delivered.
    pub event_id: EventId,
    /// 1-based attempt number within one retry execution.
    pub attempt_number: i32,
    /// Destination of the call.
    pub destination_url: String,
    /// Headers sent.
    pub request_headers: Json<HashMap<String, String>>,
    /// Body sent.
    pub request_body: Json<Value>,
    /// HTTP status received, if a response arrived.
    pub status_code: Option<i32>,
    /// Response body, capped at 1000 characters.
    pub response_body: Option<String>,
    /// Transport error, if no response arrived.
    pub error_message: Option<String>,
    /// When the call started.
    pub started_at: DateTime<Utc>,
    /// When the call finished.
    pub completed_at: DateTime<Utc>,
    /// `completed_at - started_at` in milliseconds.
    pub latency_ms: i64,
    /// Whether the destination answered 2xx.
    pub success: bool,
}

/// Input for recording a delivery attempt.
#[derive(Debug, Clone)]
pub struct NewDeliveryAttempt {
    /// Event being delivered.
    pub event_id: EventId,
    /// 1-based attempt number.
    pub attempt_number: i32,
    /// Destination of the call.
    pub destination_url: String,
    /// Headers sent.
    pub request_headers: HashMap<String, String>,
    /// Body sent.
    pub request_body: Value,
    /// HTTP status received.
    pub status_code: Option<i32>,
    /// Response body, already truncated.
    pub response_body: Option<String>,
    /// Transport error.
    pub error_message: Option<String>,
    /// When the call started.
    pub started_at: DateTime<Utc>,
    /// When the call finished.
    pub completed_at: DateTime<Utc>,
    /// Duration in milliseconds.
    pub latency_ms: i64,
    /// Whether the destination answered 2xx.
    pub success: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_round_trip_through_text() {
        for status in [
            EventStatus::Received,
            EventStatus::Processing,
            EventStatus::Delivered,
            EventStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<EventStatus>().unwrap(), status);
        }
        assert_eq!("RETRYING".parse::<DeadLetterStatus>().unwrap(), DeadLetterStatus::Retrying);
        assert!("processing".parse::<IdempotencyStatus>().is_err());
    }

    #[test]
    fn status_serde_matches_database_text() {
        let value = serde_json::to_value(DeadLetterStatus::Abandoned).unwrap();
        assert_eq!(value, serde_json::json!("ABANDONED"));
        assert_eq!(value.as_str(), Some(DeadLetterStatus::Abandoned.as_str()));
    }

    #[test]
    fn only_delivered_and_failed_are_terminal() {
        assert!(!EventStatus::Received.is_terminal());
        assert!(!EventStatus::Processing.is_terminal());
        assert!(EventStatus::Delivered.is_terminal());
        assert!(EventStatus::Failed.is_terminal());
    }

    #[test]
    fn ids_serialize_as_plain_uuids() {
        let id = EventId::new();
        let value = serde_json::to_value(id).unwrap();
        assert_eq!(value, serde_json::json!(id.0.to_string()));
    }
}

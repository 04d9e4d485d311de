//! Core domain models, storage and idempotency coordination.
//!
//! Provides the durable data model (events, idempotency keys, dead-letter
//! entries, delivery attempts), the storage traits with their PostgreSQL and
//! in-memory implementations, and the idempotency coordinator that arbitrates
//! duplicate client requests. The delivery and API crates build on these
//! types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod envelope;
pub mod error;
pub mod idempotency;
pub mod ledger;
pub mod metrics;
pub mod models;
pub mod storage;
pub mod time;

pub use envelope::EventEnvelope;
pub use error::{CoreError, Result};
pub use idempotency::{Acquisition, IdempotencyCoordinator, KeyOutcome, StoredResponse};
pub use ledger::{ErrorCode, FailureLedger, LedgerEntry, RetryFlag};
pub use metrics::Metrics;
pub use models::{
    DeadLetterEntry, DeadLetterId, DeadLetterStatus, DeliveryAttempt, DeliveryAttemptId, Event,
    EventId, EventStatus, IdempotencyRecord, IdempotencyStatus,
};
pub use storage::Storage;
pub use time::{Clock, RealClock, TestClock};

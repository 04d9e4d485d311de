//! Durable storage behind trait seams.
//!
//! Each entity has a store trait with two implementations: a PostgreSQL
//! repository used in production and [`memory::MemoryStore`] used by tests
//! and local runs. Every state-changing method is a single atomic operation
//! guarded on the expected prior state, so racing workers never lose an
//! update. Methods that report a `bool` or `Option` return `false`/`None`
//! when the guard did not match.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use serde_json::Value;
use sqlx::PgPool;

pub mod dead_letters;
pub mod delivery_attempts;
pub mod events;
pub mod idempotency_keys;
pub mod memory;
pub mod migrations;

use crate::{
    error::Result,
    ledger::FailureLedger,
    models::{
        DeadLetterEntry, DeadLetterId, DeliveryAttempt, Event, EventId, EventInsert,
        IdempotencyRecord, IdempotencyStatus, NewDeadLetter, NewDeliveryAttempt, NewEvent,
    },
};

/// Boxed future returned by store methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Event queue with crash-tolerant claiming.
pub trait EventStore: Send + Sync + 'static {
    /// Inserts a RECEIVED event, or returns the event already stored for the
    /// same idempotency key.
    fn insert(&self, event: NewEvent) -> StoreFuture<'_, EventInsert>;

    /// Claims the oldest RECEIVED event, or the oldest PROCESSING event
    /// whose claim is older than `stale_after`, for `worker_id`.
    ///
    /// Two concurrent callers never receive the same event.
    fn claim_next(&self, worker_id: String, stale_after: Duration) -> StoreFuture<'_, Option<Event>>;

    /// Moves a PROCESSING event held by `worker_id` to DELIVERED and
    /// releases the claim.
    fn mark_delivered(&self, id: EventId, worker_id: String) -> StoreFuture<'_, bool>;

    /// Moves a PROCESSING event held by `worker_id` to FAILED with the
    /// failure ledger and releases the claim.
    fn mark_failed(
        &self,
        id: EventId,
        worker_id: String,
        ledger: FailureLedger,
    ) -> StoreFuture<'_, bool>;

    /// Loads one event.
    fn find_by_id(&self, id: EventId) -> StoreFuture<'_, Option<Event>>;

    /// Lists events, newest first.
    fn list(&self, limit: i64, offset: i64) -> StoreFuture<'_, Vec<Event>>;

    /// Lightweight connectivity probe.
    fn ping(&self) -> StoreFuture<'_, ()>;
}

/// Idempotency key table.
pub trait IdempotencyStore: Send + Sync + 'static {
    /// Creates a PROCESSING record. Returns `false` if the key exists.
    fn insert_processing(&self, key: String, request_hash: String) -> StoreFuture<'_, bool>;

    /// Loads a record.
    fn find(&self, key: String) -> StoreFuture<'_, Option<IdempotencyRecord>>;

    /// Re-stamps the lock of a PROCESSING record whose lock is older than
    /// `lock_timeout`. Returns `true` if the caller now owns the key.
    fn reclaim_stale(&self, key: String, lock_timeout: Duration) -> StoreFuture<'_, bool>;

    /// Moves a PROCESSING record to a terminal status with the response to
    /// replay. Returns `false` if the record is missing or already terminal.
    fn finalize(
        &self,
        key: String,
        status: IdempotencyStatus,
        response_status: i32,
        response_body: Value,
    ) -> StoreFuture<'_, bool>;
}

/// Dead-letter queue.
pub trait DeadLetterStore: Send + Sync + 'static {
    /// Creates a PENDING entry, or returns the existing entry for the event.
    fn insert(&self, entry: NewDeadLetter) -> StoreFuture<'_, DeadLetterEntry>;

    /// Loads one entry.
    fn find_by_id(&self, id: DeadLetterId) -> StoreFuture<'_, Option<DeadLetterEntry>>;

    /// Loads the entry created for an event.
    fn find_by_event(&self, event_id: EventId) -> StoreFuture<'_, Option<DeadLetterEntry>>;

    /// PENDING entries, oldest failure first.
    fn list_pending(&self) -> StoreFuture<'_, Vec<DeadLetterEntry>>;

    /// PENDING -> RETRYING, stamping `retry_started_at`. An entry left
    /// RETRYING for longer than `reclaim_after` is claimed again.
    fn begin_retry(
        &self,
        id: DeadLetterId,
        reclaim_after: Duration,
    ) -> StoreFuture<'_, Option<DeadLetterEntry>>;

    /// RETRYING -> RESOLVED.
    fn complete_retry(&self, id: DeadLetterId) -> StoreFuture<'_, Option<DeadLetterEntry>>;

    /// RETRYING -> PENDING with `retry_count + 1`, or ABANDONED once the
    /// incremented count reaches `max_retries`.
    fn fail_retry(
        &self,
        id: DeadLetterId,
        max_retries: i32,
    ) -> StoreFuture<'_, Option<DeadLetterEntry>>;

    /// Unconditionally RESOLVED.
    fn resolve(&self, id: DeadLetterId) -> StoreFuture<'_, Option<DeadLetterEntry>>;

    /// Unconditionally ABANDONED.
    fn abandon(&self, id: DeadLetterId) -> StoreFuture<'_, Option<DeadLetterEntry>>;
}

/// Append-only delivery audit trail.
pub trait DeliveryAttemptStore: Send + Sync + 'static {
    /// Appends an attempt.
    fn record(&self, attempt: NewDeliveryAttempt) -> StoreFuture<'_, DeliveryAttempt>;

    /// Attempts for an event ordered by attempt number, then start time.
    fn list_for_event(&self, event_id: EventId) -> StoreFuture<'_, Vec<DeliveryAttempt>>;
}

/// Container for all stores, shared by handlers and workers.
#[derive(Clone)]
pub struct Storage {
    /// Event queue.
    pub events: Arc<dyn EventStore>,
    /// Idempotency keys.
    pub idempotency_keys: Arc<dyn IdempotencyStore>,
    /// Dead-letter queue.
    pub dead_letters: Arc<dyn DeadLetterStore>,
    /// Delivery audit trail.
    pub delivery_attempts: Arc<dyn DeliveryAttemptStore>,
}

impl Storage {
    /// Creates PostgreSQL-backed storage sharing one pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            events: Arc::new(events::Repository::new(pool.clone())),
            idempotency_keys: Arc::new(idempotency_keys::Repository::new(pool.clone())),
            dead_letters: Arc::new(dead_letters::Repository::new(pool.clone())),
            delivery_attempts: Arc::new(delivery_attempts::Repository::new(pool)),
        }
    }

    /// Creates storage backed by one in-memory store.
    pub fn in_memory(store: Arc<memory::MemoryStore>) -> Self {
        Self {
            events: store.clone(),
            idempotency_keys: store.clone(),
            dead_letters: store.clone(),
            delivery_attempts: store,
        }
    }

    /// Verifies the backend answers a trivial query.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the backend is unreachable.
    pub async fn health_check(&self) -> Result<()> {
        self.events.ping().await
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").finish_non_exhaustive()
    }
}

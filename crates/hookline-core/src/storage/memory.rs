//! In-memory implementation of every store trait.
//!
//! All state sits behind one async mutex, so each trait method is atomic in
//! the same sense as the single-statement PostgreSQL implementations. Time
//! comes from the injected [`Clock`], which lets tests age claims and
//! idempotency locks without sleeping.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use tokio::sync::Mutex;

use super::{
    DeadLetterStore, DeliveryAttemptStore, EventStore, IdempotencyStore, StoreFuture,
};
use crate::{
    error::{CoreError, Result},
    ledger::FailureLedger,
    models::{
        DeadLetterEntry, DeadLetterId, DeadLetterStatus, DeliveryAttempt, DeliveryAttemptId,
        Event, EventId, EventInsert, EventStatus, IdempotencyRecord, IdempotencyStatus,
        NewDeadLetter, NewDeliveryAttempt, NewEvent,
    },
    time::{Clock, RealClock},
};

#[derive(Default)]
struct State {
    events: Vec<Event>,
    keys: HashMap<String, IdempotencyRecord>,
    dead_letters: Vec<DeadLetterEntry>,
    attempts: Vec<DeliveryAttempt>,
}

/// Process-local store with the same guarded-transition semantics as the
/// PostgreSQL repositories.
pub struct MemoryStore {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    /// Creates an empty store on the real clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(RealClock::new()))
    }

    /// Creates an empty store stamping records with `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { state: Mutex::new(State::default()), clock, unavailable: AtomicBool::new(false) }
    }

    /// Makes every subsequent operation fail with a database error until
    /// switched back. Used to exercise persistence-failure paths.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }

    /// Number of recorded delivery attempts across all events.
    pub async fn attempt_count(&self) -> usize {
        self.state.lock().await.attempts.len()
    }

    /// Number of dead-letter entries in any status.
    pub async fn dead_letter_count(&self) -> usize {
        self.state.lock().await.dead_letters.len()
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::Acquire) {
            return Err(CoreError::Database("in-memory store marked unavailable".into()));
        }
        Ok(())
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now_utc()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn older_than(stamp: Option<DateTime<Utc>>, now: DateTime<Utc>, age: Duration) -> bool {
    let age = chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::weeks(5200));
    stamp.is_some_and(|at| at < now - age)
}

impl EventStore for MemoryStore {
    fn insert(&self, event: NewEvent) -> StoreFuture<'_, EventInsert> {
        Box::pin(async move {
            self.check()?;
            let mut state = self.state.lock().await;

            if let Some(existing) =
                state.events.iter().find(|e| e.idempotency_key == event.idempotency_key)
            {
                return Ok(EventInsert { event: existing.clone(), created: false });
            }

            let stored = Event {
                id: EventId::new(),
                status: EventStatus::Received,
                payload: Json(event.payload),
                idempotency_key: event.idempotency_key,
                destination_url: event.destination_url,
                locked_at: None,
                locked_by: None,
                error_details: None,
                created_at: self.now(),
                delivered_at: None,
                failed_at: None,
            };
            state.events.push(stored.clone());

            Ok(EventInsert { event: stored, created: true })
        })
    }

    fn claim_next(&self, worker_id: String, stale_after: Duration) -> StoreFuture<'_, Option<Event>> {
        Box::pin(async move {
            self.check()?;
            let now = self.now();
            let mut state = self.state.lock().await;

            let candidate = state
                .events
                .iter_mut()
                .filter(|e| match e.status {
                    EventStatus::Received => true,
                    EventStatus::Processing => older_than(e.locked_at, now, stale_after),
                    EventStatus::Delivered | EventStatus::Failed => false,
                })
                .min_by_key(|e| e.created_at);

            Ok(candidate.map(|event| {
                event.status = EventStatus::Processing;
                event.locked_at = Some(now);
                event.locked_by = Some(worker_id);
                event.clone()
            }))
        })
    }

    fn mark_delivered(&self, id: EventId, worker_id: String) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            self.check()?;
            let now = self.now();
            let mut state = self.state.lock().await;

            let Some(event) = state.events.iter_mut().find(|e| {
                e.id == id
                    && e.status == EventStatus::Processing
                    && e.locked_by.as_deref() == Some(worker_id.as_str())
            }) else {
                return Ok(false);
            };

            event.status = EventStatus::Delivered;
            event.delivered_at = Some(now);
            event.locked_at = None;
            event.locked_by = None;
            Ok(true)
        })
    }

    fn mark_failed(
        &self,
        id: EventId,
        worker_id: String,
        ledger: FailureLedger,
    ) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            self.check()?;
            let now = self.now();
            let mut state = self.state.lock().await;

            let Some(event) = state.events.iter_mut().find(|e| {
                e.id == id
                    && e.status == EventStatus::Processing
                    && e.locked_by.as_deref() == Some(worker_id.as_str())
            }) else {
                return Ok(false);
            };

            event.status = EventStatus::Failed;
            event.error_details = Some(Json(ledger));
            event.failed_at = Some(now);
            event.locked_at = None;
            event.locked_by = None;
            Ok(true)
        })
    }

    fn find_by_id(&self, id: EventId) -> StoreFuture<'_, Option<Event>> {
        Box::pin(async move {
            self.check()?;
            let state = self.state.lock().await;
            Ok(state.events.iter().find(|e| e.id == id).cloned())
        })
    }

    fn list(&self, limit: i64, offset: i64) -> StoreFuture<'_, Vec<Event>> {
        Box::pin(async move {
            self.check()?;
            let state = self.state.lock().await;
            let skip = usize::try_from(offset.max(0)).unwrap_or(usize::MAX);
            let take = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);

            // Insertion order breaks ties between identical timestamps.
            let mut events: Vec<Event> = state.events.iter().rev().cloned().collect();
            events.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(events.into_iter().skip(skip).take(take).collect())
        })
    }

    fn ping(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move { self.check() })
    }
}

impl IdempotencyStore for MemoryStore {
    fn insert_processing(&self, key: String, request_hash: String) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            self.check()?;
            let now = self.now();
            let mut state = self.state.lock().await;

            if state.keys.contains_key(&key) {
                return Ok(false);
            }

            state.keys.insert(key.clone(), IdempotencyRecord {
                key,
                request_hash,
                status: IdempotencyStatus::Processing,
                response_status: None,
                response_body: None,
                locked_at: now,
                created_at: now,
                updated_at: now,
            });
            Ok(true)
        })
    }

    fn find(&self, key: String) -> StoreFuture<'_, Option<IdempotencyRecord>> {
        Box::pin(async move {
            self.check()?;
            Ok(self.state.lock().await.keys.get(&key).cloned())
        })
    }

    fn reclaim_stale(&self, key: String, lock_timeout: Duration) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            self.check()?;
            let now = self.now();
            let mut state = self.state.lock().await;

            match state.keys.get_mut(&key) {
                Some(record)
                    if record.status == IdempotencyStatus::Processing
                        && older_than(Some(record.locked_at), now, lock_timeout) =>
                {
                    record.locked_at = now;
                    record.updated_at = now;
                    Ok(true)
                },
                _ => Ok(false),
            }
        })
    }

    fn finalize(
        &self,
        key: String,
        status: IdempotencyStatus,
        response_status: i32,
        response_body: Value,
    ) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            self.check()?;
            let now = self.now();
            let mut state = self.state.lock().await;

            match state.keys.get_mut(&key) {
                Some(record) if record.status == IdempotencyStatus::Processing => {
                    record.status = status;
                    record.response_status = Some(response_status);
                    record.response_body = Some(Json(response_body));
                    record.updated_at = now;
                    Ok(true)
                },
                _ => Ok(false),
            }
        })
    }
}

impl MemoryStore {
    async fn update_dead_letter<F>(
        &self,
        id: DeadLetterId,
        apply: F,
    ) -> Result<Option<DeadLetterEntry>>
    where
        F: FnOnce(&mut DeadLetterEntry, DateTime<Utc>) -> bool + Send,
    {
        self.check()?;
        let now = self.now();
        let mut state = self.state.lock().await;

        Ok(state
            .dead_letters
            .iter_mut()
            .find(|entry| entry.id == id)
            .and_then(|entry| apply(entry, now).then(|| entry.clone())))
    }
}

impl DeadLetterStore for MemoryStore {
    fn insert(&self, entry: NewDeadLetter) -> StoreFuture<'_, DeadLetterEntry> {
        Box::pin(async move {
            self.check()?;
            let now = self.now();
            let mut state = self.state.lock().await;

            if let Some(existing) =
                state.dead_letters.iter().find(|e| e.original_event_id == entry.original_event_id)
            {
                return Ok(existing.clone());
            }

            let stored = DeadLetterEntry {
                id: DeadLetterId::new(),
                original_event_id: entry.original_event_id,
                idempotency_key: entry.idempotency_key,
                payload: Json(entry.payload),
                error_details: Json(entry.error_details),
                status: DeadLetterStatus::Pending,
                retry_count: 0,
                failed_at: now,
                retry_started_at: None,
                resolved_at: None,
            };
            state.dead_letters.push(stored.clone());
            Ok(stored)
        })
    }

    fn find_by_id(&self, id: DeadLetterId) -> StoreFuture<'_, Option<DeadLetterEntry>> {
        Box::pin(self.update_dead_letter(id, |_, _| true))
    }

    fn find_by_event(&self, event_id: EventId) -> StoreFuture<'_, Option<DeadLetterEntry>> {
        Box::pin(async move {
            self.check()?;
            let state = self.state.lock().await;
            Ok(state.dead_letters.iter().find(|e| e.original_event_id == event_id).cloned())
        })
    }

    fn list_pending(&self) -> StoreFuture<'_, Vec<DeadLetterEntry>> {
        Box::pin(async move {
            self.check()?;
            let state = self.state.lock().await;
            let mut pending: Vec<DeadLetterEntry> = state
                .dead_letters
                .iter()
                .filter(|e| e.status == DeadLetterStatus::Pending)
                .cloned()
                .collect();
            pending.sort_by_key(|e| e.failed_at);
            Ok(pending)
        })
    }

    fn begin_retry(
        &self,
        id: DeadLetterId,
        reclaim_after: Duration,
    ) -> StoreFuture<'_, Option<DeadLetterEntry>> {
        Box::pin(self.update_dead_letter(id, move |entry, now| {
            let stale = entry.status == DeadLetterStatus::Retrying
                && older_than(entry.retry_started_at, now, reclaim_after);
            if entry.status != DeadLetterStatus::Pending && !stale {
                return false;
            }
            entry.status = DeadLetterStatus::Retrying;
            entry.retry_started_at = Some(now);
            true
        }))
    }

    fn complete_retry(&self, id: DeadLetterId) -> StoreFuture<'_, Option<DeadLetterEntry>> {
        Box::pin(self.update_dead_letter(id, |entry, now| {
            if entry.status != DeadLetterStatus::Retrying {
                return false;
            }
            entry.status = DeadLetterStatus::Resolved;
            entry.resolved_at = Some(now);
            true
        }))
    }

    fn fail_retry(
        &self,
        id: DeadLetterId,
        max_retries: i32,
    ) -> StoreFuture<'_, Option<DeadLetterEntry>> {
        Box::pin(self.update_dead_letter(id, move |entry, now| {
            if entry.status != DeadLetterStatus::Retrying {
                return false;
            }
            entry.retry_count += 1;
            if entry.retry_count >= max_retries {
                entry.status = DeadLetterStatus::Abandoned;
                entry.resolved_at = Some(now);
            } else {
                entry.status = DeadLetterStatus::Pending;
            }
            true
        }))
    }

    fn resolve(&self, id: DeadLetterId) -> StoreFuture<'_, Option<DeadLetterEntry>> {
        Box::pin(self.update_dead_letter(id, |entry, now| {
            entry.status = DeadLetterStatus::Resolved;
            entry.resolved_at = Some(now);
            true
        }))
    }

    fn abandon(&self, id: DeadLetterId) -> StoreFuture<'_, Option<DeadLetterEntry>> {
        Box::pin(self.update_dead_letter(id, |entry, now| {
            entry.status = DeadLetterStatus::Abandoned;
            entry.resolved_at = Some(now);
            true
        }))
    }
}

impl DeliveryAttemptStore for MemoryStore {
    fn record(&self, attempt: NewDeliveryAttempt) -> StoreFuture<'_, DeliveryAttempt> {
        Box::pin(async move {
            self.check()?;
            let stored = DeliveryAttempt {
                id: DeliveryAttemptId::new(),
                event_id: attempt.event_id,
                attempt_number: attempt.attempt_number,
                destination_url: attempt.destination_url,
                request_headers: Json(attempt.request_headers),
                request_body: Json(attempt.request_body),
                status_code: attempt.status_code,
                response_body: attempt.response_body,
                error_message: attempt.error_message,
                started_at: attempt.started_at,
                completed_at: attempt.completed_at,
                latency_ms: attempt.latency_ms,
                success: attempt.success,
            };
            self.state.lock().await.attempts.push(stored.clone());
            Ok(stored)
        })
    }

    fn list_for_event(&self, event_id: EventId) -> StoreFuture<'_, Vec<DeliveryAttempt>> {
        Box::pin(async move {
            self.check()?;
            let state = self.state.lock().await;
            let mut attempts: Vec<DeliveryAttempt> =
                state.attempts.iter().filter(|a| a.event_id == event_id).cloned().collect();
            attempts.sort_by(|a, b| {
                a.attempt_number.cmp(&b.attempt_number).then(a.started_at.cmp(&b.started_at))
            });
            Ok(attempts)
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{envelope::EventEnvelope, time::TestClock};

    const RECLAIM: Duration = Duration::from_secs(300);

    fn store() -> (MemoryStore, TestClock) {
        let clock = TestClock::new();
        (MemoryStore::with_clock(Arc::new(clock.clone())), clock)
    }

    fn new_event(key: &str) -> NewEvent {
        NewEvent {
            idempotency_key: key.to_string(),
            destination_url: "http://localhost/hook".to_string(),
            payload: EventEnvelope::wrap(json!({"key": key}), Utc::now()),
        }
    }

    #[tokio::test]
    async fn claims_oldest_received_first() {
        let (store, clock) = store();
        let first = EventStore::insert(&store, new_event("a")).await.unwrap().event;
        clock.advance(Duration::from_secs(1));
        EventStore::insert(&store, new_event("b")).await.unwrap();

        let claimed = store.claim_next("w1".into(), Duration::from_secs(300)).await.unwrap();

        let claimed = claimed.expect("an event should be claimable");
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.status, EventStatus::Processing);
        assert_eq!(claimed.locked_by.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn fresh_claims_are_not_reclaimed_but_stale_ones_are() {
        let (store, clock) = store();
        let event = EventStore::insert(&store, new_event("a")).await.unwrap().event;
        let stale_after = Duration::from_secs(300);

        store.claim_next("w1".into(), stale_after).await.unwrap();
        assert!(store.claim_next("w2".into(), stale_after).await.unwrap().is_none());

        clock.advance(Duration::from_secs(301));
        let reclaimed = store.claim_next("w2".into(), stale_after).await.unwrap().unwrap();
        assert_eq!(reclaimed.id, event.id);
        assert_eq!(reclaimed.locked_by.as_deref(), Some("w2"));

        // The original worker lost its claim and cannot finish the event.
        assert!(!store.mark_delivered(event.id, "w1".into()).await.unwrap());
        assert!(store.mark_delivered(event.id, "w2".into()).await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_key_returns_existing_event() {
        let (store, _) = store();
        let first = EventStore::insert(&store, new_event("k")).await.unwrap();
        let second = EventStore::insert(&store, new_event("k")).await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.event.id, second.event.id);
    }

    #[tokio::test]
    async fn fail_retry_abandons_at_limit() {
        let (store, _) = store();
        let event = EventStore::insert(&store, new_event("k")).await.unwrap().event;
        let entry = DeadLetterStore::insert(&store, NewDeadLetter {
            original_event_id: event.id,
            idempotency_key: "k".into(),
            payload: event.envelope().clone(),
            error_details: FailureLedger::default(),
        })
        .await
        .unwrap();

        for expected in 1..=3 {
            store.begin_retry(entry.id, RECLAIM).await.unwrap().unwrap();
            let after = store.fail_retry(entry.id, 3).await.unwrap().unwrap();
            assert_eq!(after.retry_count, expected);
        }

        let last = DeadLetterStore::find_by_id(&store, entry.id).await.unwrap().unwrap();
        assert_eq!(last.status, DeadLetterStatus::Abandoned);
        assert!(last.resolved_at.is_some());
        assert!(store.begin_retry(entry.id, RECLAIM).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn interrupted_retry_is_reclaimable_after_window() {
        let (store, clock) = store();
        let event = EventStore::insert(&store, new_event("k")).await.unwrap().event;
        let entry = DeadLetterStore::insert(&store, NewDeadLetter {
            original_event_id: event.id,
            idempotency_key: "k".into(),
            payload: event.envelope().clone(),
            error_details: FailureLedger::default(),
        })
        .await
        .unwrap();

        let first = store.begin_retry(entry.id, RECLAIM).await.unwrap().unwrap();
        assert_eq!(first.retry_started_at, Some(clock.now_utc()));
        assert!(store.begin_retry(entry.id, RECLAIM).await.unwrap().is_none());

        clock.advance(RECLAIM + Duration::from_secs(1));
        let again = store.begin_retry(entry.id, RECLAIM).await.unwrap().unwrap();
        assert_eq!(again.status, DeadLetterStatus::Retrying);
        assert_eq!(again.retry_count, 0);
        assert!(again.retry_started_at > first.retry_started_at);
    }

    #[tokio::test]
    async fn unavailable_store_fails_operations() {
        let (store, _) = store();
        store.set_unavailable(true);

        let err = EventStore::insert(&store, new_event("k")).await.unwrap_err();
        assert!(matches!(err, CoreError::Database(_)));
        assert!(store.ping().await.is_err());

        store.set_unavailable(false);
        assert!(store.ping().await.is_ok());
    }
}

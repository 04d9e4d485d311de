//! Integration tests for the store traits.
//!
//! The in-memory tests always run. The PostgreSQL tests exercise the same
//! guarded transitions against a real database and only run with
//! `cargo test -- --ignored` and `DATABASE_URL` pointing at a scratch
//! database.

use std::{collections::HashSet, sync::Arc, time::Duration};

use chrono::Utc;
use hookline_core::{
    models::{NewDeadLetter, NewDeliveryAttempt, NewEvent},
    storage::{
        memory::MemoryStore, migrations, DeadLetterStore, DeliveryAttemptStore, EventStore,
        IdempotencyStore,
    },
    DeadLetterStatus, ErrorCode, EventEnvelope, EventStatus, FailureLedger, IdempotencyStatus,
    Storage, TestClock,
};
use serde_json::json;

const STALE: Duration = Duration::from_secs(300);

fn new_event(key: &str) -> NewEvent {
    NewEvent {
        idempotency_key: key.to_string(),
        destination_url: "https://example.com/hook".to_string(),
        payload: EventEnvelope::wrap(json!({"key": key}), Utc::now()),
    }
}

fn memory_storage() -> (Storage, TestClock) {
    let clock = TestClock::new();
    let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
    (Storage::in_memory(store), clock)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claimers_never_share_an_event() {
    let (storage, _) = memory_storage();
    for i in 0..20 {
        storage.events.insert(new_event(&format!("key-{i}"))).await.unwrap();
    }

    let mut handles = Vec::new();
    for worker in 0..8 {
        let events = storage.events.clone();
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(event) =
                events.claim_next(format!("worker-{worker}"), STALE).await.unwrap()
            {
                claimed.push(event.id);
            }
            claimed
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(seen.insert(id), "event {id} claimed twice");
        }
    }
    assert_eq!(seen.len(), 20);
}

#[tokio::test]
async fn delivered_event_is_never_claimed_again() {
    let (storage, clock) = memory_storage();
    let event = storage.events.insert(new_event("k")).await.unwrap().event;

    storage.events.claim_next("w1".into(), STALE).await.unwrap().unwrap();
    assert!(storage.events.mark_delivered(event.id, "w1".into()).await.unwrap());

    clock.advance(Duration::from_secs(3600));
    assert!(storage.events.claim_next("w2".into(), STALE).await.unwrap().is_none());

    let stored = storage.events.find_by_id(event.id).await.unwrap().unwrap();
    assert_eq!(stored.status, EventStatus::Delivered);
    assert!(stored.delivered_at.is_some());
    assert!(stored.locked_by.is_none());
}

#[tokio::test]
async fn failed_event_keeps_ledger() {
    let (storage, _) = memory_storage();
    let event = storage.events.insert(new_event("k")).await.unwrap().event;
    storage.events.claim_next("w1".into(), STALE).await.unwrap().unwrap();

    let mut ledger = FailureLedger::default();
    ledger.record_failure(1, Utc::now(), "HTTP 500", ErrorCode::Status(500));
    assert!(storage.events.mark_failed(event.id, "w1".into(), ledger).await.unwrap());

    let stored = storage.events.find_by_id(event.id).await.unwrap().unwrap();
    assert_eq!(stored.status, EventStatus::Failed);
    assert_eq!(stored.error_details.unwrap().0.len(), 1);
}

#[tokio::test]
async fn events_list_newest_first_with_paging() {
    let (storage, clock) = memory_storage();
    for i in 0..5 {
        storage.events.insert(new_event(&format!("k{i}"))).await.unwrap();
        clock.advance(Duration::from_secs(1));
    }

    let page = storage.events.list(2, 1).await.unwrap();
    let keys: Vec<&str> = page.iter().map(|e| e.idempotency_key.as_str()).collect();
    assert_eq!(keys, vec!["k3", "k2"]);
}

#[tokio::test]
async fn dead_letter_retry_lifecycle() {
    let (storage, _) = memory_storage();
    let event = storage.events.insert(new_event("k")).await.unwrap().event;
    let entry = storage
        .dead_letters
        .insert(NewDeadLetter {
            original_event_id: event.id,
            idempotency_key: "k".into(),
            payload: event.envelope().clone(),
            error_details: FailureLedger::default(),
        })
        .await
        .unwrap();
    assert_eq!(entry.status, DeadLetterStatus::Pending);
    assert_eq!(entry.retry_count, 0);

    // A second insert for the same event returns the first entry.
    let again = storage
        .dead_letters
        .insert(NewDeadLetter {
            original_event_id: event.id,
            idempotency_key: "k".into(),
            payload: event.envelope().clone(),
            error_details: FailureLedger::default(),
        })
        .await
        .unwrap();
    assert_eq!(again.id, entry.id);

    let retrying = storage.dead_letters.begin_retry(entry.id, STALE).await.unwrap().unwrap();
    assert_eq!(retrying.status, DeadLetterStatus::Retrying);
    assert!(storage.dead_letters.begin_retry(entry.id, STALE).await.unwrap().is_none());
    assert!(storage.dead_letters.list_pending().await.unwrap().is_empty());

    let resolved = storage.dead_letters.complete_retry(entry.id).await.unwrap().unwrap();
    assert_eq!(resolved.status, DeadLetterStatus::Resolved);
    assert!(resolved.resolved_at.is_some());
}

#[tokio::test]
async fn idempotency_finalize_happens_once() {
    let (storage, _) = memory_storage();
    let keys = &storage.idempotency_keys;

    assert!(keys.insert_processing("k".into(), "h".into()).await.unwrap());
    assert!(!keys.insert_processing("k".into(), "other".into()).await.unwrap());
    assert!(keys.finalize("k".into(), IdempotencyStatus::Processed, 200, json!({})).await.unwrap());
    assert!(!keys.finalize("k".into(), IdempotencyStatus::Failed, 400, json!({})).await.unwrap());

    let record = keys.find("k".into()).await.unwrap().unwrap();
    assert_eq!(record.status, IdempotencyStatus::Processed);
    assert_eq!(record.request_hash, "h");
}

#[tokio::test]
async fn attempts_are_listed_in_attempt_order() {
    let (storage, _) = memory_storage();
    let event = storage.events.insert(new_event("k")).await.unwrap().event;

    for attempt_number in [2, 1, 3] {
        let now = Utc::now();
        storage
            .delivery_attempts
            .record(NewDeliveryAttempt {
                event_id: event.id,
                attempt_number,
                destination_url: event.destination_url.clone(),
                request_headers: Default::default(),
                request_body: json!({}),
                status_code: Some(500),
                response_body: None,
                error_message: None,
                started_at: now,
                completed_at: now,
                latency_ms: 0,
                success: false,
            })
            .await
            .unwrap();
    }

    let attempts = storage.delivery_attempts.list_for_event(event.id).await.unwrap();
    let numbers: Vec<i32> = attempts.iter().map(|a| a.attempt_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
}

async fn postgres_storage() -> Storage {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for ignored tests");
    let pool = sqlx::PgPool::connect(&url).await.unwrap();
    migrations::run(&pool).await.unwrap();
    Storage::new(pool)
}

fn unique_key(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4().simple())
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn postgres_migrations_are_idempotent() {
    let url = std::env::var("DATABASE_URL").unwrap();
    let pool = sqlx::PgPool::connect(&url).await.unwrap();
    migrations::run(&pool).await.unwrap();
    assert_eq!(migrations::run(&pool).await.unwrap(), 0);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn postgres_event_insert_is_unique_per_key() {
    let storage = postgres_storage().await;
    let key = unique_key("pg-insert");

    let first = storage.events.insert(new_event(&key)).await.unwrap();
    let second = storage.events.insert(new_event(&key)).await.unwrap();

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.event.id, second.event.id);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn postgres_mark_requires_claim_owner() {
    let storage = postgres_storage().await;
    let event = storage.events.insert(new_event(&unique_key("pg-owner"))).await.unwrap().event;

    // Other tests may leave older RECEIVED rows; drain until ours is claimed.
    let worker = unique_key("worker");
    loop {
        let claimed = storage.events.claim_next(worker.clone(), STALE).await.unwrap().unwrap();
        if claimed.id == event.id {
            break;
        }
    }

    assert!(!storage.events.mark_delivered(event.id, "someone-else".into()).await.unwrap());
    assert!(storage.events.mark_delivered(event.id, worker).await.unwrap());
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn postgres_dead_letter_abandons_after_three_failed_retries() {
    let storage = postgres_storage().await;
    let key = unique_key("pg-dlq");
    let event = storage.events.insert(new_event(&key)).await.unwrap().event;
    let entry = storage
        .dead_letters
        .insert(NewDeadLetter {
            original_event_id: event.id,
            idempotency_key: key,
            payload: event.envelope().clone(),
            error_details: FailureLedger::default(),
        })
        .await
        .unwrap();

    for expected in 1..=3 {
        storage.dead_letters.begin_retry(entry.id, STALE).await.unwrap().unwrap();
        let after = storage.dead_letters.fail_retry(entry.id, 3).await.unwrap().unwrap();
        assert_eq!(after.retry_count, expected);
    }

    let last = storage.dead_letters.find_by_id(entry.id).await.unwrap().unwrap();
    assert_eq!(last.status, DeadLetterStatus::Abandoned);
    assert!(storage.dead_letters.begin_retry(entry.id, STALE).await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn postgres_idempotency_reclaim_respects_lock_age() {
    let storage = postgres_storage().await;
    let key = unique_key("pg-idem");

    assert!(storage.idempotency_keys.insert_processing(key.clone(), "h".into()).await.unwrap());
    assert!(!storage
        .idempotency_keys
        .reclaim_stale(key.clone(), Duration::from_secs(60))
        .await
        .unwrap());
    assert!(storage.idempotency_keys.reclaim_stale(key, Duration::ZERO).await.unwrap());
}

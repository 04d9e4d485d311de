//! Idempotency key arbitration for client requests.
//!
//! The unique key column decides which of several racing requests owns a
//! key. Later requests either replay the stored response, learn that the
//! first request is still in flight, or are rejected because they reused the
//! key for a different body. A PROCESSING key whose owner stopped touching it
//! for longer than the lock timeout can be taken over, so a crashed ingress
//! never wedges a key forever.

use std::{sync::Arc, time::Duration};

use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::{
    error::{CoreError, Result},
    models::{IdempotencyRecord, IdempotencyStatus},
    storage::IdempotencyStore,
};

/// Default age after which a PROCESSING key may be reclaimed.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Hex SHA-256 of the JSON serialization of `body`.
///
/// Two bodies that serialize identically hash identically, regardless of
/// whitespace in the original request.
pub fn request_hash(body: &Value) -> String {
    let canonical = serde_json::to_string(body).unwrap_or_default();
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// A response stored against a terminal key and replayed verbatim.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredResponse {
    /// HTTP status code.
    pub status: u16,
    /// JSON body.
    pub body: Value,
}

impl StoredResponse {
    /// The response recorded when a key finishes with `outcome`.
    pub fn for_outcome(outcome: KeyOutcome) -> Self {
        match outcome {
            KeyOutcome::Processed => {
                Self { status: 200, body: json!({"success": true, "action": "PROCESSED"}) }
            },
            KeyOutcome::Failed => {
                Self { status: 400, body: json!({"success": false, "action": "FAILED"}) }
            },
        }
    }
}

/// What the caller should do with a request.
#[derive(Debug, Clone, PartialEq)]
pub enum Acquisition {
    /// The caller owns the key and must eventually mark it.
    Proceed,
    /// The key completed; replay this response.
    ReturnCached(StoredResponse),
    /// Another request holds the key and its lock is still fresh.
    Conflict,
    /// The key was first used with a different body.
    HashMismatch,
    /// The key failed permanently; replay this response.
    Failed(StoredResponse),
}

/// Terminal outcome recorded for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOutcome {
    /// Delivered.
    Processed,
    /// Moved to the dead-letter queue.
    Failed,
}

impl From<KeyOutcome> for IdempotencyStatus {
    fn from(outcome: KeyOutcome) -> Self {
        match outcome {
            KeyOutcome::Processed => Self::Processed,
            KeyOutcome::Failed => Self::Failed,
        }
    }
}

/// Coordinates ownership of idempotency keys.
#[derive(Clone)]
pub struct IdempotencyCoordinator {
    store: Arc<dyn IdempotencyStore>,
    lock_timeout: Duration,
}

impl IdempotencyCoordinator {
    /// Creates a coordinator with the default 60 second lock timeout.
    pub fn new(store: Arc<dyn IdempotencyStore>) -> Self {
        Self { store, lock_timeout: DEFAULT_LOCK_TIMEOUT }
    }

    /// Overrides the age after which a PROCESSING key may be reclaimed.
    #[must_use]
    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// Decides how to handle a request carrying `key` and `body`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` on storage failure and
    /// `CoreError::InvariantViolation` if the key vanished between the
    /// conflicting insert and the lookup, or a terminal key has no stored
    /// response.
    pub async fn acquire(&self, key: &str, body: &Value) -> Result<Acquisition> {
        let hash = request_hash(body);

        if self.store.insert_processing(key.to_string(), hash.clone()).await? {
            debug!(key, "idempotency key acquired");
            return Ok(Acquisition::Proceed);
        }

        let record = self.store.find(key.to_string()).await?.ok_or_else(|| {
            CoreError::InvariantViolation(format!(
                "idempotency key {key} conflicted on insert but could not be loaded"
            ))
        })?;

        if record.request_hash != hash {
            debug!(key, "idempotency key reused with a different body");
            return Ok(Acquisition::HashMismatch);
        }

        match record.status {
            IdempotencyStatus::Processed => Ok(Acquisition::ReturnCached(stored_response(&record)?)),
            IdempotencyStatus::Failed => Ok(Acquisition::Failed(stored_response(&record)?)),
            IdempotencyStatus::Processing => {
                if self.store.reclaim_stale(key.to_string(), self.lock_timeout).await? {
                    warn!(key, "reclaimed stale idempotency lock");
                    Ok(Acquisition::Proceed)
                } else {
                    Ok(Acquisition::Conflict)
                }
            },
        }
    }

    /// Finalizes `key` with [`StoredResponse::for_outcome`] and returns the
    /// response that later requests will replay.
    ///
    /// # Errors
    ///
    /// Same as [`IdempotencyCoordinator::mark`].
    pub async fn complete(&self, outcome: KeyOutcome, key: &str) -> Result<StoredResponse> {
        let response = StoredResponse::for_outcome(outcome);
        self.mark(outcome, key, response.status, response.body.clone()).await?;
        Ok(response)
    }

    /// Records the terminal outcome and the response later requests replay.
    ///
    /// A key that is already terminal is left as it is.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvariantViolation` if the key does not exist and
    /// `CoreError::Database` on storage failure.
    pub async fn mark(
        &self,
        outcome: KeyOutcome,
        key: &str,
        response_status: u16,
        response_body: Value,
    ) -> Result<()> {
        let status = IdempotencyStatus::from(outcome);
        let updated = self
            .store
            .finalize(key.to_string(), status, i32::from(response_status), response_body)
            .await?;
        if updated {
            debug!(key, %status, "idempotency key finalized");
            return Ok(());
        }

        match self.store.find(key.to_string()).await? {
            None => Err(CoreError::InvariantViolation(format!(
                "cannot mark missing idempotency key {key}"
            ))),
            Some(record) => {
                warn!(
                    key,
                    current = %record.status,
                    requested = %status,
                    "idempotency key already terminal, leaving it unchanged"
                );
                Ok(())
            },
        }
    }
}

impl std::fmt::Debug for IdempotencyCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyCoordinator")
            .field("lock_timeout", &self.lock_timeout)
            .finish_non_exhaustive()
    }
}

fn stored_response(record: &IdempotencyRecord) -> Result<StoredResponse> {
    let status = record
        .response_status
        .and_then(|s| u16::try_from(s).ok())
        .ok_or_else(|| {
            CoreError::InvariantViolation(format!(
                "terminal idempotency key {} has no stored status",
                record.key
            ))
        })?;
    let body = record.response_body.as_ref().map(|b| b.0.clone()).unwrap_or(Value::Null);
    Ok(StoredResponse { status, body })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{storage::memory::MemoryStore, time::TestClock};

    fn coordinator() -> (IdempotencyCoordinator, TestClock) {
        let clock = TestClock::new();
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        (IdempotencyCoordinator::new(store), clock)
    }

    #[test]
    fn hash_ignores_source_whitespace() {
        let compact: Value = serde_json::from_str(r#"{"a":1,"b":[1,2]}"#).unwrap();
        let spaced: Value = serde_json::from_str("{ \"a\" : 1, \"b\" : [1, 2] }").unwrap();
        assert_eq!(request_hash(&compact), request_hash(&spaced));
        assert_ne!(request_hash(&compact), request_hash(&json!({"a": 2})));
        assert_eq!(request_hash(&compact).len(), 64);
    }

    #[tokio::test]
    async fn first_request_proceeds_and_second_conflicts() {
        let (coordinator, _) = coordinator();
        let body = json!({"order": 1});

        assert_eq!(coordinator.acquire("k1", &body).await.unwrap(), Acquisition::Proceed);
        assert_eq!(coordinator.acquire("k1", &body).await.unwrap(), Acquisition::Conflict);
    }

    #[tokio::test]
    async fn different_body_is_a_mismatch() {
        let (coordinator, _) = coordinator();
        coordinator.acquire("k1", &json!({"order": 1})).await.unwrap();

        let outcome = coordinator.acquire("k1", &json!({"order": 2})).await.unwrap();
        assert_eq!(outcome, Acquisition::HashMismatch);
    }

    #[tokio::test]
    async fn processed_key_replays_stored_response() {
        let (coordinator, _) = coordinator();
        let body = json!({"order": 1});
        coordinator.acquire("k1", &body).await.unwrap();
        let response = json!({"success": true, "action": "PROCESSED"});
        coordinator.mark(KeyOutcome::Processed, "k1", 200, response.clone()).await.unwrap();

        let outcome = coordinator.acquire("k1", &body).await.unwrap();

        assert_eq!(
            outcome,
            Acquisition::ReturnCached(StoredResponse { status: 200, body: response })
        );
    }

    #[tokio::test]
    async fn failed_key_replays_failure() {
        let (coordinator, _) = coordinator();
        let body = json!({"order": 1});
        coordinator.acquire("k1", &body).await.unwrap();
        coordinator
            .mark(KeyOutcome::Failed, "k1", 400, json!({"success": false, "action": "FAILED"}))
            .await
            .unwrap();

        match coordinator.acquire("k1", &body).await.unwrap() {
            Acquisition::Failed(stored) => assert_eq!(stored.status, 400),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn complete_stores_the_standard_response() {
        let (coordinator, _) = coordinator();
        let body = json!({"order": 1});
        coordinator.acquire("k1", &body).await.unwrap();

        let stored = coordinator.complete(KeyOutcome::Failed, "k1").await.unwrap();
        assert_eq!(stored, StoredResponse::for_outcome(KeyOutcome::Failed));
        assert_eq!(coordinator.acquire("k1", &body).await.unwrap(), Acquisition::Failed(stored));
    }

    #[tokio::test]
    async fn stale_processing_key_is_reclaimed() {
        let (coordinator, clock) = coordinator();
        let body = json!({"order": 1});
        coordinator.acquire("k1", &body).await.unwrap();

        clock.advance(Duration::from_secs(30));
        assert_eq!(coordinator.acquire("k1", &body).await.unwrap(), Acquisition::Conflict);

        clock.advance(Duration::from_secs(31));
        assert_eq!(coordinator.acquire("k1", &body).await.unwrap(), Acquisition::Proceed);

        // Reclaiming re-stamps the lock, so an immediate retry conflicts again.
        assert_eq!(coordinator.acquire("k1", &body).await.unwrap(), Acquisition::Conflict);
    }

    #[tokio::test]
    async fn marking_twice_keeps_first_outcome() {
        let (coordinator, _) = coordinator();
        let body = json!({});
        coordinator.acquire("k1", &body).await.unwrap();
        coordinator.mark(KeyOutcome::Processed, "k1", 200, json!({"first": true})).await.unwrap();
        coordinator.mark(KeyOutcome::Failed, "k1", 400, json!({"second": true})).await.unwrap();

        match coordinator.acquire("k1", &body).await.unwrap() {
            Acquisition::ReturnCached(stored) => assert_eq!(stored.body, json!({"first": true})),
            other => panic!("expected ReturnCached, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn marking_unknown_key_is_an_invariant_violation() {
        let (coordinator, _) = coordinator();
        let err = coordinator.mark(KeyOutcome::Processed, "missing", 200, json!({})).await;
        assert!(matches!(err, Err(CoreError::InvariantViolation(_))));
    }

    #[tokio::test]
    async fn storage_failure_propagates() {
        let clock = TestClock::new();
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock)));
        let coordinator = IdempotencyCoordinator::new(store.clone());
        store.set_unavailable(true);

        let err = coordinator.acquire("k1", &json!({})).await.unwrap_err();
        assert!(err.is_infrastructure());
    }
}

//! Token bucket shared by the dispatchers of one process.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use hookline_core::Clock;
use tracing::trace;

/// Default bucket capacity.
pub const DEFAULT_CAPACITY: u32 = 10;

/// Default refill rate in tokens per second.
pub const DEFAULT_REFILL_PER_SEC: u32 = 10;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Lazily refilled token bucket.
///
/// The bucket starts full. Each [`acquire`](TokenBucket::acquire) refills by
/// the time elapsed since the previous refill, then takes one token or
/// sleeps until one is due. The mutex is released before sleeping.
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
    clock: Arc<dyn Clock>,
}

impl TokenBucket {
    /// Creates a full bucket. A zero capacity or rate is raised to one.
    pub fn new(capacity: u32, refill_per_sec: u32, clock: Arc<dyn Clock>) -> Self {
        let capacity = f64::from(capacity.max(1));
        let state = BucketState { tokens: capacity, last_refill: clock.now() };
        Self {
            capacity,
            refill_per_sec: f64::from(refill_per_sec.max(1)),
            state: Mutex::new(state),
            clock,
        }
    }

    /// Waits until a token is available and takes it.
    pub async fn acquire(&self) {
        loop {
            let wait = match self.try_take() {
                None => return,
                Some(wait) => wait,
            };
            trace!(wait_ms = wait.as_millis(), "rate limited, waiting for token");
            self.clock.sleep(wait).await;
        }
    }

    /// Takes a token if one is available, otherwise returns how long until
    /// the next one is due.
    fn try_take(&self) -> Option<Duration> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut state);

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            return None;
        }

        Some(Duration::from_secs_f64((1.0 - state.tokens) / self.refill_per_sec))
    }

    /// Tokens currently available, after refilling.
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut state);
        state.tokens
    }

    fn refill(&self, state: &mut BucketState) {
        let now = self.clock.now();
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("capacity", &self.capacity)
            .field("refill_per_sec", &self.refill_per_sec)
            .finish_non_exhaustive()
    }
}

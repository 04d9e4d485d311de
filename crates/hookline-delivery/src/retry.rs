//! Bounded retry with linear backoff.
//!
//! A [`RetryEngine`] runs an operation until it succeeds or the retry budget
//! is spent, and returns a [`RetryOutcome`] describing that single execution.
//! Nothing is remembered between executions.

use std::{future::Future, sync::Arc, time::Duration};

use hookline_core::{Clock, FailureLedger, RetryFlag};
use tracing::debug;

use crate::error::DeliveryError;

/// Hard ceiling on retries regardless of configuration.
pub const MAX_RETRIES_CEILING: u32 = 100;

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default backoff step; the nth failure waits `n × step`.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);

/// Result of one retry execution.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// Value of the successful attempt.
    pub value: Option<T>,
    /// Flag and failures. Empty on success.
    pub ledger: FailureLedger,
    /// Number of times the operation ran.
    pub attempts: u32,
}

impl<T> RetryOutcome<T> {
    /// Returns true if an attempt succeeded.
    pub fn succeeded(&self) -> bool {
        self.ledger.flag == RetryFlag::Success
    }
}

/// Runs operations with up to `max_retries` retries.
#[derive(Clone)]
pub struct RetryEngine {
    max_retries: u32,
    base_delay: Duration,
    clock: Arc<dyn Clock>,
}

impl RetryEngine {
    /// Creates an engine. `max_retries` above 100 is clamped.
    pub fn new(max_retries: u32, base_delay: Duration, clock: Arc<dyn Clock>) -> Self {
        Self { max_retries: max_retries.min(MAX_RETRIES_CEILING), base_delay, clock }
    }

    /// Effective retry budget after clamping.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Invokes `operation` with a 1-based attempt number until it succeeds or
    /// `max_retries + 1` attempts have failed.
    ///
    /// The nth failure is followed by a `n × base_delay` sleep on the clock,
    /// except the last one.
    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, DeliveryError>>,
    {
        let mut ledger = FailureLedger::default();
        let mut attempt: u32 = 1;

        loop {
            match operation(attempt).await {
                Ok(value) => {
                    let ledger = FailureLedger { flag: RetryFlag::Success, ..Default::default() };
                    return RetryOutcome { value: Some(value), ledger, attempts: attempt };
                },
                Err(error) => {
                    ledger.record_failure(
                        attempt,
                        self.clock.now_utc(),
                        error.to_string(),
                        error.error_code(),
                    );

                    if attempt > self.max_retries {
                        ledger.flag = RetryFlag::Failure;
                        return RetryOutcome { value: None, ledger, attempts: attempt };
                    }

                    let delay = self.base_delay * attempt;
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %error,
                        "retrying after failure"
                    );
                    self.clock.sleep(delay).await;
                    attempt += 1;
                },
            }
        }
    }
}

impl std::fmt::Debug for RetryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryEngine")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use hookline_core::{ErrorCode, TestClock};

    use super::*;

    fn engine(max_retries: u32) -> (RetryEngine, TestClock) {
        let clock = TestClock::new();
        (RetryEngine::new(max_retries, DEFAULT_BASE_DELAY, Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn always_failing_operation_exhausts_budget() {
        let (engine, clock) = engine(3);
        let calls = AtomicU32::new(0);

        let outcome: RetryOutcome<()> = engine
            .execute(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(DeliveryError::http_status(500, "Internal Server Error")) }
            })
            .await;

        assert!(!outcome.succeeded());
        assert_eq!(outcome.ledger.flag, RetryFlag::Failure);
        assert_eq!(outcome.ledger.len(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(clock.sleeps(), vec![
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(300),
        ]);

        let attempts: Vec<u32> = outcome.ledger.retry_attempts.iter().map(|e| e.attempt).collect();
        assert_eq!(attempts, vec![1, 2, 3, 4]);
        assert_eq!(outcome.ledger.retry_attempts[0].error_code, ErrorCode::Status(500));
        assert_eq!(outcome.ledger.retry_attempts[0].error, "HTTP 500: Internal Server Error");
    }

    #[tokio::test]
    async fn success_after_failure_returns_empty_ledger() {
        let (engine, clock) = engine(3);

        let outcome = engine
            .execute(|attempt| async move {
                if attempt < 2 {
                    Err(DeliveryError::network("connection reset"))
                } else {
                    Ok(attempt)
                }
            })
            .await;

        assert!(outcome.succeeded());
        assert_eq!(outcome.value, Some(2));
        assert_eq!(outcome.attempts, 2);
        assert!(outcome.ledger.is_empty());
        assert_eq!(clock.sleeps(), vec![Duration::from_millis(100)]);
    }

    #[tokio::test]
    async fn zero_retries_runs_once_without_sleeping() {
        let (engine, clock) = engine(0);

        let outcome: RetryOutcome<()> =
            engine.execute(|_| async { Err(DeliveryError::timeout(30)) }).await;

        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.ledger.len(), 1);
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn retry_budget_is_clamped() {
        let (engine, _) = engine(1_000);
        assert_eq!(engine.max_retries(), MAX_RETRIES_CEILING);
    }

    #[tokio::test]
    async fn executions_do_not_share_history() {
        let (engine, _) = engine(1);
        let failing: RetryOutcome<()> =
            engine.execute(|_| async { Err(DeliveryError::network("down")) }).await;
        let passing = engine.execute(|_| async { Ok::<_, DeliveryError>(()) }).await;

        assert_eq!(failing.ledger.len(), 2);
        assert!(passing.ledger.is_empty());
    }
}

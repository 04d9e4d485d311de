//! Delivery engine: spawns dispatchers and stops them gracefully.

use std::{sync::Arc, time::Duration};

use hookline_core::{Clock, IdempotencyCoordinator, Metrics, Storage};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    attempt_log::AttemptLogger,
    client::{ClientConfig, DeliveryClient},
    dead_letter::{DeadLetterManager, DEFAULT_DLQ_MAX_RETRIES},
    dispatcher::{DispatchContext, Dispatcher},
    error::{DeliveryError, Result},
    rate_limit::{TokenBucket, DEFAULT_CAPACITY, DEFAULT_REFILL_PER_SEC},
    retry::{RetryEngine, DEFAULT_BASE_DELAY, DEFAULT_MAX_RETRIES},
};

/// Configuration for the delivery engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Number of concurrent dispatchers.
    pub worker_count: usize,

    /// How long an idle dispatcher waits before polling again.
    pub poll_interval: Duration,

    /// Age after which a PROCESSING claim may be taken over.
    pub claim_stale_after: Duration,

    /// Retries after the first attempt, clamped to 100.
    pub max_retries: u32,

    /// Backoff step between attempts.
    pub retry_base_delay: Duration,

    /// Token bucket capacity.
    pub rate_limit_capacity: u32,

    /// Token bucket refill rate per second.
    pub rate_limit_refill_per_sec: u32,

    /// Failed manual retries before a dead-letter entry is abandoned.
    pub dlq_max_retries: i32,

    /// Lock age after which an idempotency key may be reclaimed.
    pub idempotency_lock_timeout: Duration,

    /// Maximum time to wait for dispatchers on shutdown.
    pub shutdown_grace: Duration,

    /// HTTP client configuration.
    pub client: ClientConfig,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            poll_interval: crate::DEFAULT_POLL_INTERVAL,
            claim_stale_after: crate::DEFAULT_CLAIM_STALE_AFTER,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay: DEFAULT_BASE_DELAY,
            rate_limit_capacity: DEFAULT_CAPACITY,
            rate_limit_refill_per_sec: DEFAULT_REFILL_PER_SEC,
            dlq_max_retries: DEFAULT_DLQ_MAX_RETRIES,
            idempotency_lock_timeout: hookline_core::idempotency::DEFAULT_LOCK_TIMEOUT,
            shutdown_grace: crate::DEFAULT_SHUTDOWN_GRACE,
            client: ClientConfig::default(),
        }
    }
}

/// Runs `worker_count` dispatchers sharing one context.
pub struct DeliveryEngine {
    config: DeliveryConfig,
    context: Arc<DispatchContext>,
    cancellation_token: CancellationToken,
    worker_handles: Vec<JoinHandle<Result<()>>>,
    instance: String,
}

impl DeliveryEngine {
    /// Builds the engine and its shared context.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if the HTTP client cannot be built or the
    /// worker count is zero.
    pub fn new(
        storage: Storage,
        config: DeliveryConfig,
        metrics: Arc<Metrics>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        if config.worker_count == 0 {
            return Err(DeliveryError::configuration("worker_count must be at least 1"));
        }

        let client = Arc::new(DeliveryClient::new(config.client.clone())?);
        let rate_limiter = Arc::new(TokenBucket::new(
            config.rate_limit_capacity,
            config.rate_limit_refill_per_sec,
            clock.clone(),
        ));
        let dead_letters = DeadLetterManager::new(
            storage.dead_letters.clone(),
            storage.events.clone(),
            client.clone(),
        )
        .with_max_retries(config.dlq_max_retries);
        let idempotency = IdempotencyCoordinator::new(storage.idempotency_keys.clone())
            .with_lock_timeout(config.idempotency_lock_timeout);

        let context = Arc::new(DispatchContext {
            retry: RetryEngine::new(config.max_retries, config.retry_base_delay, clock.clone()),
            attempts: AttemptLogger::new(storage.delivery_attempts.clone(), clock.clone()),
            storage,
            client,
            rate_limiter,
            idempotency,
            dead_letters,
            metrics,
            clock,
            poll_interval: config.poll_interval,
            claim_stale_after: config.claim_stale_after,
        });

        let instance = Uuid::new_v4().simple().to_string();
        Ok(Self {
            config,
            context,
            cancellation_token: CancellationToken::new(),
            worker_handles: Vec::new(),
            instance: instance[..8].to_string(),
        })
    }

    /// Dead-letter manager sharing the engine's client and retry budget.
    pub fn dead_letters(&self) -> DeadLetterManager {
        self.context.dead_letters.clone()
    }

    /// Shared dispatch context.
    pub fn context(&self) -> Arc<DispatchContext> {
        self.context.clone()
    }

    /// Creates a dispatcher that is not managed by the engine, for driving
    /// single events from tests and tools.
    pub fn dispatcher(&self, worker_id: impl Into<String>) -> Dispatcher {
        Dispatcher::new(worker_id, self.context.clone(), self.cancellation_token.child_token())
    }

    /// Returns true while spawned dispatchers are still running.
    pub fn has_active_workers(&self) -> bool {
        self.worker_handles.iter().any(|handle| !handle.is_finished())
    }

    /// Spawns the dispatchers and returns immediately.
    pub fn start(&mut self) {
        info!(
            worker_count = self.config.worker_count,
            poll_interval_ms = self.config.poll_interval.as_millis(),
            "starting delivery engine"
        );

        for index in 0..self.config.worker_count {
            let worker_id = format!("worker-{}-{index}", self.instance);
            let dispatcher = Dispatcher::new(
                worker_id.clone(),
                self.context.clone(),
                self.cancellation_token.clone(),
            );

            let handle = tokio::spawn(async move {
                let result = dispatcher.run().await;
                if let Err(ref error) = result {
                    error!(%worker_id, error = %error, "dispatcher terminated with error");
                }
                result
            });
            self.worker_handles.push(handle);
        }

        info!(spawned_workers = self.worker_handles.len(), "delivery engine started");
    }

    /// Signals every dispatcher to stop and waits up to the grace period for
    /// in-flight events to finish.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if the grace period elapses and
    /// `WorkerPanic` if a dispatcher task panicked.
    pub async fn shutdown(mut self) -> Result<()> {
        let grace = self.config.shutdown_grace;
        info!(
            worker_count = self.worker_handles.len(),
            grace_seconds = grace.as_secs(),
            "shutting down delivery engine"
        );

        self.cancellation_token.cancel();
        let handles = std::mem::take(&mut self.worker_handles);

        let join_all = async {
            let mut first_panic = None;
            for (worker_id, handle) in handles.into_iter().enumerate() {
                match handle.await {
                    Ok(Ok(())) => {},
                    Ok(Err(error)) => {
                        warn!(worker_id, error = %error, "dispatcher stopped with error");
                    },
                    Err(join_error) => {
                        error!(worker_id, error = %join_error, "dispatcher task panicked");
                        first_panic.get_or_insert(DeliveryError::WorkerPanic {
                            worker_id,
                            error: join_error.to_string(),
                        });
                    },
                }
            }
            first_panic
        };

        match tokio::time::timeout(grace, join_all).await {
            Ok(None) => {
                info!("delivery engine stopped");
                Ok(())
            },
            Ok(Some(panic)) => Err(panic),
            Err(_elapsed) => {
                error!(
                    grace_seconds = grace.as_secs(),
                    "dispatchers did not stop within the grace period"
                );
                Err(DeliveryError::ShutdownTimeout { timeout: grace })
            },
        }
    }
}

impl Drop for DeliveryEngine {
    fn drop(&mut self) {
        if self.worker_handles.iter().any(|handle| !handle.is_finished()) {
            warn!("delivery engine dropped with running dispatchers, cancelling");
            self.cancellation_token.cancel();
        }
    }
}

impl std::fmt::Debug for DeliveryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryEngine")
            .field("config", &self.config)
            .field("workers", &self.worker_handles.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use hookline_core::{storage::memory::MemoryStore, RealClock};

    use super::*;

    fn engine(config: DeliveryConfig) -> Result<DeliveryEngine> {
        DeliveryEngine::new(
            Storage::in_memory(Arc::new(MemoryStore::new())),
            config,
            Arc::new(Metrics::new()),
            Arc::new(RealClock::new()),
        )
    }

    #[test]
    fn zero_workers_is_rejected() {
        let err = engine(DeliveryConfig { worker_count: 0, ..DeliveryConfig::default() })
            .unwrap_err();
        assert!(matches!(err, DeliveryError::ConfigurationError { .. }));
    }

    #[tokio::test]
    async fn idle_engine_shuts_down_promptly() {
        let mut engine = engine(DeliveryConfig {
            worker_count: 3,
            poll_interval: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(5),
            ..DeliveryConfig::default()
        })
        .unwrap();

        engine.start();
        assert!(engine.has_active_workers());

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn unstarted_engine_shuts_down_immediately() {
        let engine = engine(DeliveryConfig::default()).unwrap();
        assert!(!engine.has_active_workers());
        engine.shutdown().await.unwrap();
    }
}

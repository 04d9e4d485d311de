//! Shared state handed to every handler.

use std::{sync::Arc, time::Instant};

use hookline_core::{Clock, IdempotencyCoordinator, Metrics, Storage};
use hookline_delivery::DeadLetterManager;

use crate::config::ApiConfig;

/// Per-process handles used by the HTTP layer.
#[derive(Clone, Debug)]
pub struct AppState {
    /// All stores.
    pub storage: Storage,
    /// Idempotency arbitration for ingress.
    pub idempotency: IdempotencyCoordinator,
    /// Dead-letter operations for the admin surface.
    pub dead_letters: DeadLetterManager,
    /// Process metrics registry.
    pub metrics: Arc<Metrics>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// Request-time settings.
    pub config: Arc<ApiConfig>,
    /// When the state was built, for uptime reporting.
    pub started_at: Instant,
}

impl AppState {
    /// Builds the state, configuring the idempotency lock timeout from
    /// `config`.
    pub fn new(
        storage: Storage,
        dead_letters: DeadLetterManager,
        metrics: Arc<Metrics>,
        clock: Arc<dyn Clock>,
        config: ApiConfig,
    ) -> Self {
        let idempotency = IdempotencyCoordinator::new(storage.idempotency_keys.clone())
            .with_lock_timeout(config.idempotency_lock_timeout);
        let started_at = clock.now();

        Self {
            storage,
            idempotency,
            dead_letters,
            metrics,
            clock,
            config: Arc::new(config),
            started_at,
        }
    }

    /// Whole seconds since the state was built.
    pub fn uptime_seconds(&self) -> u64 {
        self.clock.now().saturating_duration_since(self.started_at).as_secs()
    }
}

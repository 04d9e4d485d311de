//! Webhook delivery engine with reliability guarantees.
//!
//! This crate turns persisted events into HTTP deliveries. Dispatchers claim
//! events from storage, pace themselves through a shared token bucket, retry
//! failed attempts with linear backoff, and park events that exhaust their
//! retries in the dead-letter queue.
//!
//! # Architecture
//!
//! The engine runs a fixed number of dispatcher tasks. Each handles the
//! complete lifecycle of one event at a time:
//!
//! 1. **Claim** - take the oldest RECEIVED event (or a stale PROCESSING one)
//! 2. **Throttle** - wait for a token from the process-wide bucket
//! 3. **Deliver** - POST the envelope under the retry engine, logging every
//!    attempt to the audit trail
//! 4. **Finish** - mark the event DELIVERED, or dead-letter it and mark it
//!    FAILED, then finalize its idempotency key
//!
//! Claims and every later state change are single guarded statements, so
//! dispatchers in several processes can share one database.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use hookline_core::{Metrics, RealClock, Storage};
//! use hookline_delivery::{DeliveryConfig, DeliveryEngine, DeliveryError};
//! use sqlx::PgPool;
//!
//! # async fn example(pool: PgPool) -> std::result::Result<(), DeliveryError> {
//! let mut engine = DeliveryEngine::new(
//!     Storage::new(pool),
//!     DeliveryConfig::default(),
//!     Arc::new(Metrics::new()),
//!     Arc::new(RealClock::new()),
//! )?;
//!
//! engine.start();
//! // ...
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

pub mod attempt_log;
pub mod client;
pub mod dead_letter;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod rate_limit;
pub mod retry;

pub use client::{ClientConfig, DeliveryClient};
pub use dead_letter::{DeadLetterManager, ManualRetry};
pub use dispatcher::{DispatchContext, DispatchOutcome, Dispatcher};
pub use engine::{DeliveryConfig, DeliveryEngine};
pub use error::{DeliveryError, Result};
pub use rate_limit::TokenBucket;
pub use retry::{RetryEngine, RetryOutcome};

/// Default number of concurrent dispatchers.
pub const DEFAULT_WORKER_COUNT: usize = 1;

/// Default HTTP request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

/// Default idle wait between empty polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default age after which a PROCESSING claim is considered abandoned.
pub const DEFAULT_CLAIM_STALE_AFTER: Duration = Duration::from_secs(300);

/// Default time allowed for dispatchers to finish on shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

//! Clock abstraction so backoff, throttling and lock ageing can run on
//! virtual time in tests.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, TimeZone, Utc};

/// Source of time for components that sleep or stamp records.
///
/// Production code uses [`RealClock`]. Tests inject [`TestClock`], whose
/// `sleep` advances virtual time instead of waiting.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Monotonic instant for measuring elapsed time.
    fn now(&self) -> Instant;

    /// Wall-clock timestamp for persisted records.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Suspends the caller for `duration`.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Clock backed by the operating system and tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Deterministic clock for tests.
///
/// Clones share the same underlying time, so a clock handed to a component
/// can be advanced from the test body. Every call to `sleep` is recorded and
/// can be inspected with [`TestClock::sleeps`].
#[derive(Debug, Clone)]
pub struct TestClock {
    inner: Arc<TestClockInner>,
}

#[derive(Debug)]
struct TestClockInner {
    base_instant: Instant,
    elapsed_ns: AtomicU64,
    wall_ns: AtomicI64,
    sleeps: std::sync::Mutex<Vec<Duration>>,
}

impl TestClock {
    /// Creates a test clock starting at the current wall-clock time.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Creates a test clock whose wall clock starts at `start`.
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(TestClockInner {
                base_instant: Instant::now(),
                elapsed_ns: AtomicU64::new(0),
                wall_ns: AtomicI64::new(start.timestamp_nanos_opt().unwrap_or_default()),
                sleeps: std::sync::Mutex::new(Vec::new()),
            }),
        }
    }

    /// Moves both the monotonic and the wall clock forward.
    pub fn advance(&self, duration: Duration) {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.inner.elapsed_ns.fetch_add(nanos, Ordering::AcqRel);
        self.inner
            .wall_ns
            .fetch_add(i64::try_from(nanos).unwrap_or(i64::MAX), Ordering::AcqRel);
    }

    /// Total virtual time elapsed since the clock was created.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.inner.elapsed_ns.load(Ordering::Acquire))
    }

    /// Durations passed to `sleep`, in call order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.inner.sleeps.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.inner.base_instant + self.elapsed()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc.timestamp_nanos(self.inner.wall_ns.load(Ordering::Acquire))
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        if let Ok(mut sleeps) = self.inner.sleeps.lock() {
            sleeps.push(duration);
        }
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}

//! Clock abstraction for deterministic tests of time-dependent delivery.
//!
//! Workers, ack deadlines and traffic rates all read time through [`Clock`]
//! so tests can drive retry periods and deadlines without real sleeps.

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

/// Clock abstraction for time operations.
///
/// Production code uses `RealClock`, tests inject `TestClock`.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Returns the current instant for duration measurements.
    fn now(&self) -> Instant;

    /// Returns the current wall-clock time for timestamps.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Sleeps for the specified duration.
    ///
    /// In production this maps to `tokio::time::sleep`, in tests this
    /// advances virtual time immediately.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Real clock backed by the system clock and tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock instance.
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

/// Virtual clock for tests.
///
/// Clones share the same time source, so a clock handed to a worker can be
/// advanced or inspected from the test body.
#[derive(Debug, Clone)]
pub struct TestClock {
    /// Monotonic time in nanoseconds since creation
    monotonic_ns: Arc<AtomicU64>,
    /// Wall-clock time as milliseconds since the UNIX epoch
    wall_ms: Arc<AtomicI64>,
    base_instant: Instant,
}

impl TestClock {
    /// Creates a test clock starting at the current time.
    pub fn new() -> Self {
        Self::with_start_time(Utc::now())
    }

    /// Creates a test clock starting at a specific time.
    pub fn with_start_time(start: DateTime<Utc>) -> Self {
        Self {
            monotonic_ns: Arc::new(AtomicU64::new(0)),
            wall_ms: Arc::new(AtomicI64::new(start.timestamp_millis())),
            base_instant: Instant::now(),
        }
    }

    /// Advances both clocks by the specified duration.
    pub fn advance(&self, duration: Duration) {
        let ns = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        let ms = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);

        self.monotonic_ns.fetch_add(ns, Ordering::AcqRel);
        self.wall_ms.fetch_add(ms, Ordering::AcqRel);
    }

    /// Returns virtual time elapsed since the clock was created.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.monotonic_ns.load(Ordering::Acquire))
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.base_instant + self.elapsed()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        let ms = self.wall_ms.load(Ordering::Acquire);
        Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}

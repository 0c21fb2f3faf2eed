//! Clock abstraction for entry timestamps and loop cadences.
//!
//! Stores stamp `updated_time` and `next_available_time` from an injected
//! [`Clock`], and the dispatcher sleeps through it, so tests can move time
//! forward explicitly instead of waiting for claim timeouts or backoffs.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};

/// Source of time for stores and dispatch loops.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Monotonic instant for measuring elapsed time.
    fn now(&self) -> Instant;

    /// Wall-clock time used for entry timestamps.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Suspends the caller for `duration`.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Production clock backed by the system time and the tokio timer.
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

/// Manually driven clock.
///
/// Time only moves through [`TestClock::advance`] or [`Clock::sleep`], which
/// advances by the requested duration and yields once. Clones share the same
/// timeline.
#[derive(Debug, Clone)]
pub struct TestClock {
    offset_ns: Arc<AtomicU64>,
    start_instant: Instant,
    start_utc: DateTime<Utc>,
}

impl TestClock {
    /// Creates a clock starting at the current wall-clock time.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Creates a clock starting at `start`.
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self { offset_ns: Arc::new(AtomicU64::new(0)), start_instant: Instant::now(), start_utc: start }
    }

    /// Moves time forward.
    pub fn advance(&self, duration: Duration) {
        let ns = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.offset_ns.fetch_add(ns, Ordering::AcqRel);
    }

    /// Time elapsed since the clock was created.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.offset_ns.load(Ordering::Acquire))
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.start_instant + self.elapsed()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.elapsed())
            .ok()
            .and_then(|offset| self.start_utc.checked_add_signed(offset))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_moves_both_timelines() {
        let clock = TestClock::new();
        let instant = clock.now();
        let wall = clock.now_utc();

        clock.advance(Duration::from_secs(30));

        assert_eq!(clock.now().duration_since(instant), Duration::from_secs(30));
        assert_eq!(clock.now_utc() - wall, chrono::Duration::seconds(30));
    }

    #[test]
    fn clones_share_a_timeline() {
        let clock = TestClock::new();
        let other = clock.clone();

        other.advance(Duration::from_millis(250));

        assert_eq!(clock.elapsed(), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn sleep_advances_without_waiting() {
        let clock = TestClock::starting_at(DateTime::<Utc>::UNIX_EPOCH);
        let started = Instant::now();

        clock.sleep(Duration::from_secs(3600)).await;

        assert_eq!(clock.now_utc(), DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::hours(1));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}

//! Clock seam (spec §9: "Use a single monotonic clock source and expose it
//! behind a seam so tests can inject a fake clock; both SequenceController
//! and TriggerEngine are tested with simulated time").
//!
//! `SystemClock` is what production code uses; it is a thin wrapper over
//! `tokio::time`, which is itself fake-able in tests via
//! `tokio::time::pause()`/`advance()`. `ManualClock` exists for pure,
//! non-async unit tests of scheduling arithmetic that don't want to spin up
//! a runtime at all.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// A monotonic + wall-clock time source, injectable for tests.
pub trait Clock: Send + Sync {
    /// Current wall-clock time, used for `DateTime<Utc>` timestamps that are
    /// reported to clients (history samples, `lastFiredAt`, etc).
    fn now(&self) -> DateTime<Utc>;

    /// Milliseconds elapsed since this clock was created. Used for all
    /// scheduling arithmetic so tests can run without real sleeps.
    fn monotonic_ms(&self) -> i64;
}

/// Production clock: wall time from `chrono::Utc::now`, monotonic time from
/// `tokio::time::Instant`, which respects `tokio::time::pause`/`advance` in
/// `#[tokio::test(start_paused = true)]` tests.
#[derive(Debug, Default)]
pub struct SystemClock {
    origin: once_cell::sync::OnceCell<tokio::time::Instant>,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: once_cell::sync::OnceCell::new(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic_ms(&self) -> i64 {
        let origin = self.origin.get_or_init(tokio::time::Instant::now);
        tokio::time::Instant::now()
            .saturating_duration_since(*origin)
            .as_millis() as i64
    }
}

/// A clock tests can advance by hand, with no relation to wall time or any
/// async runtime. Useful for unit-testing pure scheduling math.
pub struct ManualClock {
    millis: AtomicI64,
    epoch: DateTime<Utc>,
}

impl ManualClock {
    pub fn new(epoch: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(0),
            epoch,
        }
    }

    pub fn advance(&self, by: Duration) {
        self.millis.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.epoch + chrono::Duration::milliseconds(self.millis.load(Ordering::SeqCst))
    }

    fn monotonic_ms(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_wall_and_monotonic_together() {
        let clock = ManualClock::new(Utc::now());
        let t0 = clock.now();
        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.monotonic_ms(), 250);
        assert_eq!((clock.now() - t0).num_milliseconds(), 250);
    }
}

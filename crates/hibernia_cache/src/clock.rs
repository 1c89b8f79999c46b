//! Clocks and cache timestamps.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A source of wall-clock milliseconds.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Returns milliseconds since the Unix epoch.
    fn now_millis(&self) -> u64;
}

/// The system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    /// Creates a clock reading `millis`.
    #[must_use]
    pub fn new(millis: u64) -> Self {
        Self {
            millis: AtomicU64::new(millis),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        self.millis.fetch_add(duration_millis(by), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

pub(crate) fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Issues strictly increasing cache timestamps.
///
/// A timestamp is the wall-clock millisecond shifted left by 12 bits plus a
/// counter, so up to 4096 timestamps per millisecond stay ordered.
#[derive(Debug)]
pub struct Timestamper {
    clock: Arc<dyn Clock>,
    last: AtomicU64,
}

impl Timestamper {
    const SHIFT: u32 = 12;

    /// Creates a timestamper reading `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            last: AtomicU64::new(0),
        }
    }

    /// Returns the next timestamp.
    pub fn next(&self) -> u64 {
        let base = self.clock.now_millis() << Self::SHIFT;
        let mut prev = self.last.load(Ordering::SeqCst);
        loop {
            let candidate = base.max(prev + 1);
            match self
                .last
                .compare_exchange(prev, candidate, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return candidate,
                Err(actual) => prev = actual,
            }
        }
    }

    /// Converts a duration to timestamp units.
    #[must_use]
    pub fn span(d: Duration) -> u64 {
        duration_millis(d) << Self::SHIFT
    }

    /// Returns the underlying clock.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_strictly_increase_within_a_millisecond() {
        let ts = Timestamper::new(Arc::new(ManualClock::new(10)));
        let a = ts.next();
        let b = ts.next();
        assert!(b > a);
        assert_eq!(a, 10 << 12);
    }

    #[test]
    fn timestamps_follow_the_clock() {
        let clock = Arc::new(ManualClock::new(10));
        let ts = Timestamper::new(clock.clone());
        let a = ts.next();
        clock.advance(Duration::from_millis(5));
        let b = ts.next();
        assert_eq!(b, 15 << 12);
        assert!(b - a >= Timestamper::span(Duration::from_millis(5)) - 1);
    }

    #[test]
    fn system_clock_is_after_epoch() {
        assert!(SystemClock.now_millis() > 0);
    }
}

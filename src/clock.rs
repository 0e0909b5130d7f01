//! Time sources for admission decisions.
//!
//! Both algorithms read the current time on the calling instance and pass it
//! to the store as a script argument, so every instance sharing a store must
//! keep its wall clock reasonably in sync.

use std::fmt::Debug;
use std::time::Duration;

use parking_lot::Mutex;

/// A source of wall-clock time, measured from the Unix epoch.
pub trait Clock: Send + Sync + Debug {
    /// Time elapsed since the Unix epoch.
    fn now(&self) -> Duration;

    /// Current time in fractional seconds.
    fn now_secs(&self) -> f64 {
        self.now().as_secs_f64()
    }

    /// Current time in whole milliseconds.
    fn now_millis(&self) -> i64 {
        self.now().as_millis() as i64
    }

    /// Current time in whole nanoseconds.
    fn now_nanos(&self) -> i64 {
        self.now().as_nanos() as i64
    }
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        let micros = chrono::Utc::now().timestamp_micros();
        Duration::from_micros(micros.max(0) as u64)
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Duration>,
}

impl ManualClock {
    /// Create a clock frozen at `start` since the epoch.
    pub fn new(start: Duration) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Create a clock frozen at the current system time.
    pub fn starting_now() -> Self {
        Self::new(SystemClock.now())
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    /// Jump to an absolute time, possibly backwards.
    pub fn set(&self, to: Duration) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(Duration::from_secs(1_000));
        assert_eq!(clock.now_millis(), 1_000_000);

        clock.advance(Duration::from_millis(1_500));
        assert_eq!(clock.now_millis(), 1_001_500);
        assert!((clock.now_secs() - 1_001.5).abs() < 1e-9);

        clock.advance(Duration::from_nanos(7));
        assert_eq!(clock.now_nanos(), 1_001_500_000_007);
    }

    #[test]
    fn test_manual_clock_set() {
        let clock = ManualClock::new(Duration::from_secs(10));
        clock.set(Duration::from_secs(5));
        assert_eq!(clock.now(), Duration::from_secs(5));
    }

    #[test]
    fn test_system_clock_is_after_2020() {
        // 2020-01-01T00:00:00Z
        assert!(SystemClock.now() > Duration::from_secs(1_577_836_800));
    }
}

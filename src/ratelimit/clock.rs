//! Time sources for admission timestamps.
//!
//! Timestamps are fractional seconds. Buckets live in a store shared by many
//! processes, so the production clock is wall time since the Unix epoch
//! rather than a per-process monotonic instant.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

/// Source of the "now" captured once per admission check.
pub trait Clock: Send + Sync + Debug {
    /// Current time in seconds.
    fn now(&self) -> f64;
}

/// Wall clock in seconds since the Unix epoch, microsecond resolution.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
    }
}

/// Manually driven clock.
///
/// Clones share the same time, so a test can hand one clone to a limiter and
/// advance another.
#[derive(Debug, Clone)]
pub struct ManualClock {
    current: Arc<Mutex<f64>>,
}

impl ManualClock {
    /// Create a clock reading `start` seconds.
    pub fn new(start: f64) -> Self {
        Self {
            current: Arc::new(Mutex::new(start)),
        }
    }

    /// Advance the clock by a duration.
    pub fn advance(&self, duration: Duration) {
        *self.current.lock() += duration.as_secs_f64();
    }

    /// Set the clock to an absolute reading.
    pub fn set(&self, now: f64) {
        *self.current.lock() = now;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.current.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock() {
        let clock = SystemClock::new();
        let t1 = clock.now();
        std::thread::sleep(Duration::from_millis(10));
        let t2 = clock.now();

        assert!(t2 > t1);
        // Sanity: after 2020-01-01
        assert!(t1 > 1_577_836_800.0);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(100.0);
        assert_eq!(clock.now(), 100.0);

        clock.advance(Duration::from_millis(2500));
        assert_eq!(clock.now(), 102.5);

        clock.set(7.0);
        assert_eq!(clock.now(), 7.0);
    }

    #[test]
    fn test_manual_clock_clones_share_time() {
        let clock = ManualClock::new(0.0);
        let other = clock.clone();

        let handle = std::thread::spawn(move || other.advance(Duration::from_secs(5)));
        handle.join().unwrap();

        assert_eq!(clock.now(), 5.0);
    }
}

//! # Time Sources
//!
//! Event timestamps and lease expiry both need "now". Injecting it through
//! the [`Clock`] trait keeps lease tests deterministic: they advance a
//! [`ManualClock`] instead of sleeping for ten seconds.
//!
//! ## Implementations
//!
//! | Clock | Use |
//! |-------|-----|
//! | [`SystemClock`] | wall clock, no guarantees |
//! | [`MonotonicClock`] | wall clock, never goes backwards within the process (default) |
//! | [`ManualClock`] | tests |

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A source of Unix-millisecond timestamps.
pub trait Clock: Send + Sync + Debug {
    /// Returns the current time in milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;
}

/// Reads the system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Wall clock clamped so it never returns a value below one it already
/// returned. NTP corrections would otherwise let a later event carry an
/// earlier timestamp.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: AtomicU64,
}

impl MonotonicClock {
    /// Creates a new monotonic clock.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        let wall = SystemClock.now_ms();
        let previous = self.last.fetch_max(wall, Ordering::AcqRel);
        previous.max(wall)
    }
}

/// A clock that only moves when told to.
///
/// Cloning shares the underlying time, so a test can keep one handle and
/// give another to the component under test.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    /// Creates a clock stopped at `start_ms`.
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::AcqRel);
    }

    /// Sets the clock to an absolute value.
    pub fn set(&self, now_ms: u64) {
        self.now.store(now_ms, Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_clock_never_goes_back() {
        let clock = MonotonicClock::new();
        let mut previous = 0;
        for _ in 0..1000 {
            let now = clock.now_ms();
            assert!(now >= previous);
            previous = now;
        }
    }

    #[test]
    fn test_manual_clock_shared_between_clones() {
        let clock = ManualClock::new(1_000);
        let other = clock.clone();

        clock.advance(Duration::from_secs(2));
        assert_eq!(other.now_ms(), 3_000);

        other.set(10);
        assert_eq!(clock.now_ms(), 10);
    }
}

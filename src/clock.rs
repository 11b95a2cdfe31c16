//! Monotonic and wall-clock time as an injected dependency.
//!
//! Every component that reasons about elapsed time (slow-client detection, queue
//! aging, canary evaluation windows, bandit flush intervals) takes a `Arc<dyn Clock>`
//! rather than calling `Instant::now()`/`Utc::now()` directly, so tests can advance
//! time deterministically instead of sleeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};

/// Time source used by the router and realtime pipeline.
pub trait Clock: Send + Sync {
    /// Milliseconds on a monotonic clock. Not comparable across processes.
    fn now_monotonic_ms(&self) -> u64;

    /// Current wall-clock time.
    fn now_utc(&self) -> DateTime<Utc>;
}

/// Real clock backed by `std::time`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock {
    start: std::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now_monotonic_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock double for tests: advances only when told to.
pub struct TestClock {
    monotonic_ms: AtomicU64,
    epoch_ms: AtomicU64,
}

impl TestClock {
    pub fn new() -> Arc<Self> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Arc::new(Self {
            monotonic_ms: AtomicU64::new(0),
            epoch_ms: AtomicU64::new(now),
        })
    }

    pub fn advance(&self, ms: u64) {
        self.monotonic_ms.fetch_add(ms, Ordering::SeqCst);
        self.epoch_ms.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now_monotonic_ms(&self) -> u64 {
        self.monotonic_ms.load(Ordering::SeqCst)
    }

    fn now_utc(&self) -> DateTime<Utc> {
        let ms = self.epoch_ms.load(Ordering::SeqCst) as i64;
        DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_advances_only_on_command() {
        let clock = TestClock::new();
        assert_eq!(clock.now_monotonic_ms(), 0);
        clock.advance(1_100);
        assert_eq!(clock.now_monotonic_ms(), 1_100);
        clock.advance(50);
        assert_eq!(clock.now_monotonic_ms(), 1_150);
    }

    #[test]
    fn system_clock_is_monotonic_nondecreasing() {
        let clock = SystemClock::new();
        let a = clock.now_monotonic_ms();
        let b = clock.now_monotonic_ms();
        assert!(b >= a);
    }
}

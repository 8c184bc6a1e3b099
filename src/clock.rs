//! Wall-clock source for entry timestamps.
//!
//! Entry expiry is persisted to disk and shared with remote stores, so it is
//! expressed in unix milliseconds rather than `Instant`. The clock is
//! injectable so TTL behavior can be tested without sleeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Unix time in milliseconds.
pub type UnixMillis = u64;

/// A source of the current wall-clock time.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_millis(&self) -> UnixMillis;
}

/// The system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> UnixMillis {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// A manually advanced clock for tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: UnixMillis) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, to: UnixMillis) {
        self.now.store(to, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> UnixMillis {
        self.now.load(Ordering::SeqCst)
    }
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// The default shared clock.
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

/// Upper bound for timer deadlines; longer timeouts are treated as this.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `from + by`, saturating instead of overflowing.
pub fn instant_after(from: tokio::time::Instant, by: Duration) -> tokio::time::Instant {
    from.checked_add(by.min(FAR_FUTURE)).unwrap_or(from)
}

/// The tokio instant `timeout` from now.
pub fn deadline_after(timeout: Duration) -> tokio::time::Instant {
    instant_after(tokio::time::Instant::now(), timeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(1_000);
        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now_millis(), 1_250);
        clock.set(10);
        assert_eq!(clock.now_millis(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_after_saturates() {
        let now = tokio::time::Instant::now();
        assert_eq!(deadline_after(Duration::from_millis(250)), now + Duration::from_millis(250));
        let far = deadline_after(Duration::MAX);
        assert!(far > now + Duration::from_secs(86_400 * 365));
        assert!(far >= deadline_after(Duration::from_secs(u64::MAX / 2)));
    }

    #[test]
    fn test_system_clock_is_after_epoch() {
        assert!(SystemClock.now_millis() > 0);
    }
}

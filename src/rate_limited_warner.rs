//! Rate-limited warnings for dropped shuffle bytes.
//!
//! A poisoned writer discards incoming data on purpose, and a busy mapper
//! can push thousands of buffers per second at it. [`RateLimitedWarner`]
//! aggregates the discarded byte count and emits one warning per interval
//! instead of one per write.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Source of time for [`RateLimitedWarner`].
pub trait Clock: Send + Sync {
    /// Current time in milliseconds since an arbitrary epoch.
    fn now_millis(&self) -> u64;
}

/// [`Clock`] implementation backed by [`Instant`].
struct RealClock {
    start: Instant,
}

impl Default for RealClock {
    fn default() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Clock for RealClock {
    fn now_millis(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// How often to warn about discarded bytes by default.
pub const DEFAULT_WARN_INTERVAL: Duration = Duration::from_secs(5);

/// Helper that rate limits dropped-byte warnings.
///
/// Callers add to the counter via [`record_dropped`]; the next
/// [`warn_if_due`] invokes the callback with the accumulated byte count if
/// the interval has elapsed since the last emission.
///
/// [`record_dropped`]: RateLimitedWarner::record_dropped
/// [`warn_if_due`]: RateLimitedWarner::warn_if_due
pub struct RateLimitedWarner {
    last_warn: AtomicU64,
    dropped_bytes: AtomicU64,
    interval_ms: u64,
    clock: Arc<dyn Clock>,
}

impl RateLimitedWarner {
    /// Create a warner using the provided interval.
    pub fn new(interval: Duration) -> Self {
        Self::with_clock(interval, Arc::new(RealClock::default()))
    }

    /// Create a warner with a custom clock.
    pub fn with_clock(interval: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            last_warn: AtomicU64::new(u64::MAX),
            dropped_bytes: AtomicU64::new(0),
            interval_ms: interval.as_millis() as u64,
            clock,
        }
    }

    /// Add discarded bytes to the pending count.
    pub fn record_dropped(&self, bytes: u64) {
        self.dropped_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Emit a warning if the rate limit interval has elapsed.
    pub fn warn_if_due(&self, mut warn: impl FnMut(u64)) {
        let now = self.clock.now_millis();
        let prev = self.last_warn.load(Ordering::Relaxed);
        if prev == u64::MAX || now.saturating_sub(prev) >= self.interval_ms {
            let bytes = self.dropped_bytes.swap(0, Ordering::Relaxed);
            if bytes > 0 {
                warn(bytes);
            }
            self.last_warn.store(now, Ordering::Relaxed);
        }
    }
}

impl Default for RateLimitedWarner {
    fn default() -> Self {
        Self::new(DEFAULT_WARN_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    struct FakeClock {
        now: AtomicU64,
    }

    impl FakeClock {
        fn advance(&self, ms: u64) {
            self.now.fetch_add(ms, Ordering::Relaxed);
        }
    }

    impl Clock for FakeClock {
        fn now_millis(&self) -> u64 {
            self.now.load(Ordering::Relaxed)
        }
    }

    #[fixture]
    fn warner() -> (RateLimitedWarner, Arc<FakeClock>) {
        let clock = Arc::new(FakeClock {
            now: AtomicU64::new(0),
        });
        (
            RateLimitedWarner::with_clock(Duration::from_secs(1), clock.clone() as Arc<dyn Clock>),
            clock,
        )
    }

    #[rstest]
    fn accumulates_bytes_between_warnings(warner: (RateLimitedWarner, Arc<FakeClock>)) {
        let (warner, _clock) = warner;
        let mut warnings = Vec::new();
        warner.record_dropped(100);
        warner.record_dropped(28);
        warner.warn_if_due(|b| warnings.push(b));
        assert_eq!(warnings, vec![128]);
    }

    #[rstest]
    fn rate_limits_subsequent_warnings(warner: (RateLimitedWarner, Arc<FakeClock>)) {
        let (warner, clock) = warner;
        let mut warnings = Vec::new();
        warner.record_dropped(1);
        warner.warn_if_due(|b| warnings.push(b));
        warner.record_dropped(2);
        warner.warn_if_due(|b| warnings.push(b));
        assert_eq!(warnings, vec![1]);
        clock.advance(1000);
        warner.warn_if_due(|b| warnings.push(b));
        assert_eq!(warnings, vec![1, 2]);
    }

    #[rstest]
    fn no_warning_without_drops(warner: (RateLimitedWarner, Arc<FakeClock>)) {
        let (warner, _clock) = warner;
        let mut warnings = Vec::new();
        warner.warn_if_due(|b| warnings.push(b));
        assert!(warnings.is_empty());
    }
}

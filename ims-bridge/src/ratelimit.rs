//! Log rate limiting for hot paths
//!
//! Per-packet and per-block failures can fire thousands of times per second.
//! A [`LogLimiter`] lets at most `burst` lines through per `interval` and
//! silently drops the rest; the counters in [`crate::stats`] still see every
//! event.

use std::fmt;
use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

/// Default lines allowed per interval
pub const DEFAULT_LOG_BURST: u32 = 5;

/// Default interval
pub const DEFAULT_LOG_INTERVAL: Duration = Duration::from_secs(5);

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Token bucket gate for log lines
pub struct LogLimiter {
    limiter: DirectLimiter,
}

impl LogLimiter {
    /// Allow `burst` lines per `interval`
    #[must_use]
    pub fn new(burst: u32, interval: Duration) -> Self {
        let burst = NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::with_period(interval / burst.get())
            .unwrap_or_else(|| Quota::per_second(burst))
            .allow_burst(burst);
        Self {
            limiter: RateLimiter::direct(quota),
        }
    }

    /// Whether a line may be logged now
    #[must_use]
    pub fn allow(&self) -> bool {
        self.limiter.check().is_ok()
    }
}

impl Default for LogLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_BURST, DEFAULT_LOG_INTERVAL)
    }
}

impl fmt::Debug for LogLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LogLimiter")
    }
}

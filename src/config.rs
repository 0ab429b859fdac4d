//! Rate limit configuration.

use crate::error::Error;
use std::time::Duration;

/// Largest count that is exactly representable in `f64`. The algorithms do
/// floating-point token arithmetic, so rates and burst sizes above this
/// would silently lose precision.
const MAX_EXACT_COUNT: u64 = 1 << 53;

/// Rate limiter configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Number of requests allowed per window.
    pub rate: u64,
    /// The time window for rate limiting.
    pub window: Duration,
    /// Maximum burst size, consumed only by the token bucket algorithm.
    /// Zero means "default to `rate`".
    pub burst_size: u64,
}

impl Default for Config {
    /// 100 requests per minute with a burst size of 100.
    fn default() -> Self {
        Self { rate: 100, window: Duration::from_secs(60), burst_size: 100 }
    }
}

impl Config {
    /// Create a configuration allowing `rate` requests per `window`, with
    /// the burst size defaulting to `rate`.
    pub fn new(rate: u64, window: Duration) -> Self {
        Self { rate, window, burst_size: 0 }
    }

    /// Return a copy with the given burst size.
    pub fn with_burst_size(mut self, size: u64) -> Self {
        self.burst_size = size;
        self
    }

    /// Check that the configuration is usable by the algorithms.
    pub fn validate(&self) -> Result<(), Error> {
        if self.rate == 0 || self.rate > MAX_EXACT_COUNT {
            return Err(Error::InvalidRate);
        }
        if self.window.is_zero() {
            return Err(Error::InvalidWindow);
        }
        if self.burst_size > MAX_EXACT_COUNT {
            return Err(Error::InvalidBurstSize);
        }
        Ok(())
    }
}

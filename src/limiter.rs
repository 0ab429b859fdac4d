//! The limiter contract shared by all algorithms.

use crate::error::Error;
use std::time::Duration;

/// Detailed outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitResult {
    /// Whether the request is allowed.
    pub allowed: bool,
    /// The configured limit (requests per window).
    pub limit: u64,
    /// Requests remaining in the current window.
    pub remaining: u64,
    /// Time until the limit resets.
    pub reset_after: Duration,
    /// How long to wait before retrying. Zero when allowed.
    pub retry_after: Duration,
}

/// Rate limiting interface.
///
/// Implementations must be safe for concurrent use; decisions for the same
/// key are linearizable.
pub trait Limiter: Send + Sync {
    /// Check if a single request is allowed for the given key.
    fn allow(&self, key: &str) -> Result<bool, Error> {
        self.allow_n(key, 1)
    }

    /// Check if `n` requests are allowed for the given key. `n == 0` is
    /// trivially allowed.
    fn allow_n(&self, key: &str, n: u64) -> Result<bool, Error> {
        Ok(self.allow_n_with_details(key, n)?.allowed)
    }

    /// Check if `n` requests are allowed and return the detailed result.
    fn allow_n_with_details(&self, key: &str, n: u64) -> Result<RateLimitResult, Error>;

    /// Clear the rate limit state for the given key.
    fn reset(&self, key: &str) -> Result<(), Error>;
}

//! Clock abstractions used by the limiters and the in-memory store.
//!
//! Decisions and entry expiry are driven by an injected [`Clock`] rather
//! than by `Instant::now()` calls scattered through the code. Production
//! code uses [`SystemClock`]; tests inject a [`ManualClock`] and advance it
//! explicitly, which makes refill, window-slide, and TTL behavior
//! deterministic.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Thread-safe monotonic time source.
///
/// Implementations must be monotone: successive calls never go backwards.
/// Calls must be safe concurrently (`Send + Sync`).
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// The current instant.
    fn now(&self) -> Instant;
}

/// Clock backed by [`Instant::now`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually advanced clock for deterministic tests.
///
/// Clones share the same epoch and offset; advancing one advances all.
#[derive(Debug, Clone)]
pub struct ManualClock {
    base: Instant,
    offset: Arc<Mutex<Duration>>,
}

impl ManualClock {
    /// Create a clock pinned at the current instant.
    pub fn new() -> Self {
        Self { base: Instant::now(), offset: Arc::new(Mutex::new(Duration::ZERO)) }
    }

    /// Move the clock forward by `d`.
    pub fn advance(&self, d: Duration) {
        *self.offset.lock() += d;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }
}

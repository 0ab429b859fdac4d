//! Sliding window rate limiting.
//!
//! Stricter than a fixed window: the effective count is the current window's
//! count plus a linearly decaying weight of the previous window's count, so
//! bursts cannot straddle a window boundary unchecked.

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::Error;
use crate::limiter::{Limiter, RateLimitResult};
use crate::shard::KeyLocks;
use crate::store::Store;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Store namespace for sliding window state.
const NAMESPACE: &str = "sw";

/// Per-key sliding window state.
#[derive(Debug, Clone, Copy)]
pub struct SlidingWindowState {
    /// Count from the previous window.
    prev_count: u64,
    /// Count in the current window.
    curr_count: u64,
    /// Start of the current window. Always within one window boundary of
    /// the clock after advancing.
    window_start: Instant,
}

enum Persist {
    Save,
    RefreshTtl,
}

/// Sliding window rate limiter over a [`Store`].
pub struct SlidingWindow<S> {
    config: Config,
    store: S,
    locks: KeyLocks,
    /// Pre-computed `1 / window_nanos`, so progress is a multiplication.
    inv_window: f64,
    clock: Arc<dyn Clock>,
}

impl<S> std::fmt::Debug for SlidingWindow<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlidingWindow").field("config", &self.config).finish_non_exhaustive()
    }
}

impl<S> SlidingWindow<S>
where
    S: Store<SlidingWindowState>,
{
    /// Create a sliding window limiter. Fails on invalid configuration.
    pub fn new(config: Config, store: S) -> Result<Self, Error> {
        Self::with_clock(config, store, Arc::new(SystemClock))
    }

    /// Create a sliding window limiter with an injected clock.
    pub fn with_clock(config: Config, store: S, clock: Arc<dyn Clock>) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            inv_window: 1.0 / config.window.as_nanos() as f64,
            config,
            store,
            locks: KeyLocks::new(),
            clock,
        })
    }

    /// Estimate of remaining requests for the key.
    pub fn remaining(&self, key: &str) -> Result<u64, Error> {
        let _guard = self.locks.lock(key);
        let now = self.clock.now();
        let remaining = self.store.with_value(NAMESPACE, key, |slot| match slot {
            Some(state) => {
                self.advance(state, now);
                let weighted = self.weighted_count(state, now);
                (self.config.rate as f64 - weighted).max(0.0) as u64
            }
            None => self.config.rate,
        })?;
        Ok(remaining)
    }

    /// Slide or reset the window in place if time has passed.
    fn advance(&self, state: &mut SlidingWindowState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.window_start);
        if elapsed >= self.config.window * 2 {
            state.prev_count = 0;
            state.curr_count = 0;
            state.window_start = now;
        } else if elapsed >= self.config.window {
            state.prev_count = state.curr_count;
            state.curr_count = 0;
            state.window_start += self.config.window;
        }
    }

    /// Previous-window weight decays linearly as the current window
    /// progresses.
    fn weighted_count(&self, state: &SlidingWindowState, now: Instant) -> f64 {
        let progress = (now.saturating_duration_since(state.window_start).as_nanos() as f64
            * self.inv_window)
            .min(1.0);
        state.prev_count as f64 * (1.0 - progress) + state.curr_count as f64
    }

    fn ttl(&self) -> Duration {
        // Three windows: the two-window lookback needs older entries to
        // stay reachable.
        self.config.window * 3
    }
}

impl<S> Limiter for SlidingWindow<S>
where
    S: Store<SlidingWindowState>,
{
    fn allow_n_with_details(&self, key: &str, n: u64) -> Result<RateLimitResult, Error> {
        if n == 0 {
            return Ok(RateLimitResult {
                allowed: true,
                limit: self.config.rate,
                remaining: self.config.rate,
                reset_after: Duration::ZERO,
                retry_after: Duration::ZERO,
            });
        }

        let _guard = self.locks.lock(key);
        let now = self.clock.now();
        let cost = n as f64;
        let rate = self.config.rate as f64;

        let existing = self.store.with_value(NAMESPACE, key, |slot| {
            let state = slot?;
            self.advance(state, now);

            let elapsed = now.saturating_duration_since(state.window_start);
            let weighted = self.weighted_count(state, now);
            let mut result = RateLimitResult {
                allowed: false,
                limit: self.config.rate,
                remaining: 0,
                reset_after: self.config.window.saturating_sub(elapsed),
                retry_after: Duration::ZERO,
            };

            let persist = if weighted + cost > rate {
                result.remaining = (rate - weighted).max(0.0) as u64;
                // Conservative: wait until the start of the next window.
                result.retry_after = self.config.window.saturating_sub(elapsed);
                Persist::RefreshTtl
            } else {
                state.curr_count += n;
                result.allowed = true;
                result.remaining = (rate - (weighted + cost)).max(0.0) as u64;
                Persist::Save
            };
            Some((result, persist, *state))
        })?;

        if let Some((result, persist, state)) = existing {
            match persist {
                Persist::Save => self.store.set(NAMESPACE, key, state, self.ttl())?,
                Persist::RefreshTtl => {
                    if self.store.update_ttl(NAMESPACE, key, self.ttl()).is_err() {
                        let _ = self.store.set(NAMESPACE, key, state, self.ttl());
                    }
                }
            }
            return Ok(result);
        }

        // First sighting of this key: an empty window starting now.
        let mut result = RateLimitResult {
            allowed: false,
            limit: self.config.rate,
            remaining: self.config.rate,
            reset_after: self.config.window,
            retry_after: Duration::ZERO,
        };

        if cost > rate {
            result.retry_after = self.config.window;
            return Ok(result);
        }

        let state = SlidingWindowState { prev_count: 0, curr_count: n, window_start: now };
        result.allowed = true;
        result.remaining = (rate - cost).max(0.0) as u64;
        // A full shard surfaces here; the allow must not go unpersisted.
        self.store.set(NAMESPACE, key, state, self.ttl())?;
        Ok(result)
    }

    fn reset(&self, key: &str) -> Result<(), Error> {
        let _guard = self.locks.lock(key);
        self.store.delete(NAMESPACE, key)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{MemoryStore, MemoryStoreConfig};

    fn window(
        config: Config,
    ) -> (SlidingWindow<Arc<MemoryStore<SlidingWindowState>>>, ManualClock) {
        let clock = ManualClock::new();
        let store = Arc::new(MemoryStore::with_clock(
            MemoryStoreConfig::default(),
            Arc::new(clock.clone()),
        ));
        let limiter = SlidingWindow::with_clock(config, store, Arc::new(clock.clone())).unwrap();
        (limiter, clock)
    }

    #[tokio::test]
    async fn rejects_invalid_config() {
        let store: MemoryStore<SlidingWindowState> = MemoryStore::new();
        let err = SlidingWindow::new(Config::new(10, Duration::ZERO), store).unwrap_err();
        assert!(matches!(err, Error::InvalidWindow));
    }

    #[tokio::test]
    async fn rate_is_enforced_within_a_window() {
        let (limiter, _clock) = window(Config::new(10, Duration::from_millis(100)));
        for i in 0..10 {
            assert!(limiter.allow("k").unwrap(), "request {} should be allowed", i);
        }
        let result = limiter.allow_n_with_details("k", 1).unwrap();
        assert!(!result.allowed);
        assert_eq!(result.remaining, 0);
        assert!(result.retry_after > Duration::ZERO);
        assert!(result.retry_after <= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn previous_window_weight_decays() {
        let (limiter, clock) = window(Config::new(10, Duration::from_millis(100)));
        for _ in 0..10 {
            assert!(limiter.allow("k").unwrap());
        }
        assert!(!limiter.allow("k").unwrap());

        // A quarter into the next window the weighted count is 10 * 0.75 =
        // 7.5, so two more requests fit and the third is denied.
        clock.advance(Duration::from_millis(125));
        assert!(limiter.allow("k").unwrap());
        assert!(limiter.allow("k").unwrap());
        assert!(!limiter.allow("k").unwrap());
    }

    #[tokio::test]
    async fn state_fully_resets_after_two_windows() {
        let (limiter, clock) = window(Config::new(5, Duration::from_millis(100)));
        for _ in 0..5 {
            assert!(limiter.allow("k").unwrap());
        }
        assert!(!limiter.allow("k").unwrap());

        clock.advance(Duration::from_millis(200));
        for _ in 0..5 {
            assert!(limiter.allow("k").unwrap());
        }
        assert!(!limiter.allow("k").unwrap());
    }

    #[tokio::test]
    async fn cost_above_rate_denied_without_storing_state() {
        let clock = ManualClock::new();
        let store = Arc::new(MemoryStore::with_clock(
            MemoryStoreConfig::default(),
            Arc::new(clock.clone()),
        ));
        let limiter = SlidingWindow::with_clock(
            Config::new(5, Duration::from_secs(1)),
            Arc::clone(&store),
            Arc::new(clock),
        )
        .unwrap();

        let result = limiter.allow_n_with_details("k", 6).unwrap();
        assert!(!result.allowed);
        assert_eq!(result.retry_after, Duration::from_secs(1));
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn zero_cost_is_trivially_allowed() {
        let (limiter, _clock) = window(Config::new(1, Duration::from_secs(1)));
        assert!(limiter.allow("k").unwrap());
        assert!(!limiter.allow("k").unwrap());
        assert!(limiter.allow_n("k", 0).unwrap());
    }

    #[tokio::test]
    async fn remaining_reflects_weighted_count() {
        let (limiter, clock) = window(Config::new(10, Duration::from_millis(100)));
        assert_eq!(limiter.remaining("k").unwrap(), 10);
        limiter.allow_n("k", 5).unwrap();
        assert_eq!(limiter.remaining("k").unwrap(), 5);

        // Half a window later the old 5 weigh only 2.5.
        clock.advance(Duration::from_millis(150));
        assert_eq!(limiter.remaining("k").unwrap(), 7);
    }

    #[tokio::test]
    async fn reset_clears_state() {
        let (limiter, _clock) = window(Config::new(2, Duration::from_secs(1)));
        assert!(limiter.allow("k").unwrap());
        assert!(limiter.allow("k").unwrap());
        assert!(!limiter.allow("k").unwrap());
        limiter.reset("k").unwrap();
        assert!(limiter.allow("k").unwrap());
    }

    #[tokio::test]
    async fn new_key_into_full_store_is_denied() {
        let clock = ManualClock::new();
        let store = Arc::new(MemoryStore::with_clock(
            MemoryStoreConfig { max_entries: 1, ..Default::default() },
            Arc::new(clock.clone()),
        ));
        let limiter = SlidingWindow::with_clock(
            Config::new(10, Duration::from_secs(1)),
            Arc::clone(&store),
            Arc::new(clock),
        )
        .unwrap();

        let filler =
            SlidingWindowState { prev_count: 0, curr_count: 1, window_start: Instant::now() };
        let mut i = 0u64;
        while store.len() < 256 {
            let _ = store.set(NAMESPACE, &format!("fill-{}", i), filler, Duration::ZERO);
            i += 1;
            assert!(i < 100_000, "could not fill store");
        }

        let err = limiter.allow("fresh-key").unwrap_err();
        assert!(err.is_store_full());
    }

    #[tokio::test]
    async fn reset_after_points_at_window_boundary() {
        let (limiter, clock) = window(Config::new(10, Duration::from_millis(100)));
        limiter.allow("k").unwrap();
        clock.advance(Duration::from_millis(30));
        let result = limiter.allow_n_with_details("k", 1).unwrap();
        assert!(result.allowed);
        assert_eq!(result.reset_after, Duration::from_millis(70));
    }
}

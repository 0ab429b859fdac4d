//! Token bucket rate limiting.
//!
//! Tokens are added at a steady rate and consumed by requests, which allows
//! controlled bursting while maintaining an average rate. State lives in a
//! [`Store`] and is mutated in place under a per-key lock stripe.

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::Error;
use crate::limiter::{Limiter, RateLimitResult};
use crate::shard::KeyLocks;
use crate::store::Store;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Store namespace for token bucket state.
const NAMESPACE: &str = "tb";

/// Per-key token bucket state.
#[derive(Debug, Clone, Copy)]
pub struct TokenBucketState {
    /// Tokens currently available. Stays within `[0, burst_size]` after
    /// every refill.
    tokens: f64,
    /// When tokens were last refilled.
    last_refill: Instant,
    /// When the state was last persisted. `None` means never saved.
    last_save: Option<Instant>,
}

enum Persist {
    Skip,
    Save,
    RefreshTtl,
}

/// Token bucket rate limiter over a [`Store`].
pub struct TokenBucket<S> {
    config: Config,
    store: S,
    locks: KeyLocks,
    burst: f64,
    /// Pre-computed `rate / window_nanos`, so refills are a multiplication.
    tokens_per_nano: f64,
    clock: Arc<dyn Clock>,
}

impl<S> std::fmt::Debug for TokenBucket<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket").field("config", &self.config).finish_non_exhaustive()
    }
}

impl<S> TokenBucket<S>
where
    S: Store<TokenBucketState>,
{
    /// Create a token bucket limiter. Fails on invalid configuration.
    ///
    /// A zero `burst_size` defaults to `rate`.
    pub fn new(config: Config, store: S) -> Result<Self, Error> {
        Self::with_clock(config, store, Arc::new(SystemClock))
    }

    /// Create a token bucket limiter with an injected clock.
    pub fn with_clock(mut config: Config, store: S, clock: Arc<dyn Clock>) -> Result<Self, Error> {
        config.validate()?;
        if config.burst_size == 0 {
            config.burst_size = config.rate;
        }
        Ok(Self {
            burst: config.burst_size as f64,
            tokens_per_nano: config.rate as f64 / config.window.as_nanos() as f64,
            config,
            store,
            locks: KeyLocks::new(),
            clock,
        })
    }

    /// Remaining whole tokens for the key, after a read-only refill step.
    pub fn remaining(&self, key: &str) -> Result<u64, Error> {
        // The refill advance is a write in effect, so it takes the same
        // stripe as decisions.
        let _guard = self.locks.lock(key);
        let now = self.clock.now();
        let tokens = self.store.with_value(NAMESPACE, key, |slot| match slot {
            Some(state) => {
                self.refill(state, now);
                state.tokens
            }
            None => self.burst,
        })?;
        Ok(tokens as u64)
    }

    fn refill(&self, state: &mut TokenBucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill);
        let refilled = state.tokens + elapsed.as_nanos() as f64 * self.tokens_per_nano;
        state.tokens = refilled.min(self.burst);
        state.last_refill = now;
    }

    fn ttl(&self) -> Duration {
        // Twice the window: a key in steady use is re-saved at least once
        // per window and never expires between requests.
        self.config.window * 2
    }

    fn retry_after(&self, needed: f64) -> Duration {
        Duration::from_nanos((needed / self.tokens_per_nano) as u64)
    }
}

impl<S> Limiter for TokenBucket<S>
where
    S: Store<TokenBucketState>,
{
    fn allow_n_with_details(&self, key: &str, n: u64) -> Result<RateLimitResult, Error> {
        if n == 0 {
            return Ok(RateLimitResult {
                allowed: true,
                limit: self.config.rate,
                remaining: self.config.burst_size,
                reset_after: Duration::ZERO,
                retry_after: Duration::ZERO,
            });
        }

        let _guard = self.locks.lock(key);
        let now = self.clock.now();
        let cost = n as f64;

        let existing = self.store.with_value(NAMESPACE, key, |slot| {
            let state = slot?;
            self.refill(state, now);

            let mut result = RateLimitResult {
                allowed: false,
                limit: self.config.rate,
                remaining: 0,
                reset_after: self.config.window,
                retry_after: Duration::ZERO,
            };

            let persist = if state.tokens >= cost {
                state.tokens -= cost;
                result.allowed = true;
                result.remaining = state.tokens as u64;
                // The decrement is already live through the store reference;
                // a full save is only needed to keep the TTL fresh, at least
                // once per window.
                let fresh = state
                    .last_save
                    .is_some_and(|saved| now.saturating_duration_since(saved) < self.config.window);
                if fresh {
                    Persist::Skip
                } else {
                    state.last_save = Some(now);
                    Persist::Save
                }
            } else {
                result.remaining = state.tokens as u64;
                result.retry_after = self.retry_after(cost - state.tokens);
                Persist::RefreshTtl
            };
            Some((result, persist, *state))
        })?;

        if let Some((result, persist, state)) = existing {
            match persist {
                Persist::Skip => {}
                Persist::Save => self.store.set(NAMESPACE, key, state, self.ttl())?,
                Persist::RefreshTtl => {
                    // Denied state is derivable from the old state plus the
                    // clock, so only the TTL needs refreshing; fall back to a
                    // full write for stores without that capability.
                    if self.store.update_ttl(NAMESPACE, key, self.ttl()).is_err() {
                        let _ = self.store.set(NAMESPACE, key, state, self.ttl());
                    }
                }
            }
            return Ok(result);
        }

        // First sighting of this key: start from a full bucket.
        let mut state = TokenBucketState { tokens: self.burst, last_refill: now, last_save: None };
        let mut result = RateLimitResult {
            allowed: false,
            limit: self.config.rate,
            remaining: state.tokens as u64,
            reset_after: self.config.window,
            retry_after: Duration::ZERO,
        };

        if state.tokens >= cost {
            state.tokens -= cost;
            state.last_save = Some(now);
            result.allowed = true;
            result.remaining = state.tokens as u64;
            // A full shard surfaces here; an allow that cannot be persisted
            // would make the limit unenforceable, so the error propagates.
            self.store.set(NAMESPACE, key, state, self.ttl())?;
        } else {
            result.retry_after = self.retry_after(cost - state.tokens);
        }
        Ok(result)
    }

    fn reset(&self, key: &str) -> Result<(), Error> {
        let _guard = self.locks.lock(key);
        self.store.delete(NAMESPACE, key)?;
        Ok(())
    }
}

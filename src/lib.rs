#![forbid(unsafe_code)]

//! # Floodgate
//!
//! Modular HTTP rate limiting: token bucket and sliding window algorithms
//! over a sharded in-memory store, with tower middleware for per-request
//! and per-endpoint enforcement.
//!
//! ## Features
//!
//! - **Token bucket** for APIs that tolerate short bursts at a steady
//!   average rate
//! - **Sliding window** for stricter limits with no burst allowance
//! - **Sharded in-memory store** with TTL, bounded capacity, and a seeded
//!   hash that resists adversarial key collisions
//! - **Middleware** that stamps `X-RateLimit-*` headers and fails closed on
//!   input and capacity faults (431, 503) while failing open on dependency
//!   faults
//! - **Secure IP extraction**, including a trusted-proxy mode that walks
//!   `X-Forwarded-For` right to left across all header lines
//!
//! ## Quick Start
//!
//! ```rust
//! use floodgate::{Config, Limiter, MemoryStore, TokenBucket};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), floodgate::Error> {
//!     let store = MemoryStore::new();
//!     let limiter = TokenBucket::new(
//!         Config::new(100, Duration::from_secs(60)).with_burst_size(20),
//!         store,
//!     )?;
//!
//!     if limiter.allow("client-1")? {
//!         // handle the request
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Middleware
//!
//! [`RateLimitLayer`] wraps any tower service with a single limiter;
//! [`RateLimitRouterLayer`] applies different rules to different endpoint
//! patterns, with the most specific matching rule winning regardless of
//! declaration order.

pub mod clock;
pub mod config;
pub mod error;
pub mod limiter;
pub mod middleware;
mod shard;
pub mod sliding_window;
pub mod store;
pub mod token_bucket;

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::Error;
pub use limiter::{Limiter, RateLimitResult};
pub use middleware::router::{Algorithm, EndpointRule, RateLimitRouter, RateLimitRouterLayer};
pub use middleware::{
    client_ip_key, default_on_limited, trusted_proxy_key, KeyFunc, OnLimited, Options,
    RateLimitLayer, RateLimitService, RequestInfo,
};
pub use sliding_window::{SlidingWindow, SlidingWindowState};
pub use store::{MemoryStore, MemoryStoreConfig, Store, StoreError};
pub use token_bucket::{TokenBucket, TokenBucketState};

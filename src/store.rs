//! Storage backends for rate limiting state.
//!
//! A [`Store`] is a concurrent `(namespace, key)` map holding one typed state
//! value per key, with per-entry TTL and a bounded capacity. The crate ships
//! [`MemoryStore`], a sharded in-memory implementation; external backends
//! (Redis, Memcached) can plug in by implementing the trait.
//!
//! # Access model
//!
//! The hot path runs through [`Store::with_value`]: the closure receives
//! exclusive, scoped access to the live value and may mutate it in place.
//! The reference is only valid inside the closure, so callers cannot retain
//! it past the store's internal lock. Mutations made inside the closure
//! persist without a separate write.

use std::fmt;
use std::time::{Duration, Instant};

pub mod memory;

pub use memory::{MemoryStore, MemoryStoreConfig};

/// Errors surfaced by store operations.
#[derive(Debug)]
pub enum StoreError {
    /// The namespace plus key exceeds the store's maximum key length.
    KeyTooLong {
        /// Combined namespace + key length in bytes.
        len: usize,
        /// The store's configured maximum.
        max: usize,
    },
    /// A new key could not be inserted because capacity is exhausted.
    /// The store does not evict, grow, or wait.
    StoreFull,
    /// The store cannot refresh a TTL without rewriting the value.
    /// Callers fall back to a full write.
    NotSupported,
    /// A backend dependency failed (e.g. an external store is unreachable).
    Backend(Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    /// Check whether this error is a key-length violation, looking through
    /// wrapped backend errors.
    pub fn is_key_too_long(&self) -> bool {
        match self {
            Self::KeyTooLong { .. } => true,
            Self::Backend(e) => {
                matches!(find_store_error(e.as_ref()), Some(StoreError::KeyTooLong { .. }))
            }
            _ => false,
        }
    }

    /// Check whether this error is a capacity fault, looking through wrapped
    /// backend errors.
    pub fn is_store_full(&self) -> bool {
        match self {
            Self::StoreFull => true,
            Self::Backend(e) => matches!(find_store_error(e.as_ref()), Some(StoreError::StoreFull)),
            _ => false,
        }
    }

    /// Check whether this error is the internal TTL-refresh capability signal.
    pub fn is_not_supported(&self) -> bool {
        matches!(self, Self::NotSupported)
    }
}

/// Walk a cause chain looking for a `StoreError`, so that wrapped capacity
/// and key-length faults still classify correctly.
fn find_store_error<'a>(err: &'a (dyn std::error::Error + Send + Sync + 'static)) -> Option<&'a StoreError> {
    if let Some(s) = err.downcast_ref::<StoreError>() {
        return Some(s);
    }
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(s) = cause.downcast_ref::<StoreError>() {
            return Some(s);
        }
        source = cause.source();
    }
    None
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeyTooLong { len, max } => {
                write!(f, "key too long ({} bytes, max {})", len, max)
            }
            Self::StoreFull => write!(f, "store capacity exceeded"),
            Self::NotSupported => write!(f, "operation not supported by this store"),
            Self::Backend(e) => write!(f, "store backend error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Backend(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

/// A stored value with its expiration instant.
///
/// `expires_at == None` means the entry never expires. An entry whose
/// expiration has passed must be observed as absent by reads; physical
/// removal is deferred to the cleanup sweep.
#[derive(Debug, Clone, Copy)]
pub struct Entry<T> {
    /// The stored algorithm state.
    pub value: T,
    /// Absolute expiration instant, or `None` for no expiry.
    pub expires_at: Option<Instant>,
}

impl<T> Entry<T> {
    /// Whether the entry has expired as of `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        match self.expires_at {
            Some(at) => now >= at,
            None => false,
        }
    }
}

/// Storage contract for rate limiting state.
///
/// Implementations must be safe for concurrent use. All operations are
/// keyed by `(namespace, key)`; the namespace keeps different algorithms'
/// state apart without per-call string concatenation.
pub trait Store<T>: Send + Sync {
    /// Retrieve a copy of the value for a key.
    ///
    /// Returns `None` for absent, expired, or oversized keys.
    fn get(&self, namespace: &str, key: &str) -> Option<T>
    where
        T: Clone;

    /// Run `f` with exclusive access to the live value for a key.
    ///
    /// The closure sees `None` when the key is absent or expired. Mutations
    /// through the `&mut T` persist. The reference must not (and cannot)
    /// escape the closure.
    fn with_value<R>(
        &self,
        namespace: &str,
        key: &str,
        f: impl FnOnce(Option<&mut T>) -> R,
    ) -> Result<R, StoreError>;

    /// Store a value with an optional TTL. A zero `ttl` means the value
    /// never expires.
    ///
    /// Updating an existing key always succeeds; inserting a new key fails
    /// with [`StoreError::StoreFull`] when the capacity bound is reached.
    fn set(&self, namespace: &str, key: &str, value: T, ttl: Duration) -> Result<(), StoreError>;

    /// Remove a value. Removing an absent key is not an error.
    fn delete(&self, namespace: &str, key: &str) -> Result<(), StoreError>;

    /// Refresh the expiration of a key without touching its value. A zero
    /// `ttl` clears the expiration. Absent keys are an `Ok` no-op.
    ///
    /// Stores that cannot do this cheaply return
    /// [`StoreError::NotSupported`]; callers then fall back to a full write.
    fn update_ttl(&self, namespace: &str, key: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Number of entries currently held, including expired ones awaiting
    /// cleanup.
    fn len(&self) -> usize;

    /// Whether the store holds no entries.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T, S> Store<T> for std::sync::Arc<S>
where
    S: Store<T> + ?Sized,
{
    fn get(&self, namespace: &str, key: &str) -> Option<T>
    where
        T: Clone,
    {
        (**self).get(namespace, key)
    }

    fn with_value<R>(
        &self,
        namespace: &str,
        key: &str,
        f: impl FnOnce(Option<&mut T>) -> R,
    ) -> Result<R, StoreError> {
        (**self).with_value(namespace, key, f)
    }

    fn set(&self, namespace: &str, key: &str, value: T, ttl: Duration) -> Result<(), StoreError> {
        (**self).set(namespace, key, value, ttl)
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        (**self).delete(namespace, key)
    }

    fn update_ttl(&self, namespace: &str, key: &str, ttl: Duration) -> Result<(), StoreError> {
        (**self).update_ttl(namespace, key, ttl)
    }

    fn len(&self) -> usize {
        (**self).len()
    }
}

//! Sharded in-memory store with TTL and a background cleanup sweep.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use ahash::RandomState;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use super::{Entry, Store, StoreError};
use crate::clock::{Clock, SystemClock};

/// Number of shards. Must be a power of two so shard selection is a mask.
/// Large enough that two workers rarely contend on the same shard at peak
/// concurrency.
const SHARD_COUNT: usize = 256;

/// Configuration for [`MemoryStore`].
#[derive(Debug, Clone, Copy)]
pub struct MemoryStoreConfig {
    /// How often the background sweep removes expired entries.
    pub cleanup_interval: Duration,
    /// Maximum number of keys to store, apportioned across shards.
    pub max_entries: usize,
    /// Maximum combined length of namespace + key, in bytes.
    pub max_key_size: usize,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: Duration::from_secs(60),
            max_entries: 1_000_000,
            max_key_size: 4096,
        }
    }
}

impl MemoryStoreConfig {
    /// Replace zero fields with defaults.
    fn normalized(mut self) -> Self {
        let defaults = Self::default();
        if self.cleanup_interval.is_zero() {
            self.cleanup_interval = defaults.cleanup_interval;
        }
        if self.max_entries == 0 {
            self.max_entries = defaults.max_entries;
        }
        if self.max_key_size == 0 {
            self.max_key_size = defaults.max_key_size;
        }
        self
    }
}

/// Two-part map key, looked up without per-call allocation.
///
/// Owned keys live in the shard maps; lookups go through a borrowed view of
/// the same trait so `get`/`delete` never concatenate or copy strings.
trait MapKey {
    fn namespace(&self) -> &str;
    fn key(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct OwnedKey {
    ns: Box<str>,
    key: Box<str>,
}

struct LookupKey<'a> {
    ns: &'a str,
    key: &'a str,
}

impl MapKey for OwnedKey {
    fn namespace(&self) -> &str {
        &self.ns
    }

    fn key(&self) -> &str {
        &self.key
    }
}

impl MapKey for LookupKey<'_> {
    fn namespace(&self) -> &str {
        self.ns
    }

    fn key(&self) -> &str {
        self.key
    }
}

impl<'a> Hash for dyn MapKey + 'a {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.namespace().hash(state);
        self.key().hash(state);
    }
}

impl<'a> PartialEq for dyn MapKey + 'a {
    fn eq(&self, other: &Self) -> bool {
        self.namespace() == other.namespace() && self.key() == other.key()
    }
}

impl<'a> Eq for dyn MapKey + 'a {}

impl Hash for OwnedKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self as &dyn MapKey).hash(state)
    }
}

impl<'a> Borrow<dyn MapKey + 'a> for OwnedKey {
    fn borrow(&self) -> &(dyn MapKey + 'a) {
        self
    }
}

struct Shard<T> {
    entries: RwLock<HashMap<OwnedKey, Entry<T>, RandomState>>,
}

struct Inner<T> {
    shards: Box<[Shard<T>]>,
    /// Keyed hasher, seeded once at construction and never exposed. Defeats
    /// adversarial key collisions that would concentrate load on one shard.
    hasher: RandomState,
    max_shard_size: usize,
    max_key_size: usize,
    clock: Arc<dyn Clock>,
}

/// Sharded in-memory implementation of [`Store`].
///
/// State is process-local and lost on restart. Expired entries are hidden
/// from reads immediately and physically removed by a periodic background
/// sweep. Capacity is bounded: once a shard is full, new keys are rejected
/// with [`StoreError::StoreFull`] rather than evicting or growing.
pub struct MemoryStore<T> {
    inner: Arc<Inner<T>>,
    stop: CancellationToken,
    cleanup: Mutex<Option<JoinHandle<()>>>,
}

impl<T> MemoryStore<T>
where
    T: Send + Sync + 'static,
{
    /// Create a store with default configuration.
    pub fn new() -> Self {
        Self::with_config(MemoryStoreConfig::default())
    }

    /// Create a store with custom configuration.
    pub fn with_config(config: MemoryStoreConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a store with custom configuration and an injected clock.
    ///
    /// The cleanup sweep is spawned on the ambient tokio runtime. Construct
    /// the store from within one: without a runtime a warning is logged and
    /// the sweep is disabled, so expiry is still enforced on every read but
    /// expired entries occupy shard capacity until overwritten.
    pub fn with_clock(config: MemoryStoreConfig, clock: Arc<dyn Clock>) -> Self {
        let config = config.normalized();
        let hasher = RandomState::new();
        let shards: Box<[Shard<T>]> = (0..SHARD_COUNT)
            .map(|_| Shard { entries: RwLock::new(HashMap::with_hasher(hasher.clone())) })
            .collect();

        let inner = Arc::new(Inner {
            shards,
            hasher,
            max_shard_size: (config.max_entries / SHARD_COUNT).max(1),
            max_key_size: config.max_key_size,
            clock,
        });

        let stop = CancellationToken::new();
        let cleanup = spawn_cleanup(Arc::clone(&inner), config.cleanup_interval, stop.clone());

        Self { inner, stop, cleanup: Mutex::new(cleanup) }
    }

    /// Stop the cleanup sweep and wait for it to finish. Idempotent.
    pub async fn close(&self) {
        self.stop.cancel();
        let handle = self.cleanup.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl<T> Default for MemoryStore<T>
where
    T: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for MemoryStore<T> {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

impl<T> std::fmt::Debug for MemoryStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("len", &self.inner.len())
            .field("max_shard_size", &self.inner.max_shard_size)
            .field("max_key_size", &self.inner.max_key_size)
            .finish()
    }
}

fn spawn_cleanup<T>(
    inner: Arc<Inner<T>>,
    interval: Duration,
    stop: CancellationToken,
) -> Option<JoinHandle<()>>
where
    T: Send + Sync + 'static,
{
    let handle = match tokio::runtime::Handle::try_current() {
        Ok(handle) => handle,
        Err(_) => {
            warn!(
                "no tokio runtime at store construction; cleanup sweep disabled, \
                 expired entries are reclaimed only when overwritten"
            );
            return None;
        }
    };
    Some(handle.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = ticker.tick() => inner.sweep(),
            }
        }
    }))
}

impl<T> Inner<T> {
    fn check_key(&self, ns: &str, key: &str) -> Result<(), StoreError> {
        let len = ns.len() + key.len();
        if len > self.max_key_size {
            return Err(StoreError::KeyTooLong { len, max: self.max_key_size });
        }
        Ok(())
    }

    fn shard(&self, ns: &str, key: &str) -> &Shard<T> {
        let hash = self.hasher.hash_one(&LookupKey { ns, key } as &dyn MapKey);
        &self.shards[hash as usize & (SHARD_COUNT - 1)]
    }

    fn len(&self) -> usize {
        self.shards.iter().map(|s| s.entries.read().len()).sum()
    }

    /// Remove expired entries, one shard lock at a time.
    fn sweep(&self) {
        let now = self.clock.now();
        let mut removed = 0usize;
        for shard in self.shards.iter() {
            let mut map = shard.entries.write();
            let before = map.len();
            map.retain(|_, entry| !entry.is_expired(now));
            removed += before - map.len();
        }
        if removed > 0 {
            trace!(removed, "swept expired rate limit entries");
        }
    }
}

impl<T> Store<T> for MemoryStore<T>
where
    T: Send + Sync + 'static,
{
    fn get(&self, namespace: &str, key: &str) -> Option<T>
    where
        T: Clone,
    {
        let inner = &self.inner;
        if namespace.len() + key.len() > inner.max_key_size {
            return None;
        }
        let map = inner.shard(namespace, key).entries.read();
        let entry = map.get(&LookupKey { ns: namespace, key } as &dyn MapKey)?;
        if entry.is_expired(inner.clock.now()) {
            return None;
        }
        Some(entry.value.clone())
    }

    fn with_value<R>(
        &self,
        namespace: &str,
        key: &str,
        f: impl FnOnce(Option<&mut T>) -> R,
    ) -> Result<R, StoreError> {
        let inner = &self.inner;
        inner.check_key(namespace, key)?;
        let now = inner.clock.now();
        let mut map = inner.shard(namespace, key).entries.write();
        let value = map
            .get_mut(&LookupKey { ns: namespace, key } as &dyn MapKey)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| &mut entry.value);
        Ok(f(value))
    }

    fn set(&self, namespace: &str, key: &str, value: T, ttl: Duration) -> Result<(), StoreError> {
        let inner = &self.inner;
        inner.check_key(namespace, key)?;
        let expires_at = if ttl.is_zero() { None } else { Some(inner.clock.now() + ttl) };
        let entry = Entry { value, expires_at };

        let mut map = inner.shard(namespace, key).entries.write();
        // Updates of existing keys always succeed, even at capacity, and
        // take no allocation.
        if let Some(existing) = map.get_mut(&LookupKey { ns: namespace, key } as &dyn MapKey) {
            *existing = entry;
            return Ok(());
        }
        if map.len() < inner.max_shard_size {
            map.insert(OwnedKey { ns: namespace.into(), key: key.into() }, entry);
            return Ok(());
        }
        Err(StoreError::StoreFull)
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        let inner = &self.inner;
        inner.check_key(namespace, key)?;
        let mut map = inner.shard(namespace, key).entries.write();
        map.remove(&LookupKey { ns: namespace, key } as &dyn MapKey);
        Ok(())
    }

    fn update_ttl(&self, namespace: &str, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let inner = &self.inner;
        inner.check_key(namespace, key)?;
        let expires_at = if ttl.is_zero() { None } else { Some(inner.clock.now() + ttl) };
        let mut map = inner.shard(namespace, key).entries.write();
        if let Some(entry) = map.get_mut(&LookupKey { ns: namespace, key } as &dyn MapKey) {
            entry.expires_at = expires_at;
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}

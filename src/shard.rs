//! Per-key lock striping for the limiter algorithms.

use ahash::RandomState;
use parking_lot::{Mutex, MutexGuard};

/// Number of lock stripes. Power of two so selection is a mask.
const LOCK_COUNT: usize = 256;

/// A mutex padded to a cache line so neighboring stripes don't false-share
/// under contention.
#[repr(align(64))]
#[derive(Default)]
struct PaddedMutex(Mutex<()>);

/// A fixed array of striped locks keyed by a seeded hash of the key.
///
/// Each limiter owns one of these; holding the stripe for a key serializes
/// all decisions for that key. The hash seed is generated at construction
/// and never exposed.
pub(crate) struct KeyLocks {
    hasher: RandomState,
    locks: Box<[PaddedMutex]>,
}

impl KeyLocks {
    pub(crate) fn new() -> Self {
        Self {
            hasher: RandomState::new(),
            locks: (0..LOCK_COUNT).map(|_| PaddedMutex::default()).collect(),
        }
    }

    /// Acquire the stripe for `key`. Decisions for the same key are
    /// serialized by this guard; different keys rarely contend.
    pub(crate) fn lock(&self, key: &str) -> MutexGuard<'_, ()> {
        let idx = self.hasher.hash_one(key) as usize & (LOCK_COUNT - 1);
        self.locks[idx].0.lock()
    }
}

impl std::fmt::Debug for KeyLocks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyLocks").field("stripes", &LOCK_COUNT).finish()
    }
}

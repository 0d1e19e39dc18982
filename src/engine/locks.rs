//! Per-key lock stripes
//!
//! Structural mutation of a logical key and the reclaim of its superseded
//! versions must never run concurrently. Keys hash onto a fixed array of
//! mutexes; two keys sharing a stripe merely serialize.
//!
//! Stripes are not reentrant. A thread holding one stripe must not lock
//! another key: if both hash to the same stripe it deadlocks on itself.

use parking_lot::{Mutex, MutexGuard};
use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;

pub struct KeyLocks {
    stripes: Box<[Mutex<()>]>,
    hasher: RandomState,
}

/// Guard over every stripe, released in reverse order on drop.
pub struct AllKeysGuard<'a> {
    _guards: Vec<MutexGuard<'a, ()>>,
}

impl KeyLocks {
    /// `stripes` must be a power of two (validated by `Options`).
    pub fn new(stripes: usize) -> Self {
        let stripes = stripes.max(1).next_power_of_two();
        Self {
            stripes: (0..stripes).map(|_| Mutex::new(())).collect(),
            hasher: RandomState::new(),
        }
    }

    fn index(&self, key: &[u8]) -> usize {
        (self.hasher.hash_one(key) as usize) & (self.stripes.len() - 1)
    }

    /// Lock the stripe owning `key`.
    pub fn lock(&self, key: &[u8]) -> MutexGuard<'_, ()> {
        self.stripes[self.index(key)].lock()
    }

    /// Lock every stripe, always in index order.
    pub fn lock_all(&self) -> AllKeysGuard<'_> {
        AllKeysGuard {
            _guards: self.stripes.iter().map(|stripe| stripe.lock()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.stripes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stripes.is_empty()
    }
}

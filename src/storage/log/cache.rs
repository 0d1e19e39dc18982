//! LRU block cache for point reads

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

const DEFAULT_CAPACITY: usize = 1000;

/// LRU cache of recently read values
///
/// Only reads with `fill_cache` set insert entries; every write through
/// the store invalidates the keys it touches.
pub struct BlockCache {
    entries: Mutex<LruCache<Vec<u8>, Vec<u8>>>,
    hit_count: AtomicU64,
    miss_count: AtomicU64,
}

impl BlockCache {
    /// Create a new cache holding up to `capacity` values
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity)
            .or_else(|| NonZeroUsize::new(DEFAULT_CAPACITY))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            hit_count: AtomicU64::new(0),
            miss_count: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(value) => {
                self.hit_count.fetch_add(1, Ordering::Relaxed);
                Some(value.clone())
            }
            None => {
                self.miss_count.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(&self, key: &[u8], value: &[u8]) {
        self.entries.lock().put(key.to_vec(), value.to_vec());
    }

    /// Whether `key` is cached, without touching recency or stats.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.entries.lock().contains(key)
    }

    pub fn remove(&self, key: &[u8]) {
        self.entries.lock().pop(key);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hit_count.load(Ordering::Relaxed);
        let misses = self.miss_count.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            hits as f64 / total as f64
        } else {
            0.0
        };

        let entries = self.entries.lock();
        CacheStats {
            hits,
            misses,
            hit_rate,
            size: entries.len(),
            capacity: entries.cap().get(),
            bytes: entries.iter().map(|(k, v)| k.len() + v.len()).sum(),
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub size: usize,
    pub capacity: usize,
    /// Bytes held by cached keys and values.
    pub bytes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_basic() {
        let cache = BlockCache::new(100);

        // Initially empty
        assert!(cache.get(b"key").is_none());

        cache.insert(b"key", b"value");
        assert_eq!(cache.get(b"key"), Some(b"value".to_vec()));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 1);
        assert_eq!(stats.bytes, 8);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_cache_eviction() {
        let cache = BlockCache::new(2);

        cache.insert(b"key1", b"data1");
        cache.insert(b"key2", b"data2");
        cache.insert(b"key3", b"data3");

        // key1 should be evicted (LRU)
        assert!(!cache.contains(b"key1"));
        assert!(cache.contains(b"key2"));
        assert!(cache.contains(b"key3"));
    }

    #[test]
    fn test_cache_remove_and_clear() {
        let cache = BlockCache::new(100);
        cache.insert(b"key1", b"data1");
        cache.insert(b"key2", b"data2");

        cache.remove(b"key1");
        assert!(!cache.contains(b"key1"));

        cache.clear();
        assert_eq!(cache.stats().size, 0);
    }

    #[test]
    fn test_zero_capacity_falls_back() {
        assert_eq!(BlockCache::new(0).stats().capacity, DEFAULT_CAPACITY);
    }
}

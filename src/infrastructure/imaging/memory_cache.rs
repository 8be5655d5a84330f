//! In-memory cost-bounded LRU image cache.

use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::domain::entities::{CacheKey, Image};

/// Default memory budget: 64 MiB of decoded pixels.
pub const DEFAULT_MAX_MEMORY_COST: u64 = 64 * 1024 * 1024;

struct Entry {
    image: Image,
    cost: u64,
}

struct Inner {
    entries: LruCache<CacheKey, Entry>,
    total_cost: u64,
}

/// Thread-safe in-memory cache for decoded images, bounded by aggregate cost.
///
/// Inserting past the budget discards least-recently-used entries until the total fits.
/// A budget of `0` means unlimited.
pub struct MemoryCache {
    inner: Mutex<Inner>,
    max_cost: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryCache {
    /// Creates a new cache with the specified cost budget.
    #[must_use]
    pub fn new(max_cost: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                total_cost: 0,
            }),
            max_cost: AtomicU64::new(max_cost),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns an image and marks it as most recently used.
    pub fn get(&self, key: &CacheKey) -> Option<Image> {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            trace!(key = %key, "Memory cache hit");
            Some(entry.image.clone())
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            trace!(key = %key, "Memory cache miss");
            None
        }
    }

    /// Peeks at an image without promoting it in the LRU order.
    pub fn peek(&self, key: &CacheKey) -> Option<Image> {
        self.inner.lock().entries.peek(key).map(|e| e.image.clone())
    }

    /// Returns true if the key is cached, without promoting it.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.lock().entries.contains(key)
    }

    /// Stores an image, replacing any previous entry, then evicts down to the budget.
    pub fn set(&self, key: CacheKey, image: Image, cost: u64) {
        let max_cost = self.max_cost.load(Ordering::Relaxed);
        let mut inner = self.inner.lock();

        if let Some(previous) = inner.entries.put(key.clone(), Entry { image, cost }) {
            inner.total_cost -= previous.cost;
        }
        inner.total_cost += cost;
        debug!(key = %key, cost, total = inner.total_cost, "Stored image in memory cache");

        Self::evict_to(&mut inner, max_cost);
    }

    /// Removes one image.
    pub fn remove(&self, key: &CacheKey) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.pop(key) {
            inner.total_cost -= entry.cost;
            debug!(key = %key, "Removed image from memory cache");
        }
    }

    /// Drops every image.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.total_cost = 0;
        debug!("Cleared memory image cache");
    }

    /// Changes the budget and evicts immediately if the cache is now over it.
    pub fn set_max_cost(&self, max_cost: u64) {
        self.max_cost.store(max_cost, Ordering::Relaxed);
        Self::evict_to(&mut self.inner.lock(), max_cost);
    }

    /// Returns the cost budget.
    #[must_use]
    pub fn max_cost(&self) -> u64 {
        self.max_cost.load(Ordering::Relaxed)
    }

    /// Returns the aggregate cost of all cached images.
    #[must_use]
    pub fn total_cost(&self) -> u64 {
        self.inner.lock().total_cost
    }

    /// Returns the number of cached images.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Returns true if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns cache statistics.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            (hits as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        let inner = self.inner.lock();
        CacheStats {
            hits,
            misses,
            hit_rate,
            size: inner.entries.len(),
            total_cost: inner.total_cost,
        }
    }

    fn evict_to(inner: &mut Inner, max_cost: u64) {
        if max_cost == 0 {
            return;
        }
        while inner.total_cost > max_cost {
            let Some((key, entry)) = inner.entries.pop_lru() else {
                break;
            };
            inner.total_cost -= entry.cost;
            debug!(key = %key, cost = entry.cost, "Evicted image from memory cache");
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MEMORY_COST)
    }
}

impl std::fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache")
            .field("max_cost", &self.max_cost())
            .finish_non_exhaustive()
    }
}

/// Statistics about cache performance.
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Hit rate as a percentage.
    pub hit_rate: f64,
    /// Current number of cached images.
    pub size: usize,
    /// Aggregate cost of cached images.
    pub total_cost: u64,
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Cache: {} images ({} bytes), {:.1}% hit rate ({} hits, {} misses)",
            self.size, self.total_cost, self.hit_rate, self.hits, self.misses
        )
    }
}

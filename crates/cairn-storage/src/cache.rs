//! LRU cache layer for object stores.
//!
//! Wraps any [`ObjectStore`] so that hot objects (recent commits and trees
//! walked during negotiation) are served from memory.

use crate::{GitObject, ObjectId, ObjectStore, Result};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Configuration for the cache layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of objects to cache.
    pub max_objects: usize,
    /// Maximum total size in bytes.
    pub max_size_bytes: usize,
    /// Whether to cache on write (write-through).
    pub write_through: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_objects: 10_000,
            max_size_bytes: 64 * 1024 * 1024, // 64 MB
            write_through: true,
        }
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of evictions.
    pub evictions: u64,
    /// Current number of cached objects.
    pub size: usize,
    /// Current memory usage in bytes.
    pub memory_bytes: usize,
}

impl CacheStats {
    /// Returns the cache hit ratio.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

struct CacheInner {
    entries: LruCache<ObjectId, GitObject>,
    bytes: usize,
}

/// Read-through object cache over another store.
pub struct CachedStore<S> {
    inner: S,
    cache: Mutex<CacheInner>,
    config: CacheConfig,
    metrics: CacheMetrics,
}

impl<S> std::fmt::Debug for CachedStore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S: ObjectStore> CachedStore<S> {
    /// Creates a new cached store wrapper.
    pub fn new(inner: S, config: CacheConfig) -> Self {
        let max_objects = NonZeroUsize::new(config.max_objects).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            cache: Mutex::new(CacheInner {
                entries: LruCache::new(max_objects),
                bytes: 0,
            }),
            config,
            metrics: CacheMetrics::default(),
        }
    }

    /// Creates a cached store with default configuration.
    pub fn with_defaults(inner: S) -> Self {
        Self::new(inner, CacheConfig::default())
    }

    /// Returns the underlying store.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Returns current cache statistics.
    pub fn stats(&self) -> CacheStats {
        let cache = self.cache.lock();
        CacheStats {
            hits: self.metrics.hits.load(Ordering::Relaxed),
            misses: self.metrics.misses.load(Ordering::Relaxed),
            evictions: self.metrics.evictions.load(Ordering::Relaxed),
            size: cache.entries.len(),
            memory_bytes: cache.bytes,
        }
    }

    /// Clears the cache.
    pub fn clear(&self) {
        let mut cache = self.cache.lock();
        cache.entries.clear();
        cache.bytes = 0;
    }

    /// Drops a single object from the cache.
    pub fn invalidate(&self, id: &ObjectId) {
        let mut cache = self.cache.lock();
        if let Some(obj) = cache.entries.pop(id) {
            cache.bytes -= obj.size();
        }
    }

    fn cache_put(&self, object: &GitObject) {
        let size = object.size();
        if size > self.config.max_size_bytes {
            return;
        }

        let mut cache = self.cache.lock();
        if cache.entries.contains(&object.id) {
            cache.entries.promote(&object.id);
            return;
        }

        while cache.bytes + size > self.config.max_size_bytes
            || cache.entries.len() == cache.entries.cap().get()
        {
            match cache.entries.pop_lru() {
                Some((_, evicted)) => {
                    cache.bytes -= evicted.size();
                    self.metrics.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }

        cache.entries.put(object.id, object.clone());
        cache.bytes += size;
    }
}

impl<S: ObjectStore> ObjectStore for CachedStore<S> {
    fn put(&self, object: GitObject) -> Result<ObjectId> {
        let id = self.inner.put(object.clone())?;
        if self.config.write_through {
            self.cache_put(&object);
        }
        Ok(id)
    }

    fn get(&self, id: &ObjectId) -> Result<GitObject> {
        if let Some(obj) = self.cache.lock().entries.get(id).cloned() {
            self.metrics.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(obj);
        }
        self.metrics.misses.fetch_add(1, Ordering::Relaxed);

        let obj = self.inner.get(id)?;
        self.cache_put(&obj);
        Ok(obj)
    }

    fn contains(&self, id: &ObjectId) -> Result<bool> {
        if self.cache.lock().entries.contains(id) {
            return Ok(true);
        }
        self.inner.contains(id)
    }

    fn len(&self) -> Result<usize> {
        self.inner.len()
    }

    fn list_objects(&self) -> Result<Vec<ObjectId>> {
        self.inner.list_objects()
    }
}

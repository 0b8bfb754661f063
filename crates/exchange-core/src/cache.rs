//! In-memory cache with TTL freshness and LRU eviction.
//!
//! Used by the gateway for candle series and symbol metadata and by the
//! sentiment adapter. An entry older than the TTL is a miss even while it is
//! still stored; capacity pressure evicts the least-recently-accessed entry
//! whether or not it has expired.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    last_access: u64,
}

/// Counters for monitoring cache effectiveness.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl CacheMetrics {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Inner<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    /// Logical clock for recency; bumped on every insert and hit.
    clock: u64,
    metrics: CacheMetrics,
}

pub struct TtlCache<K, V> {
    ttl: Duration,
    capacity: usize,
    inner: Mutex<Inner<K, V>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                clock: 0,
                metrics: CacheMetrics::default(),
            }),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<K, V>> {
        // A poisoned lock only means another thread panicked mid-update of
        // plain data; the map itself is still usable.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Look up a fresh value. Counts as an access for recency.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.clock += 1;
        let clock = inner.clock;

        let expired = match inner.entries.get_mut(key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                entry.last_access = clock;
                let value = entry.value.clone();
                inner.metrics.hits += 1;
                return Some(value);
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            inner.entries.remove(key);
            inner.metrics.expirations += 1;
        }
        inner.metrics.misses += 1;
        None
    }

    pub fn insert(&self, key: K, value: V) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.clock += 1;
        let clock = inner.clock;

        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.capacity {
            let lru_key = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone());
            if let Some(lru_key) = lru_key {
                inner.entries.remove(&lru_key);
                inner.metrics.evictions += 1;
                trace!("Evicted least-recently-used cache entry");
            }
        }

        inner.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
                last_access: clock,
            },
        );
    }

    pub fn invalidate(&self, key: &K) {
        self.lock().entries.remove(key);
    }

    /// Whether the key is stored, fresh or not. Does not touch recency.
    pub fn contains(&self, key: &K) -> bool {
        self.lock().entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn metrics(&self) -> CacheMetrics {
        self.lock().metrics.clone()
    }

    /// Return the cached value or run `fetch` and cache its result.
    ///
    /// The lock is not held across the fetch, so two concurrent misses for the
    /// same key may both fetch; the later insert wins.
    pub async fn get_or_fetch<F, Fut, E>(&self, key: K, fetch: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }
        let value = fetch().await?;
        self.insert(key, value.clone());
        Ok(value)
    }
}


use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

/// Bounded, TTL-aware cache shared across the process.
///
/// Entries are visible only while `now < inserted_at + ttl`; expired entries
/// are dropped lazily on lookup, and capacity pressure evicts the
/// least-recently-used live entry. All state sits behind a single mutex so a
/// reader observes an entry either fully written or not at all.
#[derive(Debug)]
pub struct CacheLayer<V> {
    inner: Mutex<CacheInner<V>>,
    capacity: usize,
}

#[derive(Debug)]
struct CacheInner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    tick: u64,
}

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    ttl: Duration,
    last_used: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) >= self.ttl
    }
}

impl<V: Clone> CacheLayer<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                tick: 0,
            }),
            capacity: capacity.max(1),
        }
    }

    /// Look up a key, returning the value only while it is within its TTL.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut inner = self.lock();

        if inner.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            inner.entries.remove(key);
            debug!("cache entry expired: {}", key);
            return None;
        }

        inner.tick += 1;
        let tick = inner.tick;
        inner.entries.get_mut(key).map(|entry| {
            entry.last_used = tick;
            entry.value.clone()
        })
    }

    /// Insert a value with its own TTL, evicting the least-recently-used
    /// live entry if the cache is over capacity.
    pub fn put(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.tick += 1;
        let tick = inner.tick;

        inner.entries.insert(
            key.into(),
            CacheEntry {
                value,
                inserted_at: now,
                ttl,
                last_used: tick,
            },
        );

        if inner.entries.len() > self.capacity {
            inner.entries.retain(|_, entry| !entry.is_expired(now));
        }

        while inner.entries.len() > self.capacity {
            let Some(lru_key) = inner
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone())
            else {
                break;
            };
            debug!("evicting LRU cache entry: {}", lru_key);
            inner.entries.remove(&lru_key);
        }
    }

    pub fn invalidate(&self, key: &str) {
        self.lock().entries.remove(key);
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    /// Number of resident entries, including any not yet lazily expired.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner<V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

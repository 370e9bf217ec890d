//! Striped TTL cache with least-recently-used eviction.
//!
//! Keys hash to one of N independent shards, each an `LruCache` behind its own
//! `parking_lot::Mutex`. Entries never need cross-shard locking, so readers of
//! unrelated keys do not contend. An entry past its TTL is treated as absent
//! and removed on the read that discovers it; `evict_expired` sweeps the rest.

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// A cached value with its insertion time and time-to-live.
#[derive(Debug, Clone)]
pub struct CachedEntry<V> {
    /// The cached value.
    pub value: V,
    /// When the value was inserted.
    pub inserted_at: Instant,
    /// How long the value stays fresh.
    pub ttl: Duration,
}

impl<V> CachedEntry<V> {
    /// Whether the entry is stale at `now`.
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) >= self.ttl
    }
}

/// Snapshot of cache effectiveness.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Lookups that found nothing fresh.
    pub misses: u64,
    /// Entries pushed out by capacity pressure.
    pub evictions: u64,
    /// Entries dropped because their TTL elapsed.
    pub expirations: u64,
    /// Entries currently held.
    pub size: usize,
    /// Total capacity across shards.
    pub capacity: usize,
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

/// Bounded, sharded cache whose entries expire after a fixed TTL.
pub struct TtlCache<K, V> {
    shards: Box<[Mutex<LruCache<K, CachedEntry<V>>>]>,
    hasher: RandomState,
    ttl: Duration,
    capacity: usize,
    counters: CacheCounters,
}

impl<K, V> TtlCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Create a cache holding about `capacity` entries spread over `shards` shards.
    ///
    /// Zero values are raised to one.
    #[must_use]
    pub fn new(capacity: usize, shards: usize, ttl: Duration) -> Self {
        let shard_count = shards.clamp(1, capacity.max(1));
        let per_shard = NonZeroUsize::new(capacity.max(1).div_ceil(shard_count))
            .unwrap_or(NonZeroUsize::MIN);
        let shards = (0..shard_count)
            .map(|_| Mutex::new(LruCache::new(per_shard)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            shards,
            hasher: RandomState::new(),
            ttl,
            capacity: per_shard.get() * shard_count,
            counters: CacheCounters::default(),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn shard(&self, key: &K) -> &Mutex<LruCache<K, CachedEntry<V>>> {
        let idx = (self.hasher.hash_one(key) as usize) % self.shards.len();
        &self.shards[idx]
    }

    /// Fresh value for `key`, if any. Counts a hit or a miss.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut shard = self.shard(key).lock();
        let fresh = match shard.get(key) {
            Some(entry) if !entry.is_expired(now) => Some(entry.value.clone()),
            Some(_) => {
                shard.pop(key);
                self.counters.expirations.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => None,
        };
        drop(shard);

        if fresh.is_some() {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
        }
        fresh
    }

    /// Insert or replace `key`, evicting the least recently used entry of its shard if full.
    pub fn insert(&self, key: K, value: V) {
        let entry = CachedEntry {
            value,
            inserted_at: Instant::now(),
            ttl: self.ttl,
        };
        let mut shard = self.shard(&key).lock();
        let evicting = !shard.contains(&key) && shard.len() == shard.cap().get();
        shard.put(key, entry);
        drop(shard);
        if evicting {
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Cached value for `key`, computing and caching it on a miss.
    ///
    /// `compute` runs without any shard lock held; two racing misses may both compute.
    pub fn get_or_insert_with<F>(&self, key: K, compute: F) -> V
    where
        F: FnOnce() -> V,
    {
        if let Some(value) = self.get(&key) {
            return value;
        }
        let value = compute();
        self.insert(key, value.clone());
        value
    }

    /// Drop `key`. Returns whether it was present.
    pub fn invalidate(&self, key: &K) -> bool {
        self.shard(key).lock().pop(key).is_some()
    }

    /// Drop every entry whose key matches `predicate`. Returns how many were dropped.
    pub fn invalidate_where<P>(&self, predicate: P) -> usize
    where
        P: Fn(&K) -> bool,
    {
        let mut removed = 0;
        for shard in &*self.shards {
            let mut shard = shard.lock();
            let doomed: Vec<K> = shard
                .iter()
                .filter(|(k, _)| predicate(k))
                .map(|(k, _)| k.clone())
                .collect();
            for key in &doomed {
                shard.pop(key);
            }
            removed += doomed.len();
        }
        removed
    }

    /// Remove every stale entry. Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        for shard in &*self.shards {
            let mut shard = shard.lock();
            let stale: Vec<K> = shard
                .iter()
                .filter(|(_, e)| e.is_expired(now))
                .map(|(k, _)| k.clone())
                .collect();
            for key in &stale {
                shard.pop(key);
            }
            removed += stale.len();
        }
        self.counters
            .expirations
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Drop everything.
    pub fn clear(&self) {
        for shard in &*self.shards {
            shard.lock().clear();
        }
    }

    /// Entries currently held, fresh or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    /// Whether the cache holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured time-to-live.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            size: self.len(),
            capacity: self.capacity,
        }
    }
}

impl<K, V> std::fmt::Debug for TtlCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlCache")
            .field("shards", &self.shards.len())
            .field("capacity", &self.capacity)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

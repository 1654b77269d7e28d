//! Bounded TTL cache with approximate LRU eviction.
//!
//! Backs both the permission-set cache and the decision cache. Entries live in
//! a [`DashMap`], so readers only contend with writers on the same shard and a
//! miss on one key never blocks readers of another. Values are handed out as
//! clones (callers store `Arc`s or small `Copy`-like values), so a reader
//! never observes a half-written entry.
//!
//! ## Eviction
//!
//! Each entry carries an expiry instant and a `last_accessed` stamp taken
//! from a monotonic counter. Expired entries are dropped when they are read.
//! When the cache is full, a handful of entries are sampled and the expired or
//! least-recently-used one is evicted, which keeps eviction O(sample size).

use std::{
    hash::Hash,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use dashmap::DashMap;
use tokio::time::Instant;

/// Entries sampled when looking for an eviction victim.
const EVICTION_SAMPLE_SIZE: usize = 8;

struct CachedEntry<V> {
    value: V,
    expires_at: Instant,
    last_accessed: AtomicU64,
}

pub struct TtlCache<K, V> {
    name: &'static str,
    map: DashMap<K, CachedEntry<V>>,
    ttl: Duration,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    access_counter: AtomicU64,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// `name` labels the cache in metrics.
    pub fn new(name: &'static str, ttl: Duration, max_entries: usize) -> Self {
        Self {
            name,
            map: DashMap::with_capacity(max_entries.min(1024)),
            ttl,
            max_entries: max_entries.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            access_counter: AtomicU64::new(0),
        }
    }

    #[inline]
    fn next_timestamp(&self) -> u64 {
        self.access_counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Look up a live entry. Expired entries count as misses and are removed.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let hit = match self.map.get(key) {
            Some(entry) if entry.expires_at > now => {
                let ts = self.next_timestamp();
                entry.last_accessed.store(ts, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            Some(_) => None,
            None => {
                self.record_miss();
                return None;
            }
        };

        match hit {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("aviso_auth_cache_lookups_total", "cache" => self.name, "result" => "hit")
                    .increment(1);
                Some(value)
            }
            None => {
                // Shard guard is released above; re-check expiry under the write lock
                // so a fresh concurrent insert is not thrown away.
                self.map.remove_if(key, |_, entry| entry.expires_at <= now);
                self.record_miss();
                None
            }
        }
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("aviso_auth_cache_lookups_total", "cache" => self.name, "result" => "miss")
            .increment(1);
    }

    /// Insert or replace an entry; it expires one TTL from now.
    pub fn insert(&self, key: K, value: V) {
        if !self.map.contains_key(&key) {
            self.maybe_evict();
        }
        let ts = self.next_timestamp();
        let entry = CachedEntry {
            value,
            expires_at: Instant::now() + self.ttl,
            last_accessed: AtomicU64::new(ts),
        };
        self.map.insert(key, entry);
    }

    fn maybe_evict(&self) {
        if self.map.len() < self.max_entries {
            return;
        }

        // Scope the iterator so shard read-locks are released before remove().
        let key_to_remove = {
            let now = Instant::now();
            let mut oldest_key: Option<K> = None;
            let mut oldest_ts = u64::MAX;

            for (i, entry) in self.map.iter().enumerate() {
                if entry.value().expires_at <= now {
                    oldest_key = Some(entry.key().clone());
                    break;
                }
                let ts = entry.value().last_accessed.load(Ordering::Relaxed);
                if ts < oldest_ts {
                    oldest_ts = ts;
                    oldest_key = Some(entry.key().clone());
                }
                if i + 1 >= EVICTION_SAMPLE_SIZE {
                    break;
                }
            }
            oldest_key
        };

        if let Some(k) = key_to_remove {
            self.map.remove(&k);
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total_requests = hits + misses;

        CacheStats {
            hits,
            misses,
            entries: self.len(),
            hit_rate: if total_requests > 0 {
                hits as f64 / total_requests as f64
            } else {
                0.0
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub hit_rate: f64,
}

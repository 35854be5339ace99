//! In-memory cache store keyed by scope.
//!
//! A bounded table of `(payload, fetched_at, server_timestamp)` entries. All
//! operations are synchronous and never suspend, so a read-check-write step
//! performed by one task cannot interleave with another task's step.
//!
//! # Eviction
//!
//! Entries live until invalidated, but the table is capped: once
//! `max_entries` is exceeded the least-recently-used entry is dropped. An
//! optional TTL makes entries older than the limit read as absent.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use indexmap::IndexMap;
use tessera_core::{CacheLimits, RemoteTimestamp, ScopeKey, Timestamp};

/// A cached materialization of one scope.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<P> {
    pub payload: P,
    /// Local time of the fetch that produced this entry.
    pub fetched_at: Timestamp,
    /// Max remote mutation timestamp observed in `payload`; the staleness
    /// baseline.
    pub server_timestamp: Option<RemoteTimestamp>,
}

impl<P> CacheEntry<P> {
    pub fn new(payload: P, server_timestamp: Option<RemoteTimestamp>) -> Self {
        Self {
            payload,
            fetched_at: Utc::now(),
            server_timestamp,
        }
    }

    /// Time since the entry was fetched.
    pub fn age(&self) -> Duration {
        Utc::now()
            .signed_duration_since(self.fetched_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses (including expired entries).
    pub misses: u64,
    /// Number of entries currently in cache.
    pub entry_count: u64,
    /// Number of evictions due to capacity.
    pub evictions: u64,
    /// Number of entries dropped because their TTL elapsed.
    pub expirations: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct StoreInner<P> {
    /// Insertion order doubles as recency order: the back is most recent.
    entries: IndexMap<ScopeKey, CacheEntry<P>>,
    stats: CacheStats,
}

pub struct CacheStore<P> {
    inner: Mutex<StoreInner<P>>,
    limits: CacheLimits,
}

impl<P: Clone> CacheStore<P> {
    pub fn new(limits: CacheLimits) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                entries: IndexMap::new(),
                stats: CacheStats::default(),
            }),
            limits,
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner<P>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up an entry, marking it most recently used.
    pub fn get(&self, key: &ScopeKey) -> Option<CacheEntry<P>> {
        let ttl = self.limits.entry_ttl();
        let mut inner = self.lock();
        let Some(index) = inner.entries.get_index_of(key) else {
            inner.stats.misses += 1;
            return None;
        };

        if ttl.is_some_and(|ttl| inner.entries[index].age() > ttl) {
            inner.entries.shift_remove_index(index);
            inner.stats.expirations += 1;
            inner.stats.misses += 1;
            tracing::debug!(scope = %key, "Cache entry expired");
            return None;
        }

        let last = inner.entries.len() - 1;
        inner.entries.move_index(index, last);
        inner.stats.hits += 1;
        Some(inner.entries[last].clone())
    }

    /// Look up an entry without touching recency or statistics.
    pub fn peek(&self, key: &ScopeKey) -> Option<CacheEntry<P>> {
        self.lock().entries.get(key).cloned()
    }

    /// Store a freshly fetched payload, overwriting unconditionally.
    pub fn set(&self, key: ScopeKey, payload: P, server_timestamp: Option<RemoteTimestamp>) {
        self.insert_entry(key, CacheEntry::new(payload, server_timestamp));
    }

    /// Store a fully formed entry, overwriting unconditionally.
    pub fn insert_entry(&self, key: ScopeKey, entry: CacheEntry<P>) {
        let max_entries = self.limits.max_entries;
        let mut inner = self.lock();
        let (index, _) = inner.entries.insert_full(key, entry);
        let last = inner.entries.len() - 1;
        inner.entries.move_index(index, last);

        while inner.entries.len() > max_entries {
            if let Some((evicted, _)) = inner.entries.shift_remove_index(0) {
                inner.stats.evictions += 1;
                tracing::debug!(scope = %evicted, "Evicted least recently used cache entry");
            }
        }
    }

    pub fn delete(&self, key: &ScopeKey) -> bool {
        self.lock().entries.shift_remove(key).is_some()
    }

    /// Drop every entry, returning how many were removed.
    pub fn clear(&self) -> usize {
        let mut inner = self.lock();
        let removed = inner.entries.len();
        inner.entries.clear();
        removed
    }

    /// Keys in least- to most-recently-used order.
    pub fn keys(&self) -> Vec<ScopeKey> {
        self.lock().entries.keys().cloned().collect()
    }

    pub fn contains(&self, key: &ScopeKey) -> bool {
        self.lock().entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            entry_count: inner.entries.len() as u64,
            ..inner.stats.clone()
        }
    }
}

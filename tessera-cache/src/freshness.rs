//! Freshness contracts for cache reads.
//!
//! This module defines the read policy callers choose when querying through
//! the coordinator, making cache semantics explicit.

use chrono::Utc;
use std::time::Duration;

use tessera_core::{RemoteTimestamp, Timestamp};

use crate::store::CacheEntry;

/// Read policy for a cache-first query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Freshness {
    /// Validate a cache hit against the remote store before serving it.
    ///
    /// The staleness oracle probes the scope's mutation timestamps; any newer
    /// remote write (or a failed probe) falls through to a full fetch.
    #[default]
    Consistent,

    /// Serve a cache hit without probing if it was fetched within
    /// `max_staleness`; older hits are validated as with `Consistent`.
    ///
    /// Use this when:
    /// - The same scope is read many times in a short burst
    /// - Realtime subscriptions already keep the scope convergent
    BestEffort {
        /// Maximum age of a hit served without validation.
        max_staleness: Duration,
    },

    /// Skip the cache and fetch, even if an entry exists.
    Refresh,
}

impl Freshness {
    pub fn best_effort(max_staleness: Duration) -> Self {
        Self::BestEffort { max_staleness }
    }

    pub fn force_refresh() -> Self {
        Self::Refresh
    }

    pub fn is_refresh(&self) -> bool {
        matches!(self, Self::Refresh)
    }

    pub fn is_consistent(&self) -> bool {
        matches!(self, Self::Consistent)
    }
}

/// Result of a coordinator query, carrying freshness metadata.
#[derive(Debug, Clone)]
pub struct CacheRead<T> {
    value: T,
    /// When this value was fetched from the remote store.
    fetched_at: Timestamp,
    /// Max remote mutation timestamp reflected by `value`.
    server_timestamp: Option<RemoteTimestamp>,
    was_cache_hit: bool,
}

impl<T> CacheRead<T> {
    /// A validated (or trusted) cache hit.
    pub fn from_cache(
        value: T,
        fetched_at: Timestamp,
        server_timestamp: Option<RemoteTimestamp>,
    ) -> Self {
        Self {
            value,
            fetched_at,
            server_timestamp,
            was_cache_hit: true,
        }
    }

    /// A fresh remote fetch.
    pub fn from_remote(value: T, server_timestamp: Option<RemoteTimestamp>) -> Self {
        Self::fetched(value, Utc::now(), server_timestamp)
    }

    /// A remote fetch that completed at `fetched_at`.
    pub fn fetched(
        value: T,
        fetched_at: Timestamp,
        server_timestamp: Option<RemoteTimestamp>,
    ) -> Self {
        Self {
            value,
            fetched_at,
            server_timestamp,
            was_cache_hit: false,
        }
    }

    pub fn into_value(self) -> T {
        self.value
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn fetched_at(&self) -> Timestamp {
        self.fetched_at
    }

    pub fn server_timestamp(&self) -> Option<RemoteTimestamp> {
        self.server_timestamp
    }

    pub fn was_cache_hit(&self) -> bool {
        self.was_cache_hit
    }

    pub fn was_cache_miss(&self) -> bool {
        !self.was_cache_hit
    }

    /// How long ago the underlying data was fetched.
    pub fn age(&self) -> Duration {
        Utc::now()
            .signed_duration_since(self.fetched_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    pub fn map<U, F>(self, f: F) -> CacheRead<U>
    where
        F: FnOnce(T) -> U,
    {
        CacheRead {
            value: f(self.value),
            fetched_at: self.fetched_at,
            server_timestamp: self.server_timestamp,
            was_cache_hit: self.was_cache_hit,
        }
    }
}

impl<T> AsRef<T> for CacheRead<T> {
    fn as_ref(&self) -> &T {
        &self.value
    }
}

impl<T> From<CacheRead<T>> for CacheEntry<T> {
    fn from(read: CacheRead<T>) -> Self {
        CacheEntry {
            payload: read.value,
            fetched_at: read.fetched_at,
            server_timestamp: read.server_timestamp,
        }
    }
}

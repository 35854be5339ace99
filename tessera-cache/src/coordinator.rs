//! Cache-first query coordination.
//!
//! [`QueryCoordinator`] routes a read according to its [`Freshness`]:
//! validated cache hits are served without a fetch, everything else goes to
//! the remote store through the fetch deduplicator and the read throttle and
//! is written through to the [`CacheStore`] before it is returned.

use std::sync::Arc;

use tessera_core::{Payload, QueryDescriptor, RemoteStore, ScopeKey, TesseraResult};

use crate::dedup::Deduplicator;
use crate::freshness::{CacheRead, Freshness};
use crate::staleness::{RemoteProbeOracle, StalenessOracle};
use crate::store::{CacheEntry, CacheStore};
use crate::throttle::Throttler;
use crate::watermark::Watermark;

/// Cache store holding materialized payloads of `R`'s documents.
pub type PayloadCache<R> = CacheStore<Payload<<R as RemoteStore>::Doc>>;

pub struct QueryCoordinator<R: RemoteStore> {
    remote: Arc<R>,
    cache: Arc<PayloadCache<R>>,
    oracle: Arc<dyn StalenessOracle>,
    throttle: Arc<Throttler>,
    fetches: Deduplicator<CacheEntry<Payload<R::Doc>>>,
}

impl<R: RemoteStore> QueryCoordinator<R> {
    /// Coordinator validating hits with [`RemoteProbeOracle`] over the same
    /// remote store and read throttle.
    pub fn new(remote: Arc<R>, cache: Arc<PayloadCache<R>>, throttle: Arc<Throttler>) -> Self {
        let oracle = Arc::new(RemoteProbeOracle::new(
            Arc::clone(&remote),
            Arc::clone(&throttle),
        ));
        Self::with_oracle(remote, cache, oracle, throttle)
    }

    pub fn with_oracle(
        remote: Arc<R>,
        cache: Arc<PayloadCache<R>>,
        oracle: Arc<dyn StalenessOracle>,
        throttle: Arc<Throttler>,
    ) -> Self {
        Self {
            remote,
            cache,
            oracle,
            throttle,
            fetches: Deduplicator::new("fetch"),
        }
    }

    /// Read a scope cache-first.
    ///
    /// A failed fetch propagates its error and leaves the cache untouched.
    pub async fn query(
        &self,
        key: &ScopeKey,
        query: &QueryDescriptor,
        freshness: Freshness,
    ) -> TesseraResult<CacheRead<Payload<R::Doc>>> {
        if !freshness.is_refresh() {
            if let Some(entry) = self.cache.get(key) {
                if let Freshness::BestEffort { max_staleness } = freshness {
                    if entry.age() <= max_staleness {
                        tracing::debug!(scope = %key, "Serving recent cache entry without probe");
                        return Ok(Self::hit(entry));
                    }
                }

                let watermark = Watermark::of_entry(&entry);
                if !self.oracle.is_stale(key, query, watermark).await {
                    tracing::debug!(scope = %key, "Cache hit validated");
                    return Ok(Self::hit(entry));
                }
                tracing::debug!(scope = %key, "Cache entry stale; refetching");
            } else {
                tracing::debug!(scope = %key, "Cache miss");
            }
        }

        let entry = self.fetch(key, query, freshness.is_refresh()).await?;
        Ok(CacheRead::fetched(
            entry.payload,
            entry.fetched_at,
            entry.server_timestamp,
        ))
    }

    /// Fetch a scope from the remote store and write it through.
    ///
    /// With `fresh`, an in-flight fetch that started before this call is
    /// never joined.
    pub async fn fetch(
        &self,
        key: &ScopeKey,
        query: &QueryDescriptor,
        fresh: bool,
    ) -> TesseraResult<CacheEntry<Payload<R::Doc>>> {
        let remote = Arc::clone(&self.remote);
        let cache = Arc::clone(&self.cache);
        let throttle = Arc::clone(&self.throttle);
        let query = query.clone();
        let scope = key.clone();

        let call = move || async move {
            let payload = match throttle.run(|| remote.fetch(&query)).await {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::warn!(scope = %scope, error = %e, "Remote fetch failed");
                    return Err(e);
                }
            };
            let server_timestamp = payload.server_timestamp();
            let entry = CacheEntry::new(payload, server_timestamp);
            tracing::debug!(
                scope = %scope,
                server_timestamp = ?server_timestamp,
                documents = entry.payload.len(),
                "Fetched scope"
            );
            cache.insert_entry(scope, entry.clone());
            Ok(entry)
        };

        if fresh {
            self.fetches.dedupe_fresh(key.as_str(), call).await
        } else {
            self.fetches.dedupe(key.as_str(), call).await
        }
    }

    /// Confirm a scope against remote state read no earlier than this call.
    ///
    /// Waits out a fetch already in flight, then checks the cached entry with
    /// a probe started after the call, refetching when the entry is missing
    /// or stale. Returns the new entry when one was fetched.
    pub async fn revalidate(
        &self,
        key: &ScopeKey,
        query: &QueryDescriptor,
    ) -> TesseraResult<Option<CacheEntry<Payload<R::Doc>>>> {
        self.fetches.settled(key.as_str()).await;

        if let Some(entry) = self.cache.get(key) {
            let watermark = Watermark::of_entry(&entry);
            if !self.oracle.is_stale_now(key, query, watermark).await {
                tracing::debug!(scope = %key, "Cache entry confirmed");
                return Ok(None);
            }
        }

        self.fetch(key, query, true).await.map(Some)
    }

    /// Drop the cache entry for `key`. Returns whether one existed.
    pub fn invalidate(&self, key: &ScopeKey) -> bool {
        let removed = self.cache.delete(key);
        if removed {
            tracing::debug!(scope = %key, "Invalidated cache entry");
        }
        removed
    }

    pub fn cache(&self) -> &Arc<PayloadCache<R>> {
        &self.cache
    }

    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    pub fn fetches_in_flight(&self) -> usize {
        self.fetches.in_flight_count()
    }

    fn hit(entry: CacheEntry<Payload<R::Doc>>) -> CacheRead<Payload<R::Doc>> {
        CacheRead::from_cache(entry.payload, entry.fetched_at, entry.server_timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::Utc;
    use tessera_core::{CacheLimits, DocumentId, RemoteTimestamp};
    use tessera_test_utils::{
        assertions, fixtures, Card, InMemoryRemoteStore, Library, CARDS, LIBRARIES,
    };

    fn coordinator<D: tessera_test_utils::StoredDocument>(
        remote: &Arc<InMemoryRemoteStore<D>>,
    ) -> QueryCoordinator<InMemoryRemoteStore<D>> {
        QueryCoordinator::new(
            Arc::clone(remote),
            Arc::new(CacheStore::new(CacheLimits {
                max_entries: 64,
                entry_ttl_ms: None,
            })),
            Arc::new(Throttler::new("read", Duration::ZERO)),
        )
    }

    #[tokio::test]
    async fn test_miss_fetches_and_writes_through() {
        let remote = Arc::new(fixtures::seeded_cards("lib-1", 3));
        let coordinator = coordinator(&remote);
        let key = ScopeKey::for_query(&fixtures::cards_in("lib-1"));

        let read = coordinator
            .query(&key, &fixtures::cards_in("lib-1"), Freshness::Consistent)
            .await
            .unwrap();

        assert!(read.was_cache_miss());
        assert_eq!(read.value().len(), 3);
        assert_eq!(read.server_timestamp(), Some(RemoteTimestamp::from_millis(3)));
        let cached = coordinator.cache().peek(&key).unwrap();
        assert_eq!(cached.server_timestamp, Some(RemoteTimestamp::from_millis(3)));
        assert_eq!(remote.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_unchanged_scope_needs_no_refetch() {
        let remote = Arc::new(fixtures::seeded_cards("lib-1", 3));
        let coordinator = coordinator(&remote);
        let query = fixtures::cards_in("lib-1");
        let key = ScopeKey::for_query(&query);

        coordinator.query(&key, &query, Freshness::Consistent).await.unwrap();
        for _ in 0..5 {
            let read = coordinator
                .query(&key, &query, Freshness::Consistent)
                .await
                .unwrap();
            assert!(read.was_cache_hit());
        }

        assert_eq!(remote.fetch_count(), 1);
        assert_eq!(remote.probe_count(), 5);
    }

    #[tokio::test]
    async fn test_stale_read_repaired_by_write_through() {
        let remote = Arc::new(InMemoryRemoteStore::<Library>::new());
        remote.put(LIBRARIES, fixtures::library_42(100));
        let coordinator = coordinator(&remote);
        let key = ScopeKey::new("lib/42");
        let query = fixtures::library_query("42");

        coordinator.query(&key, &query, Freshness::Consistent).await.unwrap();

        // Another client edits the library.
        remote.put(LIBRARIES, fixtures::library_42(150));

        let read = coordinator
            .query(&key, &query, Freshness::Consistent)
            .await
            .unwrap();
        assert!(read.was_cache_miss());
        assert_eq!(read.server_timestamp(), Some(RemoteTimestamp::from_millis(150)));
        assert_eq!(
            coordinator.cache().peek(&key).unwrap().server_timestamp,
            Some(RemoteTimestamp::from_millis(150))
        );
        assert_eq!(remote.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_deletion_detected_by_count() {
        let remote = Arc::new(fixtures::seeded_cards("lib-1", 3));
        let coordinator = coordinator(&remote);
        let query = fixtures::cards_in("lib-1");
        let key = ScopeKey::for_query(&query);

        coordinator.query(&key, &query, Freshness::Consistent).await.unwrap();
        remote.remove(CARDS, &DocumentId::from("c1"));

        let read = coordinator
            .query(&key, &query, Freshness::Consistent)
            .await
            .unwrap();
        assert!(read.was_cache_miss());
        assert_eq!(read.value().len(), 2);
    }

    #[tokio::test]
    async fn test_best_effort_skips_probe_for_recent_entries() {
        let remote = Arc::new(fixtures::seeded_cards("lib-1", 2));
        let coordinator = coordinator(&remote);
        let query = fixtures::cards_in("lib-1");
        let key = ScopeKey::for_query(&query);

        coordinator.query(&key, &query, Freshness::Consistent).await.unwrap();
        let read = coordinator
            .query(&key, &query, Freshness::best_effort(Duration::from_secs(60)))
            .await
            .unwrap();

        assert!(read.was_cache_hit());
        assert_eq!(remote.probe_count(), 0);
    }

    #[tokio::test]
    async fn test_best_effort_validates_old_entries() {
        let remote = Arc::new(fixtures::seeded_cards("lib-1", 2));
        let coordinator = coordinator(&remote);
        let query = fixtures::cards_in("lib-1");
        let key = ScopeKey::for_query(&query);

        let payload = remote.fetch(&query).await.unwrap();
        let mut entry = CacheEntry::new(payload.clone(), payload.server_timestamp());
        entry.fetched_at = Utc::now() - chrono::Duration::seconds(120);
        coordinator.cache().insert_entry(key.clone(), entry);

        let read = coordinator
            .query(&key, &query, Freshness::best_effort(Duration::from_secs(60)))
            .await
            .unwrap();
        assert!(read.was_cache_hit());
        assert_eq!(remote.probe_count(), 1);
    }

    #[tokio::test]
    async fn test_refresh_bypasses_cache() {
        let remote = Arc::new(fixtures::seeded_cards("lib-1", 2));
        let coordinator = coordinator(&remote);
        let query = fixtures::cards_in("lib-1");
        let key = ScopeKey::for_query(&query);

        coordinator.query(&key, &query, Freshness::Consistent).await.unwrap();
        let read = coordinator
            .query(&key, &query, Freshness::force_refresh())
            .await
            .unwrap();

        assert!(read.was_cache_miss());
        assert_eq!(remote.fetch_count(), 2);
        assert_eq!(remote.probe_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_fetch_leaves_cache_untouched() {
        let remote = Arc::new(InMemoryRemoteStore::<Library>::new());
        remote.put(LIBRARIES, fixtures::library_42(100));
        let coordinator = coordinator(&remote);
        let key = ScopeKey::new("lib/42");
        let query = fixtures::library_query("42");

        coordinator.query(&key, &query, Freshness::Consistent).await.unwrap();
        remote.put(LIBRARIES, fixtures::library_42(150));
        remote.fail_next_fetches(1);

        let result = coordinator.query(&key, &query, Freshness::Consistent).await;
        assertions::assert_transient(&result);
        assert_eq!(
            coordinator.cache().peek(&key).unwrap().server_timestamp,
            Some(RemoteTimestamp::from_millis(100))
        );
    }

    #[tokio::test]
    async fn test_probe_failure_refetches() {
        let remote = Arc::new(fixtures::seeded_cards("lib-1", 2));
        let coordinator = coordinator(&remote);
        let query = fixtures::cards_in("lib-1");
        let key = ScopeKey::for_query(&query);

        coordinator.query(&key, &query, Freshness::Consistent).await.unwrap();
        remote.fail_probes(true);
        let read = coordinator
            .query(&key, &query, Freshness::Consistent)
            .await
            .unwrap();

        assert!(read.was_cache_miss());
        assert_eq!(remote.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_not_found_is_a_valid_payload() {
        let remote = Arc::new(InMemoryRemoteStore::<Card>::new());
        let coordinator = coordinator(&remote);
        let query = tessera_core::QueryDescriptor::point(CARDS, "missing");
        let key = ScopeKey::for_query(&query);

        let read = coordinator
            .query(&key, &query, Freshness::Consistent)
            .await
            .unwrap();
        assert_eq!(read.into_value(), Payload::Document(None));
        assert!(coordinator.cache().contains(&key));
    }

    #[tokio::test]
    async fn test_empty_scope_is_refetched_on_every_read() {
        let remote = Arc::new(fixtures::seeded_cards("lib-1", 0));
        let coordinator = coordinator(&remote);
        let query = fixtures::cards_in("lib-1");
        let key = ScopeKey::for_query(&query);

        for _ in 0..2 {
            let read = coordinator
                .query(&key, &query, Freshness::Consistent)
                .await
                .unwrap();
            assert!(read.value().is_empty());
            assert_eq!(read.server_timestamp(), None);
        }

        assert_eq!(remote.fetch_count(), 2);
        assert_eq!(remote.probe_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_misses_share_one_fetch() {
        let remote = Arc::new(fixtures::seeded_cards("lib-1", 4));
        remote.set_latency(Some(Duration::from_millis(30)));
        let coordinator = coordinator(&remote);
        let query = fixtures::cards_in("lib-1");
        let key = ScopeKey::for_query(&query);

        let reads = futures_util::future::join_all(
            (0..8).map(|_| coordinator.query(&key, &query, Freshness::Consistent)),
        )
        .await;

        assert_eq!(remote.fetch_count(), 1);
        let first = reads[0].as_ref().unwrap().value().clone();
        assert!(reads.iter().all(|r| r.as_ref().unwrap().value() == &first));
        assert_eq!(coordinator.fetches_in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_query_still_writes_through() {
        let remote = Arc::new(fixtures::seeded_cards("lib-1", 2));
        remote.set_latency(Some(Duration::from_millis(100)));
        let coordinator = coordinator(&remote);
        let query = fixtures::cards_in("lib-1");
        let key = ScopeKey::for_query(&query);

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            coordinator.query(&key, &query, Freshness::Consistent),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(coordinator.fetches_in_flight(), 0);
        assert_eq!(coordinator.cache().peek(&key).unwrap().payload.len(), 2);

        remote.set_latency(None);
        let read = coordinator
            .query(&key, &query, Freshness::Consistent)
            .await
            .unwrap();
        assert!(!read.was_cache_miss());
        assert_eq!(remote.fetch_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_revalidate_waits_out_older_fetch() {
        let remote = Arc::new(fixtures::seeded_cards("lib-1", 1));
        remote.set_latency(Some(Duration::from_millis(50)));
        let coordinator = coordinator(&remote);
        let query = fixtures::cards_in("lib-1");
        let key = ScopeKey::for_query(&query);

        let (first, revalidated) = tokio::join!(
            coordinator.query(&key, &query, Freshness::Consistent),
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                coordinator.revalidate(&key, &query).await
            },
        );

        assert!(first.unwrap().was_cache_miss());
        assert!(revalidated.unwrap().is_none());
        assert_eq!(remote.fetch_count(), 1);
        assert_eq!(remote.probe_count(), 1);
    }

    #[tokio::test]
    async fn test_revalidate_refetches_stale_entry() {
        let remote = Arc::new(fixtures::seeded_cards("lib-1", 2));
        let coordinator = coordinator(&remote);
        let query = fixtures::cards_in("lib-1");
        let key = ScopeKey::for_query(&query);
        coordinator.query(&key, &query, Freshness::Consistent).await.unwrap();
        assert!(coordinator.revalidate(&key, &query).await.unwrap().is_none());

        remote.put(CARDS, Card::new("c3", "lib-1", "late", "back").at(20, None));
        let entry = coordinator.revalidate(&key, &query).await.unwrap().unwrap();

        assert_eq!(entry.payload.len(), 3);
        assert_eq!(coordinator.cache().peek(&key).unwrap().payload.len(), 3);
        assert_eq!(remote.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_invalidate() {
        let remote = Arc::new(fixtures::seeded_cards("lib-1", 1));
        let coordinator = coordinator(&remote);
        let query = fixtures::cards_in("lib-1");
        let key = ScopeKey::for_query(&query);

        coordinator.query(&key, &query, Freshness::Consistent).await.unwrap();
        assert!(coordinator.invalidate(&key));
        assert!(!coordinator.invalidate(&key));

        let read = coordinator
            .query(&key, &query, Freshness::Consistent)
            .await
            .unwrap();
        assert!(read.was_cache_miss());
        assert_eq!(remote.probe_count(), 0);
    }
}

//! Property-Based Tests for Cache Coherence
//!
//! Exercises the assembled [`CoherenceLayer`] against the in-memory remote
//! store from `tessera-test-utils`. Timer-driven properties run on a paused
//! tokio clock so debounce windows and backoff delays are deterministic.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use proptest::prelude::*;
use serde_json::{json, Map, Value};
use tessera_cache::Freshness;
use tessera_core::{new_identity_id, CoherenceConfig, RemoteTimestamp, ScopeKey};
use tessera_sync::{CoherenceLayer, OptimisticPatch, ScopeStatus};
use tessera_test_utils::{
    assertions, fixtures, generators, Card, InMemoryRemoteStore, Library, CARDS, LIBRARIES,
};
use tokio::runtime::Runtime;

// ============================================================================
// TEST CONFIGURATION
// ============================================================================

fn test_runtime() -> Result<Runtime, TestCaseError> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .map_err(|e| TestCaseError::fail(format!("Failed to create runtime: {}", e)))
}

fn layer_with<D: tessera_test_utils::StoredDocument>(
    remote: &Arc<InMemoryRemoteStore<D>>,
    config: CoherenceConfig,
) -> CoherenceLayer<InMemoryRemoteStore<D>> {
    CoherenceLayer::new(new_identity_id(), Arc::clone(remote), config)
        .expect("fast config is valid")
}

fn layer<D: tessera_test_utils::StoredDocument>(
    remote: &Arc<InMemoryRemoteStore<D>>,
) -> CoherenceLayer<InMemoryRemoteStore<D>> {
    layer_with(remote, fixtures::fast_config())
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

fn front_of(view: &tessera_sync::ScopeView<Card>, id: &str) -> Option<String> {
    view.payload
        .as_ref()
        .and_then(|payload| payload.get(&id.into()))
        .map(|card| card.front.clone())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// **Property 1: Cache Correctness**
    ///
    /// For any seeded scope and any number of consistent reads, an unchanged
    /// remote scope is fetched exactly once and every read returns the same
    /// payload.
    #[test]
    fn prop_unchanged_scope_fetched_once(count in 1usize..12, reads in 1usize..8) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let remote = Arc::new(fixtures::seeded_cards("lib-1", count));
            let layer = layer(&remote);
            let query = fixtures::cards_in("lib-1");

            for _ in 0..reads {
                let read = layer.query(&query, Freshness::Consistent).await.unwrap();
                prop_assert_eq!(read.value().len(), count);
            }

            prop_assert_eq!(remote.fetch_count(), 1);
            Ok(())
        })?;
    }

    /// **Property 2: Staleness Detection**
    ///
    /// After another writer updates a cached scope, the next consistent read
    /// performs exactly one fetch and reflects a timestamp at least as new as
    /// the write.
    #[test]
    fn prop_remote_write_detected(cards in generators::arb_cards("lib-1", 8), writes in 1usize..5) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let remote = Arc::new(InMemoryRemoteStore::<Card>::new());
            for card in &cards {
                remote.write(CARDS, card.clone());
            }
            let layer = layer(&remote);
            let query = fixtures::cards_in("lib-1");
            layer.query(&query, Freshness::Consistent).await.unwrap();

            for n in 0..writes {
                let mut edited = cards[n % cards.len()].clone();
                edited.front = format!("edit {n}");
                let written_at = remote.write(CARDS, edited);
                let fetches_before = remote.fetch_count();

                let read = layer.query(&query, Freshness::Consistent).await.unwrap();

                prop_assert_eq!(remote.fetch_count(), fetches_before + 1);
                prop_assert!(read.server_timestamp() >= Some(written_at));
                prop_assert!(read.was_cache_miss());
            }
            Ok(())
        })?;
    }

    /// **Property 3: Deduplication**
    ///
    /// N concurrent reads of an uncached scope share one remote fetch and all
    /// observe identical payloads.
    #[test]
    fn prop_concurrent_misses_share_fetch(count in 1usize..10, readers in 2usize..16) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let remote = Arc::new(fixtures::seeded_cards("lib-1", count));
            remote.set_latency(Some(Duration::from_millis(30)));
            let layer = layer(&remote);
            let query = fixtures::cards_in("lib-1");

            let reads = join_all(
                (0..readers).map(|_| layer.query(&query, Freshness::Consistent)),
            )
            .await;

            prop_assert_eq!(remote.fetch_count(), 1);
            let first = reads[0].as_ref().unwrap().value().clone();
            for read in &reads {
                prop_assert_eq!(read.as_ref().unwrap().value(), &first);
            }
            Ok(())
        })?;
    }

    /// **Property 4: Debounce Collapsing**
    ///
    /// Every burst of change events arriving within one debounce window
    /// causes exactly one re-materialization of the scope.
    #[test]
    fn prop_bursts_collapse(bursts in generators::arb_event_bursts()) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let remote = Arc::new(fixtures::seeded_cards("lib-1", 1));
            let layer = layer(&remote);
            let observation = layer.observe(fixtures::cards_in("lib-1")).await.unwrap();
            settle().await;

            let mut next_id = 100;
            for events in &bursts {
                for _ in 0..*events {
                    next_id += 1;
                    remote.write(CARDS, Card::new(&format!("c{next_id}"), "lib-1", "f", "b"));
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                tokio::time::sleep(Duration::from_millis(600)).await;
            }

            prop_assert_eq!(layer.subscriptions().rematerializations(), bursts.len() as u64);
            let total: usize = bursts.iter().sum();
            prop_assert_eq!(observation.view().payload.map(|p| p.len()), Some(1 + total));
            Ok(())
        })?;
    }

    /// **Property 5: Batch Atomicity**
    ///
    /// A batch failing at any operation leaves nothing observable; retrying
    /// the same batch applies every operation exactly once.
    #[test]
    fn prop_failed_batch_applies_nothing(
        cards in generators::arb_cards("lib-1", 8),
        fail_seed in any::<usize>(),
    ) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let remote = Arc::new(InMemoryRemoteStore::<Card>::new());
            let layer = layer(&remote);
            let fail_at = fail_seed % cards.len();

            for card in &cards {
                layer.batch().create(CARDS, card.clone()).unwrap();
            }
            remote.fail_next_commit_at(fail_at);
            let result = layer.commit(&[], &[]).await;

            assertions::assert_batch_commit_failed(&result, cards.len());
            prop_assert!(remote.documents(CARDS).is_empty());
            prop_assert!(layer.batch().is_empty());

            for card in &cards {
                layer.batch().create(CARDS, card.clone()).unwrap();
            }
            let receipt = layer.commit(&[], &[]).await.unwrap();

            prop_assert_eq!(receipt.operations, cards.len());
            prop_assert_eq!(remote.documents(CARDS).len(), cards.len());
            Ok(())
        })?;
    }

    /// **Property 6: Subscription Lifecycle**
    ///
    /// Observing any number of scopes opens one listener each; `reset_all`
    /// leaves zero open subscriptions, an empty cache and empty projection.
    #[test]
    fn prop_reset_closes_every_subscription(libraries in 1usize..10, observers_per_scope in 1usize..4) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let remote = Arc::new(fixtures::seeded_cards("lib-0", 2));
            let layer = layer(&remote);

            let mut observations = Vec::new();
            for lib in 0..libraries {
                for _ in 0..observers_per_scope {
                    let query = fixtures::cards_in(&format!("lib-{lib}"));
                    observations.push(layer.observe(query).await.unwrap());
                }
            }
            settle().await;
            prop_assert_eq!(remote.subscribe_count(), libraries);
            prop_assert_eq!(remote.open_listeners(), libraries);

            let report = layer.reset_all();

            prop_assert_eq!(report.subscriptions_closed, libraries);
            prop_assert_eq!(remote.open_listeners(), 0);
            prop_assert_eq!(layer.subscriptions().open_subscriptions(), 0);
            prop_assert!(layer.cache().is_empty());
            prop_assert!(layer.projection().scopes().is_empty());
            drop(observations);
            Ok(())
        })?;
    }

    /// **Property 7: Observer Reference Counting**
    ///
    /// A scope's listener stays open while any observer remains and closes
    /// exactly once when the last one detaches.
    #[test]
    fn prop_last_observer_closes_listener(observers in 1usize..8) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let remote = Arc::new(fixtures::seeded_cards("lib-1", 1));
            let layer = layer(&remote);
            let query = fixtures::cards_in("lib-1");

            let mut observations = Vec::new();
            for _ in 0..observers {
                observations.push(layer.observe(query.clone()).await.unwrap());
            }
            settle().await;

            while observations.len() > 1 {
                observations.pop();
                prop_assert_eq!(remote.open_listeners(), 1);
            }
            observations.pop();

            prop_assert_eq!(remote.open_listeners(), 0);
            prop_assert_eq!(remote.closed_listeners(), 1);
            prop_assert_eq!(remote.subscribe_count(), 1);
            Ok(())
        })?;
    }
}

// ============================================================================
// SCENARIOS
// ============================================================================

/// A cached library read at updatedAt=100 is repaired once another client
/// writes updatedAt=150.
#[tokio::test(start_paused = true)]
async fn scenario_stale_library_repaired_by_write_through() {
    let remote = Arc::new(InMemoryRemoteStore::<Library>::new());
    remote.put(LIBRARIES, fixtures::library_42(100));
    let layer = layer(&remote);
    let query = fixtures::library_query("42");
    let key = ScopeKey::for_query(&query);

    let first = layer.query(&query, Freshness::Consistent).await.unwrap();
    assert_eq!(first.server_timestamp(), Some(RemoteTimestamp::from_millis(100)));

    remote.put(LIBRARIES, fixtures::library_42(150));
    let second = layer.query(&query, Freshness::Consistent).await.unwrap();

    assert!(second.was_cache_miss());
    assert_eq!(second.server_timestamp(), Some(RemoteTimestamp::from_millis(150)));
    assert_eq!(remote.fetch_count(), 2);
    assert_eq!(
        layer.cache().peek(&key).unwrap().server_timestamp,
        Some(RemoteTimestamp::from_millis(150))
    );

    let third = layer.query(&query, Freshness::Consistent).await.unwrap();
    assert!(third.was_cache_hit());
    assert_eq!(remote.fetch_count(), 2);
}

/// An optimistic `front: "X"` is replaced by the authoritative `"Y"` that
/// another client wrote.
#[tokio::test(start_paused = true)]
async fn scenario_optimistic_value_overwritten_by_authoritative() {
    let remote = Arc::new(fixtures::seeded_cards("lib-1", 2));
    let layer = layer(&remote);
    let observation = layer.observe(fixtures::cards_in("lib-1")).await.unwrap();
    let key = observation.key().clone();
    settle().await;

    let mut local = remote.get(CARDS, &"c1".into()).unwrap();
    local.front = "X".to_string();
    layer.apply_optimistic(&key, OptimisticPatch::Upsert(local.clone()));
    assert_eq!(front_of(&observation.view(), "c1").as_deref(), Some("X"));
    assert_eq!(observation.view().pending_patches, 1);

    let mut other = local;
    other.front = "Y".to_string();
    remote.write(CARDS, other);
    tokio::time::sleep(Duration::from_millis(500)).await;

    let view = observation.view();
    assert_eq!(front_of(&view, "c1").as_deref(), Some("Y"));
    assert_eq!(view.pending_patches, 0);
    assert_eq!(view.status, ScopeStatus::Ready);
}

/// Confirmed local edits stay visible until the refresh brings the same
/// value back authoritatively.
#[tokio::test(start_paused = true)]
async fn scenario_update_commit_confirms_and_refreshes() {
    let remote = Arc::new(fixtures::seeded_cards("lib-1", 2));
    let layer = layer(&remote);
    let observation = layer.observe(fixtures::cards_in("lib-1")).await.unwrap();
    let key = observation.key().clone();
    settle().await;

    let mut edited = remote.get(CARDS, &"c2".into()).unwrap();
    edited.back = "rewritten".to_string();
    let ticket = layer.apply_optimistic(&key, OptimisticPatch::Upsert(edited));

    let mut delta = Map::<String, Value>::new();
    delta.insert("back".to_string(), json!("rewritten"));
    layer.batch().update(CARDS, "c2", delta).unwrap();
    layer.commit(&[ticket], &[key.clone()]).await.unwrap();

    let view = observation.view();
    assert_eq!(view.pending_patches, 0);
    let stored = view.payload.unwrap().get(&"c2".into()).cloned().unwrap();
    assert_eq!(stored.back, "rewritten");
    assert!(stored.updated_at.is_some());
}

// ============================================================================
// FAILURE HANDLING
// ============================================================================

/// A probe that cannot reach the remote store counts as stale.
#[tokio::test(start_paused = true)]
async fn probe_failure_fails_closed() {
    let remote = Arc::new(fixtures::seeded_cards("lib-1", 3));
    let layer = layer(&remote);
    let query = fixtures::cards_in("lib-1");
    layer.query(&query, Freshness::Consistent).await.unwrap();

    remote.fail_probes(true);
    let read = layer.query(&query, Freshness::Consistent).await.unwrap();

    assert!(read.was_cache_miss());
    assert_eq!(remote.fetch_count(), 2);
}

/// A failed first load surfaces `Error`; once data exists a failed refresh
/// keeps showing it.
#[tokio::test(start_paused = true)]
async fn load_errors_with_and_without_cache() {
    let remote = Arc::new(fixtures::seeded_cards("lib-1", 2));
    // The first load and the check once the listener is live both fail.
    remote.fail_next_fetches(2);
    let layer = layer(&remote);
    let observation = layer.observe(fixtures::cards_in("lib-1")).await.unwrap();
    let key = observation.key().clone();
    settle().await;
    assert_eq!(observation.view().status, ScopeStatus::Error);

    layer.force_refresh(&key).await.unwrap();
    assert_eq!(observation.view().status, ScopeStatus::Ready);

    remote.fail_next_fetches(1);
    assertions::assert_transient(&layer.force_refresh(&key).await);
    let view = observation.view();
    assert_eq!(view.status, ScopeStatus::Ready);
    assert_eq!(view.payload.map(|p| p.len()), Some(2));
}

/// A transport drop resubscribes and re-materializes the scope once,
/// picking up writes missed while disconnected.
#[tokio::test(start_paused = true)]
async fn reconnect_rematerializes_once() {
    let remote = Arc::new(fixtures::seeded_cards("lib-1", 2));
    let layer = layer(&remote);
    let observation = layer.observe(fixtures::cards_in("lib-1")).await.unwrap();
    settle().await;

    remote.drop_listeners("connection reset");
    settle().await;
    assert_eq!(observation.view().status, ScopeStatus::Reconnecting);
    remote.put(CARDS, Card::new("c3", "lib-1", "missed", "b").at(30, None));

    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(remote.subscribe_count(), 2);
    assert_eq!(layer.subscriptions().rematerializations(), 1);
    let view = observation.view();
    assert_eq!(view.status, ScopeStatus::Ready);
    assert_eq!(view.payload.map(|p| p.len()), Some(3));
}

/// A write landing after the first load but before the listener is live
/// still reaches the view, without waiting for a later change event.
#[tokio::test(start_paused = true)]
async fn write_before_listener_is_live_is_picked_up() {
    let remote = Arc::new(fixtures::seeded_cards("lib-1", 1));
    remote.set_subscribe_latency(Some(Duration::from_millis(50)));
    let layer = layer(&remote);
    let observation = layer.observe(fixtures::cards_in("lib-1")).await.unwrap();
    assert_eq!(observation.view().payload.map(|p| p.len()), Some(1));

    tokio::time::sleep(Duration::from_millis(10)).await;
    remote.put(CARDS, Card::new("c2", "lib-1", "early", "b").at(20, None));
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(layer.subscriptions().rematerializations(), 0);
    let view = observation.view();
    assert_eq!(view.status, ScopeStatus::Ready);
    assert_eq!(view.payload.map(|p| p.len()), Some(2));
}

/// Resubscription gives up after the configured attempts and shows `Error`.
#[tokio::test(start_paused = true)]
async fn resubscribe_exhaustion_surfaces_error() {
    let remote = Arc::new(fixtures::seeded_cards("lib-1", 2));
    let layer = layer(&remote);
    let observation = layer.observe(fixtures::cards_in("lib-1")).await.unwrap();
    settle().await;

    remote.fail_next_subscribes(10);
    remote.drop_listeners("connection reset");
    tokio::time::sleep(Duration::from_secs(5)).await;

    let view = observation.view();
    assert_eq!(view.status, ScopeStatus::Error);
    assert!(view.error.is_some());
    assert_eq!(view.payload.map(|p| p.len()), Some(2));
    assert_eq!(remote.subscribe_count(), 1 + layer.config().reconnect.max_attempts as usize);
}

/// Invalidate mode drops the cache entry on change; the next read refetches.
#[tokio::test(start_paused = true)]
async fn invalidate_mode_refetches_lazily() {
    let remote = Arc::new(fixtures::seeded_cards("lib-1", 1));
    let mut config = fixtures::fast_config();
    config.rematerialize = tessera_core::RematerializeMode::Invalidate;
    let layer = layer_with(&remote, config);
    let query = fixtures::cards_in("lib-1");
    let _observation = layer.observe(query.clone()).await.unwrap();
    settle().await;

    remote.write(CARDS, Card::new("c2", "lib-1", "f", "b"));
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(layer.cache().is_empty());
    assert_eq!(remote.fetch_count(), 1);

    let read = layer.query(&query, Freshness::Consistent).await.unwrap();
    assert_eq!(read.value().len(), 2);
    assert_eq!(remote.fetch_count(), 2);
}

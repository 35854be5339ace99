//! Session-scoped coherence layer.
//!
//! [`CoherenceLayer`] wires the cache, query coordinator, batch manager,
//! subscription manager and projection for one signed-in identity. Build a
//! new instance per identity, or call [`CoherenceLayer::reset_all`] on sign-out
//! so nothing from the previous identity stays visible.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tessera_cache::{
    BatchMutationManager, CacheRead, CacheStore, CommitReceipt, Freshness, PayloadCache,
    QueryCoordinator, Throttler,
};
use tessera_core::{
    CoherenceConfig, CoherenceError, IdentityId, Payload, QueryDescriptor, RemoteStore, ScopeKey,
    TesseraResult,
};
use tokio::sync::watch;

use crate::projection::{OptimisticPatch, PatchTicket, ReactiveProjection, ScopeView};
use crate::subscription::{SubscriptionGuard, SubscriptionManager, SubscriptionSettings};

/// A live view of one scope. Dropping it detaches the observer.
pub struct Observation<D> {
    pub receiver: watch::Receiver<ScopeView<D>>,
    pub guard: SubscriptionGuard,
}

impl<D: Clone> Observation<D> {
    pub fn key(&self) -> &ScopeKey {
        self.guard.key()
    }

    /// Snapshot of the current view.
    pub fn view(&self) -> ScopeView<D> {
        self.receiver.borrow().clone()
    }

    /// Wait for the next published view. Returns `false` once the scope has
    /// been torn down.
    pub async fn changed(&mut self) -> bool {
        self.receiver.changed().await.is_ok()
    }
}

/// What [`CoherenceLayer::reset_all`] threw away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResetReport {
    pub cache_entries: usize,
    pub subscriptions_closed: usize,
    pub pending_operations_dropped: usize,
    pub scopes_cleared: usize,
}

pub struct CoherenceLayer<R: RemoteStore> {
    identity: IdentityId,
    config: CoherenceConfig,
    coordinator: Arc<QueryCoordinator<R>>,
    batch: BatchMutationManager<R>,
    projection: Arc<ReactiveProjection<R::Doc>>,
    subscriptions: SubscriptionManager<R>,
    registry: Mutex<HashMap<ScopeKey, QueryDescriptor>>,
}

impl<R: RemoteStore> CoherenceLayer<R> {
    pub fn new(identity: IdentityId, remote: Arc<R>, config: CoherenceConfig) -> TesseraResult<Self> {
        config.validate()?;

        let read_throttle = Arc::new(Throttler::new("read", config.throttle.read_spacing()));
        let write_throttle = Arc::new(Throttler::new("write", config.throttle.write_spacing()));
        let cache = Arc::new(CacheStore::new(config.cache.clone()));
        let coordinator = Arc::new(QueryCoordinator::new(
            Arc::clone(&remote),
            cache,
            read_throttle,
        ));
        let batch = BatchMutationManager::new(
            Arc::clone(&remote),
            write_throttle,
            config.max_batch_operations,
        );
        let projection = Arc::new(ReactiveProjection::new());
        let subscriptions = SubscriptionManager::new(
            remote,
            Arc::clone(&coordinator),
            Arc::clone(&projection),
            SubscriptionSettings::from_config(&config),
        );

        tracing::info!(identity = %identity, "Coherence layer ready");
        Ok(Self {
            identity,
            config,
            coordinator,
            batch,
            projection,
            subscriptions,
            registry: Mutex::new(HashMap::new()),
        })
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<ScopeKey, QueryDescriptor>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, key: &ScopeKey, query: &QueryDescriptor) {
        self.registry()
            .entry(key.clone())
            .or_insert_with(|| query.clone());
    }

    pub fn identity(&self) -> IdentityId {
        self.identity
    }

    pub fn config(&self) -> &CoherenceConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<PayloadCache<R>> {
        self.coordinator.cache()
    }

    pub fn coordinator(&self) -> &Arc<QueryCoordinator<R>> {
        &self.coordinator
    }

    pub fn projection(&self) -> &Arc<ReactiveProjection<R::Doc>> {
        &self.projection
    }

    pub fn subscriptions(&self) -> &SubscriptionManager<R> {
        &self.subscriptions
    }

    /// Observe a query under its canonical scope key.
    pub async fn observe(&self, query: QueryDescriptor) -> TesseraResult<Observation<R::Doc>> {
        let key = ScopeKey::for_query(&query);
        self.observe_scope(key, query).await
    }

    /// Observe a query under a caller-chosen scope key.
    ///
    /// The first observer of a scope opens its subscription and loads it;
    /// a load failure shows up in the view rather than as an error here.
    pub async fn observe_scope(
        &self,
        key: ScopeKey,
        query: QueryDescriptor,
    ) -> TesseraResult<Observation<R::Doc>> {
        let guard = self.subscriptions.attach(&key, &query)?;
        self.register(&key, &query);
        let receiver = self.projection.watch(&key);

        let needs_load = receiver.borrow().payload.is_none();
        if needs_load {
            self.projection.set_loading(&key);
            match self.coordinator.query(&key, &query, Freshness::Consistent).await {
                Ok(read) => {
                    self.projection.apply_authoritative(&key, read.into());
                }
                Err(e) => {
                    tracing::warn!(scope = %key, error = %e, "Initial load failed");
                    self.projection.record_failure(&key, e);
                }
            }
        }

        Ok(Observation { receiver, guard })
    }

    pub async fn query(
        &self,
        query: &QueryDescriptor,
        freshness: Freshness,
    ) -> TesseraResult<CacheRead<Payload<R::Doc>>> {
        let key = ScopeKey::for_query(query);
        self.query_scope(&key, query, freshness).await
    }

    /// Read through the coordinator and push the result to the scope's
    /// observers, if it has any.
    pub async fn query_scope(
        &self,
        key: &ScopeKey,
        query: &QueryDescriptor,
        freshness: Freshness,
    ) -> TesseraResult<CacheRead<Payload<R::Doc>>> {
        self.register(key, query);
        let result = self.coordinator.query(key, query, freshness).await;

        if self.projection.is_observed(key) {
            match &result {
                Ok(read) => {
                    let shows_data = self
                        .projection
                        .view(key)
                        .is_some_and(|view| view.payload.is_some());
                    // A validated hit is what observers already show.
                    if read.was_cache_miss() || !shows_data {
                        self.projection.apply_authoritative(key, read.clone().into());
                    }
                }
                Err(e) => self.projection.record_failure(key, e.clone()),
            }
        }
        result
    }

    /// Drop a scope's cache entry. The next read refetches.
    pub fn invalidate(&self, key: &ScopeKey) -> bool {
        self.coordinator.invalidate(key)
    }

    /// Refetch a previously seen scope, bypassing the cache.
    pub async fn force_refresh(&self, key: &ScopeKey) -> TesseraResult<CacheRead<Payload<R::Doc>>> {
        let query = self.registry().get(key).cloned().ok_or_else(|| {
            CoherenceError::UnknownScope {
                scope: key.to_string(),
            }
        })?;
        self.query_scope(key, &query, Freshness::Refresh).await
    }

    pub fn apply_optimistic(&self, key: &ScopeKey, patch: OptimisticPatch<R::Doc>) -> PatchTicket {
        self.projection.apply_optimistic(key, patch)
    }

    /// The pending batch. Enqueue operations here, then [`commit`](Self::commit).
    pub fn batch(&self) -> &BatchMutationManager<R> {
        &self.batch
    }

    /// Commit the pending batch.
    ///
    /// On success the affected scopes are invalidated, `tickets` are
    /// confirmed and observed affected scopes are refreshed. Refresh failures
    /// are logged, not returned. On failure `tickets` are rolled back.
    pub async fn commit(
        &self,
        tickets: &[PatchTicket],
        affected: &[ScopeKey],
    ) -> TesseraResult<CommitReceipt> {
        match self.batch.commit().await {
            Ok(receipt) => {
                for key in affected {
                    self.coordinator.invalidate(key);
                }
                for ticket in tickets {
                    self.projection.confirm(ticket);
                }
                for key in affected {
                    if !self.projection.is_observed(key) {
                        continue;
                    }
                    if let Err(e) = self.force_refresh(key).await {
                        tracing::warn!(scope = %key, error = %e, "Refresh after commit failed");
                    }
                }
                Ok(receipt)
            }
            Err(e) => {
                let reverted = tickets
                    .iter()
                    .filter(|ticket| self.projection.reject(ticket))
                    .count();
                tracing::debug!(reverted, "Rolled back optimistic patches after failed commit");
                Err(e)
            }
        }
    }

    /// Forget everything held for the current identity.
    pub fn reset_all(&self) -> ResetReport {
        let subscriptions_closed = self.subscriptions.close_all();
        let cache_entries = self.coordinator.cache().clear();
        let pending_operations_dropped = self.batch.drain();
        let scopes_cleared = self.projection.clear();
        self.registry().clear();

        let report = ResetReport {
            cache_entries,
            subscriptions_closed,
            pending_operations_dropped,
            scopes_cleared,
        };
        tracing::info!(identity = %self.identity, ?report, "Reset coherence layer");
        report
    }
}

//! Change subscription management.
//!
//! One remote listener per observed scope, shared by every observer of that
//! scope. Change events are debounced per scope and then re-materialize it,
//! either by refetching into the cache and projection (`Eager`) or by dropping
//! the cache entry (`Invalidate`).
//!
//! # Lifecycle
//!
//! ```text
//! Unsubscribed -> Subscribing -> Active -> Unsubscribed
//!                      |            |
//!                      |       (transport drop)
//!                      v            v
//!                 Reconnecting { attempt } -> Failed
//! ```
//!
//! The first observer opens the listener; the last observer closes it at
//! once, aborts the listener task and cancels any pending debounce timer.
//! Once a new listener is live the scope is checked against the remote store
//! again, since writes landing before that point produce no event.
//! Records carry a generation so that work started for one attachment can
//! never touch a later attachment of the same scope.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::Utc;
use tessera_cache::QueryCoordinator;
use tessera_core::{
    ChangeEvent, CoherenceConfig, CoherenceError, ListenerHandle, QueryDescriptor,
    ReconnectConfig, RematerializeMode, RemoteStore, RemoteSubscription, ScopeKey, TesseraError,
    TesseraResult, Timestamp,
};
use tokio::task::AbortHandle;

use crate::debounce::Debouncer;
use crate::projection::ReactiveProjection;
use crate::reconnect::Backoff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Subscribing,
    Active,
    /// `attempt` counts consecutive failed subscribes; 0 right after a drop.
    Reconnecting { attempt: u32 },
    /// Resubscribing was given up; the scope shows an error until detached.
    Failed,
}

#[derive(Debug, Clone)]
pub struct SubscriptionSettings {
    pub debounce_window: Duration,
    pub max_subscriptions: usize,
    pub rematerialize: RematerializeMode,
    pub reconnect: ReconnectConfig,
}

impl SubscriptionSettings {
    pub fn from_config(config: &CoherenceConfig) -> Self {
        Self {
            debounce_window: config.debounce_window(),
            max_subscriptions: config.max_subscriptions,
            rematerialize: config.rematerialize,
            reconnect: config.reconnect.clone(),
        }
    }
}

struct Record {
    query: QueryDescriptor,
    generation: u64,
    observers: usize,
    state: SubscriptionState,
    handle: Option<Box<dyn ListenerHandle>>,
    task: Option<AbortHandle>,
    last_invalidate_at: Option<Timestamp>,
}

impl Record {
    fn close_listener(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.close();
        }
    }

    fn teardown(&mut self) {
        self.close_listener();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

type Records = HashMap<ScopeKey, Record>;

fn current<'a>(records: &'a mut Records, key: &ScopeKey, generation: u64) -> Option<&'a mut Record> {
    records
        .get_mut(key)
        .filter(|record| record.generation == generation)
}

/// Releases one observer's attachment.
trait Detach: Send + Sync {
    fn detach(&self, key: &ScopeKey, generation: u64);
}

/// One observer's hold on a scope subscription. Dropping it detaches.
pub struct SubscriptionGuard {
    key: ScopeKey,
    generation: u64,
    owner: Weak<dyn Detach>,
}

impl SubscriptionGuard {
    pub fn key(&self) -> &ScopeKey {
        &self.key
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl std::fmt::Debug for SubscriptionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionGuard")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .finish()
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.detach(&self.key, self.generation);
        }
    }
}

struct Shared<R: RemoteStore> {
    remote: Arc<R>,
    coordinator: Arc<QueryCoordinator<R>>,
    projection: Arc<ReactiveProjection<R::Doc>>,
    settings: SubscriptionSettings,
    backoff: Backoff,
    debouncer: Debouncer,
    records: Mutex<Records>,
    next_generation: AtomicU64,
    rematerializations: AtomicU64,
}

impl<R: RemoteStore> Shared<R> {
    fn lock(&self) -> MutexGuard<'_, Records> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand a freshly opened listener to its record, or close it if the
    /// attachment is gone.
    fn install(&self, key: &ScopeKey, generation: u64, handle: Box<dyn ListenerHandle>) -> bool {
        let mut records = self.lock();
        match current(&mut records, key, generation) {
            Some(record) => {
                record.close_listener();
                record.handle = Some(handle);
                record.state = SubscriptionState::Active;
                true
            }
            None => {
                drop(records);
                handle.close();
                tracing::debug!(scope = %key, "Closed listener opened for a detached scope");
                false
            }
        }
    }

    fn mark_reconnecting(&self, key: &ScopeKey, generation: u64, attempt: u32) -> bool {
        let mut records = self.lock();
        let Some(record) = current(&mut records, key, generation) else {
            return false;
        };
        record.close_listener();
        record.state = SubscriptionState::Reconnecting { attempt };
        self.projection.set_reconnecting(key);
        true
    }

    fn mark_failed(&self, key: &ScopeKey, generation: u64, attempts: u32, last_error: &TesseraError) {
        let mut records = self.lock();
        let Some(record) = current(&mut records, key, generation) else {
            return;
        };
        record.close_listener();
        record.state = SubscriptionState::Failed;
        tracing::error!(
            scope = %key,
            attempts,
            error = %last_error,
            "Resubscribe attempts exhausted"
        );
        self.projection.fail(
            key,
            CoherenceError::ResubscribeExhausted {
                scope: key.to_string(),
                attempts,
            }
            .into(),
        );
    }

    /// Restart the debounce timer for a scope after a change event.
    fn on_change(self: &Arc<Self>, key: &ScopeKey, generation: u64) {
        let query = {
            let mut records = self.lock();
            let Some(record) = current(&mut records, key, generation) else {
                return;
            };
            record.last_invalidate_at = Some(Utc::now());
            record.query.clone()
        };

        let shared = Arc::clone(self);
        let scope = key.clone();
        self.debouncer
            .schedule(key.as_str(), self.settings.debounce_window, async move {
                let mode = shared.settings.rematerialize;
                shared.rematerialize(&scope, &query, generation, mode).await;
            });
    }

    async fn rematerialize(
        &self,
        key: &ScopeKey,
        query: &QueryDescriptor,
        generation: u64,
        mode: RematerializeMode,
    ) {
        self.rematerializations.fetch_add(1, Ordering::Relaxed);

        if mode == RematerializeMode::Invalidate {
            self.coordinator.invalidate(key);
            tracing::debug!(scope = %key, "Dropped cache entry after remote change");
            return;
        }

        let result = self.coordinator.fetch(key, query, true).await;

        let mut records = self.lock();
        if current(&mut records, key, generation).is_none() {
            tracing::debug!(scope = %key, "Scope detached during re-materialization");
            return;
        }
        match result {
            Ok(entry) => {
                tracing::debug!(
                    scope = %key,
                    server_timestamp = ?entry.server_timestamp,
                    "Re-materialized scope"
                );
                self.projection.apply_authoritative(key, entry);
            }
            Err(e) => {
                tracing::warn!(scope = %key, error = %e, "Re-materialization failed");
                self.projection.record_failure(key, e);
            }
        }
    }

    /// Catch changes made before the listener went live, which no event
    /// will ever report.
    async fn validate(&self, key: &ScopeKey, query: &QueryDescriptor, generation: u64) {
        let result = self.coordinator.revalidate(key, query).await;

        let mut records = self.lock();
        if current(&mut records, key, generation).is_none() {
            return;
        }
        match result {
            Ok(Some(entry)) => {
                tracing::debug!(
                    scope = %key,
                    server_timestamp = ?entry.server_timestamp,
                    "Scope changed before subscription went live"
                );
                self.projection.apply_authoritative(key, entry);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(scope = %key, error = %e, "Validation after subscribe failed");
                self.projection.record_failure(key, e);
            }
        }
    }

    fn close_all(&self) -> usize {
        let drained: Vec<(ScopeKey, Record)> = self.lock().drain().collect();
        let closed = drained.len();
        for (key, mut record) in drained {
            record.teardown();
            self.projection.release(&key);
        }
        self.debouncer.cancel_all();
        closed
    }
}

impl<R: RemoteStore> Detach for Shared<R> {
    fn detach(&self, key: &ScopeKey, generation: u64) {
        let removed = {
            let mut records = self.lock();
            let Some(record) = current(&mut records, key, generation) else {
                return;
            };
            record.observers -= 1;
            if record.observers > 0 {
                tracing::debug!(scope = %key, observers = record.observers, "Observer detached");
                return;
            }
            records.remove(key)
        };

        if let Some(mut record) = removed {
            record.teardown();
            self.debouncer.cancel(key.as_str());
            self.projection.release(key);
            tracing::info!(scope = %key, "Closed subscription");
        }
    }
}

/// Listener task for one attachment: subscribe, pump events, resubscribe on
/// drops with backoff.
async fn listen<R: RemoteStore>(
    shared: Arc<Shared<R>>,
    key: ScopeKey,
    query: QueryDescriptor,
    generation: u64,
) {
    let mut failed_attempts: u32 = 0;
    let mut resumed = false;

    loop {
        match shared.remote.subscribe(&query).await {
            Ok(RemoteSubscription { mut events, handle }) => {
                if !shared.install(&key, generation, handle) {
                    return;
                }
                if resumed {
                    tracing::info!(scope = %key, failed_attempts, "Resubscribed");
                    shared
                        .rematerialize(&key, &query, generation, RematerializeMode::Eager)
                        .await;
                } else {
                    tracing::info!(scope = %key, "Subscription active");
                    shared.validate(&key, &query, generation).await;
                }
                failed_attempts = 0;

                let reason = loop {
                    match events.recv().await {
                        Some(ChangeEvent::Dropped { reason }) => break reason,
                        Some(event) => {
                            tracing::trace!(scope = %key, ?event, "Change event");
                            shared.on_change(&key, generation);
                        }
                        None => break "event stream ended".to_string(),
                    }
                };
                tracing::warn!(scope = %key, reason = %reason, "Subscription dropped; reconnecting");
            }
            Err(e) => {
                failed_attempts += 1;
                if failed_attempts >= shared.backoff.max_attempts() {
                    shared.mark_failed(&key, generation, failed_attempts, &e);
                    return;
                }
                tracing::warn!(
                    scope = %key,
                    attempt = failed_attempts,
                    error = %e,
                    "Subscribe failed; retrying"
                );
            }
        }

        if !shared.mark_reconnecting(&key, generation, failed_attempts) {
            return;
        }
        resumed = true;
        tokio::time::sleep(shared.backoff.delay(failed_attempts)).await;
    }
}

pub struct SubscriptionManager<R: RemoteStore> {
    shared: Arc<Shared<R>>,
}

impl<R: RemoteStore> SubscriptionManager<R> {
    pub fn new(
        remote: Arc<R>,
        coordinator: Arc<QueryCoordinator<R>>,
        projection: Arc<ReactiveProjection<R::Doc>>,
        settings: SubscriptionSettings,
    ) -> Self {
        let backoff = Backoff::new(settings.reconnect.clone());
        Self {
            shared: Arc::new(Shared {
                remote,
                coordinator,
                projection,
                settings,
                backoff,
                debouncer: Debouncer::new(),
                records: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                rematerializations: AtomicU64::new(0),
            }),
        }
    }

    /// Add an observer to a scope, opening its remote subscription if this is
    /// the first one. Must be called from within a tokio runtime.
    pub fn attach(&self, key: &ScopeKey, query: &QueryDescriptor) -> TesseraResult<SubscriptionGuard> {
        let mut records = self.shared.lock();
        if let Some(record) = records.get_mut(key) {
            record.observers += 1;
            tracing::debug!(scope = %key, observers = record.observers, "Observer attached");
            return Ok(self.guard(key, record.generation));
        }

        let limit = self.shared.settings.max_subscriptions;
        if records.len() >= limit {
            tracing::warn!(scope = %key, limit, "Subscription limit reached");
            return Err(CoherenceError::SubscriptionLimitReached { limit }.into());
        }

        let generation = self.shared.next_generation.fetch_add(1, Ordering::Relaxed);
        let task = tokio::spawn(listen(
            Arc::clone(&self.shared),
            key.clone(),
            query.clone(),
            generation,
        ))
        .abort_handle();
        records.insert(
            key.clone(),
            Record {
                query: query.clone(),
                generation,
                observers: 1,
                state: SubscriptionState::Subscribing,
                handle: None,
                task: Some(task),
                last_invalidate_at: None,
            },
        );
        tracing::info!(scope = %key, generation, "Opening subscription");
        Ok(self.guard(key, generation))
    }

    fn guard(&self, key: &ScopeKey, generation: u64) -> SubscriptionGuard {
        let owner: Arc<dyn Detach> = self.shared.clone();
        SubscriptionGuard {
            key: key.clone(),
            generation,
            owner: Arc::downgrade(&owner),
        }
    }

    /// Tear down every subscription. Returns how many scopes were closed.
    pub fn close_all(&self) -> usize {
        let closed = self.shared.close_all();
        if closed > 0 {
            tracing::info!(closed, "Closed all subscriptions");
        }
        closed
    }

    /// Live remote listener handles.
    pub fn open_subscriptions(&self) -> usize {
        self.shared
            .lock()
            .values()
            .filter(|record| record.handle.is_some())
            .count()
    }

    /// Scopes with at least one observer.
    pub fn observed_scopes(&self) -> usize {
        self.shared.lock().len()
    }

    pub fn state(&self, key: &ScopeKey) -> Option<SubscriptionState> {
        self.shared.lock().get(key).map(|record| record.state)
    }

    pub fn observer_count(&self, key: &ScopeKey) -> usize {
        self.shared
            .lock()
            .get(key)
            .map(|record| record.observers)
            .unwrap_or(0)
    }

    /// Time of the last change event seen for a scope.
    pub fn last_invalidate_at(&self, key: &ScopeKey) -> Option<Timestamp> {
        self.shared
            .lock()
            .get(key)
            .and_then(|record| record.last_invalidate_at)
    }

    /// Re-materializations started so far, across all scopes.
    pub fn rematerializations(&self) -> u64 {
        self.shared.rematerializations.load(Ordering::Relaxed)
    }

    pub fn pending_debounces(&self) -> usize {
        self.shared.debouncer.pending_count()
    }
}

impl<R: RemoteStore> Drop for SubscriptionManager<R> {
    fn drop(&mut self) {
        self.shared.close_all();
    }
}

//! In-memory remote document store.
//!
//! Behaves like a shared multi-writer store: a logical clock stamps every
//! write, commits are atomic, and open listeners receive change events for
//! the predicates they subscribed to. Faults (failed reads, probes,
//! subscribes and commits), latency and transport drops can be injected.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use tessera_core::{
    ChangeEvent, Document, DocumentId, ListenerHandle, MutationOp, Payload, QueryDescriptor,
    RemoteError, RemoteStore, RemoteSubscription, RemoteTimestamp, ScopeProbe, TesseraError,
    TesseraResult,
};

/// A document the in-memory store can stamp with server timestamps.
pub trait StoredDocument: Document {
    fn stamp_created(&mut self, at: RemoteTimestamp);
    fn stamp_updated(&mut self, at: RemoteTimestamp);
}

type Collections<D> = BTreeMap<String, BTreeMap<DocumentId, D>>;

struct Listener {
    query: QueryDescriptor,
    sender: mpsc::UnboundedSender<ChangeEvent>,
    open: Arc<AtomicBool>,
}

#[derive(Default)]
struct Faults {
    fetch_failures: usize,
    probe_failures: bool,
    subscribe_failures: usize,
    commit_failure_at: Option<usize>,
    latency: Option<Duration>,
    subscribe_latency: Option<Duration>,
}

struct State<D> {
    clock: i64,
    collections: Collections<D>,
    listeners: Vec<Listener>,
    faults: Faults,
}

/// A document change produced by a write, used for listener fan-out.
struct Change<D> {
    collection: String,
    id: DocumentId,
    before: Option<D>,
    after: Option<D>,
}

/// Handle for one in-memory listener.
struct MemoryListenerHandle {
    open: Arc<AtomicBool>,
    closes: Arc<AtomicUsize>,
}

impl ListenerHandle for MemoryListenerHandle {
    fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            self.closes.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// In-memory [`RemoteStore`] for tests.
pub struct InMemoryRemoteStore<D> {
    state: Mutex<State<D>>,
    fetches: AtomicUsize,
    probes: AtomicUsize,
    subscribes: AtomicUsize,
    commits: AtomicUsize,
    closes: Arc<AtomicUsize>,
}

impl<D: StoredDocument> Default for InMemoryRemoteStore<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: StoredDocument> InMemoryRemoteStore<D> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                clock: 0,
                collections: BTreeMap::new(),
                listeners: Vec::new(),
                faults: Faults::default(),
            }),
            fetches: AtomicUsize::new(0),
            probes: AtomicUsize::new(0),
            subscribes: AtomicUsize::new(0),
            commits: AtomicUsize::new(0),
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<D>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // === Seeding and out-of-band writes ===

    /// Insert a document exactly as given, keeping its timestamps.
    ///
    /// Models a write by another client. Listeners are notified.
    pub fn put(&self, collection: &str, document: D) {
        let mut state = self.lock();
        if let Some(ts) = document.mutation_timestamp() {
            state.clock = state.clock.max(ts.as_millis());
        }
        let id = document.document_id();
        let before = state
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.clone(), document.clone());
        let change = Change {
            collection: collection.to_string(),
            id,
            before,
            after: Some(document),
        };
        notify(&mut state.listeners, &[change]);
    }

    /// Overwrite a document with a fresh `updated_at` from the store clock.
    pub fn write(&self, collection: &str, mut document: D) -> RemoteTimestamp {
        let at = self.tick();
        document.stamp_updated(at);
        self.put(collection, document);
        at
    }

    /// Delete a document out of band. Listeners are notified.
    pub fn remove(&self, collection: &str, id: &DocumentId) -> Option<D> {
        let mut state = self.lock();
        let before = state
            .collections
            .get_mut(collection)
            .and_then(|docs| docs.remove(id));
        if let Some(removed) = &before {
            let change = Change {
                collection: collection.to_string(),
                id: id.clone(),
                before: Some(removed.clone()),
                after: None,
            };
            notify(&mut state.listeners, &[change]);
        }
        before
    }

    /// Advance the logical clock and return the new time.
    pub fn tick(&self) -> RemoteTimestamp {
        let mut state = self.lock();
        state.clock += 1;
        RemoteTimestamp::from_millis(state.clock)
    }

    pub fn now(&self) -> RemoteTimestamp {
        RemoteTimestamp::from_millis(self.lock().clock)
    }

    pub fn get(&self, collection: &str, id: &DocumentId) -> Option<D> {
        self.lock()
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned()
    }

    pub fn documents(&self, collection: &str) -> Vec<D> {
        self.lock()
            .collections
            .get(collection)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default()
    }

    // === Fault injection ===

    pub fn fail_next_fetches(&self, count: usize) {
        self.lock().faults.fetch_failures = count;
    }

    pub fn fail_probes(&self, failing: bool) {
        self.lock().faults.probe_failures = failing;
    }

    pub fn fail_next_subscribes(&self, count: usize) {
        self.lock().faults.subscribe_failures = count;
    }

    /// Make the next commit fail when it reaches operation `index`.
    pub fn fail_next_commit_at(&self, index: usize) {
        self.lock().faults.commit_failure_at = Some(index);
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock().faults.latency = latency;
    }

    /// Extra delay before a subscription is registered, on top of any
    /// general latency. Writes made meanwhile produce no event for it.
    pub fn set_subscribe_latency(&self, latency: Option<Duration>) {
        self.lock().faults.subscribe_latency = latency;
    }

    /// Simulate a transport drop on every open listener.
    ///
    /// Each stream receives [`ChangeEvent::Dropped`] and then ends.
    pub fn drop_listeners(&self, reason: &str) -> usize {
        let mut state = self.lock();
        let mut dropped = 0;
        for listener in state.listeners.drain(..) {
            if listener.open.swap(false, Ordering::AcqRel) {
                let _ = listener.sender.send(ChangeEvent::Dropped {
                    reason: reason.to_string(),
                });
                dropped += 1;
            }
        }
        tracing::debug!(dropped, reason, "Dropped listeners");
        dropped
    }

    // === Call counters ===

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::Relaxed)
    }

    pub fn subscribe_count(&self) -> usize {
        self.subscribes.load(Ordering::Relaxed)
    }

    /// Commit attempts, including failed ones.
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::Relaxed)
    }

    /// Listeners that are open and have not been dropped.
    pub fn open_listeners(&self) -> usize {
        self.lock()
            .listeners
            .iter()
            .filter(|listener| listener.open.load(Ordering::Acquire))
            .count()
    }

    /// Listeners closed through their handle.
    pub fn closed_listeners(&self) -> usize {
        self.closes.load(Ordering::Relaxed)
    }

    async fn simulate_latency(&self) {
        let latency = self.lock().faults.latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

fn materialize<D: Document>(collections: &Collections<D>, query: &QueryDescriptor) -> Payload<D> {
    let docs = collections.get(query.collection_name());
    match query {
        QueryDescriptor::Point { id, .. } => {
            Payload::Document(docs.and_then(|docs| docs.get(id)).cloned())
        }
        QueryDescriptor::Predicate { collection, .. } => Payload::Collection(
            docs.map(|docs| {
                docs.values()
                    .filter(|doc| query.matches(collection, *doc))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default(),
        ),
    }
}

fn notify<D: Document>(listeners: &mut Vec<Listener>, changes: &[Change<D>]) {
    listeners.retain(|listener| listener.open.load(Ordering::Acquire));
    for listener in listeners.iter() {
        for change in changes {
            let matched = |doc: &Option<D>| {
                doc.as_ref()
                    .is_some_and(|doc| listener.query.matches(&change.collection, doc))
            };
            let event = if matched(&change.after) {
                ChangeEvent::Upserted {
                    document_id: change.id.clone(),
                    mutated_at: change.after.as_ref().and_then(Document::mutation_timestamp),
                }
            } else if matched(&change.before) {
                ChangeEvent::Removed {
                    document_id: change.id.clone(),
                }
            } else {
                continue;
            };
            if listener.sender.send(event).is_err() {
                listener.open.store(false, Ordering::Release);
            }
        }
    }
}

fn invalid(reason: impl Into<String>) -> TesseraError {
    RemoteError::InvalidDocument {
        reason: reason.into(),
    }
    .into()
}

fn apply<D: StoredDocument>(
    collections: &mut Collections<D>,
    operation: MutationOp<D>,
    at: RemoteTimestamp,
) -> TesseraResult<Option<Change<D>>> {
    match operation {
        MutationOp::Create {
            collection,
            mut document,
        } => {
            document.stamp_created(at);
            let id = document.document_id();
            let before = collections
                .entry(collection.clone())
                .or_default()
                .insert(id.clone(), document.clone());
            Ok(Some(Change {
                collection,
                id,
                before,
                after: Some(document),
            }))
        }
        MutationOp::Update {
            collection,
            id,
            delta,
        } => {
            let docs = collections.entry(collection.clone()).or_default();
            let existing = docs
                .get(&id)
                .ok_or_else(|| invalid(format!("no document {collection}/{id} to update")))?;
            let mut value = serde_json::to_value(existing).map_err(|e| invalid(e.to_string()))?;
            let fields = value
                .as_object_mut()
                .ok_or_else(|| invalid(format!("{collection}/{id} is not an object")))?;
            fields.extend(delta);
            let mut updated: D = serde_json::from_value(value).map_err(|e| invalid(e.to_string()))?;
            updated.stamp_updated(at);
            let before = docs.insert(id.clone(), updated.clone());
            Ok(Some(Change {
                collection,
                id,
                before,
                after: Some(updated),
            }))
        }
        MutationOp::Delete { collection, id } => {
            let before = collections
                .get_mut(&collection)
                .and_then(|docs| docs.remove(&id));
            Ok(before.map(|before| Change {
                collection,
                id,
                before: Some(before),
                after: None,
            }))
        }
    }
}

#[async_trait]
impl<D: StoredDocument> RemoteStore for InMemoryRemoteStore<D> {
    type Doc = D;

    async fn fetch(&self, query: &QueryDescriptor) -> TesseraResult<Payload<D>> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        self.simulate_latency().await;

        let mut state = self.lock();
        if state.faults.fetch_failures > 0 {
            state.faults.fetch_failures -= 1;
            tracing::debug!(query = ?query, "Injecting fetch failure");
            return Err(TesseraError::transient("injected fetch failure"));
        }
        Ok(materialize(&state.collections, query))
    }

    async fn probe(&self, query: &QueryDescriptor) -> TesseraResult<ScopeProbe> {
        self.probes.fetch_add(1, Ordering::Relaxed);
        self.simulate_latency().await;

        let state = self.lock();
        if state.faults.probe_failures {
            return Err(TesseraError::transient("injected probe failure"));
        }
        let payload = materialize(&state.collections, query);
        Ok(ScopeProbe {
            max_mutation: payload.server_timestamp(),
            document_count: payload.len(),
        })
    }

    async fn subscribe(&self, query: &QueryDescriptor) -> TesseraResult<RemoteSubscription> {
        self.subscribes.fetch_add(1, Ordering::Relaxed);
        self.simulate_latency().await;
        let extra = self.lock().faults.subscribe_latency;
        if let Some(extra) = extra {
            tokio::time::sleep(extra).await;
        }

        let mut state = self.lock();
        if state.faults.subscribe_failures > 0 {
            state.faults.subscribe_failures -= 1;
            tracing::debug!(query = ?query, "Injecting subscribe failure");
            return Err(TesseraError::transient("injected subscribe failure"));
        }

        let (sender, events) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));
        state.listeners.push(Listener {
            query: query.clone(),
            sender,
            open: Arc::clone(&open),
        });
        Ok(RemoteSubscription {
            events,
            handle: Box::new(MemoryListenerHandle {
                open,
                closes: Arc::clone(&self.closes),
            }),
        })
    }

    async fn commit(&self, operations: Vec<MutationOp<D>>) -> TesseraResult<RemoteTimestamp> {
        self.commits.fetch_add(1, Ordering::Relaxed);
        self.simulate_latency().await;

        let mut state = self.lock();
        let fail_at = state.faults.commit_failure_at.take();
        let at = RemoteTimestamp::from_millis(state.clock + 1);

        // Applied to a copy so a failure part-way leaves nothing behind.
        let mut staged = state.collections.clone();
        let mut changes = Vec::with_capacity(operations.len());
        for (index, operation) in operations.into_iter().enumerate() {
            if fail_at == Some(index) {
                return Err(TesseraError::transient(format!(
                    "injected commit failure at operation {index}"
                )));
            }
            changes.extend(apply(&mut staged, operation, at)?);
        }

        state.collections = staged;
        state.clock = at.as_millis();
        notify(&mut state.listeners, &changes);
        Ok(at)
    }
}

//! Reactive state projection.
//!
//! Holds, per observed scope, the payload the UI should render and a status,
//! published through a `tokio::sync::watch` channel. The visible payload is
//! the latest authoritative payload with any optimistic patches overlaid.
//!
//! # Reconciliation
//!
//! - An authoritative update replaces the payload and drops every optimistic
//!   patch for the scope. Authoritative data always wins.
//! - Confirming a ticket keeps its patch until authoritative data arrives.
//! - Rejecting a ticket removes its patch only if that exact patch is still
//!   in place; a later authoritative update or patch is never undone.
//! - A failure with data already visible keeps the data and shows no error;
//!   a failure with nothing to show surfaces [`ScopeStatus::Error`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tessera_cache::CacheEntry;
use tessera_core::{
    Document, DocumentId, Payload, RemoteTimestamp, ScopeKey, TesseraError, Timestamp,
};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeStatus {
    /// Observed, nothing requested yet.
    Idle,
    /// First load in progress.
    Loading,
    Ready,
    /// The realtime subscription dropped and is being re-established.
    Reconnecting,
    Error,
}

/// What observers of a scope see.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopeView<D> {
    /// Authoritative payload with optimistic patches applied.
    pub payload: Option<Payload<D>>,
    pub status: ScopeStatus,
    /// Set only while `status` is `Error`.
    pub error: Option<TesseraError>,
    pub server_timestamp: Option<RemoteTimestamp>,
    pub pending_patches: usize,
}

impl<D> ScopeView<D> {
    fn idle() -> Self {
        Self {
            payload: None,
            status: ScopeStatus::Idle,
            error: None,
            server_timestamp: None,
            pending_patches: 0,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status == ScopeStatus::Ready
    }
}

/// A local, not yet authoritative change to one document.
#[derive(Debug, Clone, PartialEq)]
pub enum OptimisticPatch<D> {
    Upsert(D),
    Remove(DocumentId),
}

/// Identifies one applied optimistic patch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PatchTicket {
    scope: ScopeKey,
    id: u64,
}

impl PatchTicket {
    pub fn scope(&self) -> &ScopeKey {
        &self.scope
    }
}

struct AppliedPatch<D> {
    id: u64,
    patch: OptimisticPatch<D>,
    confirmed: bool,
}

struct Slot<D> {
    sender: watch::Sender<ScopeView<D>>,
    authoritative: Option<Payload<D>>,
    server_timestamp: Option<RemoteTimestamp>,
    fetched_at: Option<Timestamp>,
    status: ScopeStatus,
    error: Option<TesseraError>,
    patches: Vec<AppliedPatch<D>>,
}

impl<D: Document> Slot<D> {
    fn new() -> Self {
        let (sender, _) = watch::channel(ScopeView::idle());
        Self {
            sender,
            authoritative: None,
            server_timestamp: None,
            fetched_at: None,
            status: ScopeStatus::Idle,
            error: None,
            patches: Vec::new(),
        }
    }

    fn render(&self) -> ScopeView<D> {
        let payload = self.authoritative.clone().map(|mut payload| {
            for applied in &self.patches {
                match &applied.patch {
                    OptimisticPatch::Upsert(doc) => payload.upsert(doc.clone()),
                    OptimisticPatch::Remove(id) => payload.remove(id),
                }
            }
            payload
        });
        ScopeView {
            payload,
            status: self.status,
            error: self.error.clone(),
            server_timestamp: self.server_timestamp,
            pending_patches: self.patches.len(),
        }
    }

    fn publish(&self) {
        self.sender.send_replace(self.render());
    }
}

pub struct ReactiveProjection<D> {
    slots: Mutex<HashMap<ScopeKey, Slot<D>>>,
    next_ticket: AtomicU64,
}

impl<D: Document> Default for ReactiveProjection<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Document> ReactiveProjection<D> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            next_ticket: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ScopeKey, Slot<D>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `f` to an existing slot and republish it.
    fn update<T>(&self, key: &ScopeKey, f: impl FnOnce(&mut Slot<D>) -> T) -> Option<T> {
        let mut slots = self.lock();
        let slot = slots.get_mut(key)?;
        let result = f(slot);
        slot.publish();
        Some(result)
    }

    /// Subscribe to a scope, creating its slot if needed.
    pub fn watch(&self, key: &ScopeKey) -> watch::Receiver<ScopeView<D>> {
        self.lock()
            .entry(key.clone())
            .or_insert_with(Slot::new)
            .sender
            .subscribe()
    }

    pub fn view(&self, key: &ScopeKey) -> Option<ScopeView<D>> {
        self.lock().get(key).map(Slot::render)
    }

    pub fn is_observed(&self, key: &ScopeKey) -> bool {
        self.lock().contains_key(key)
    }

    pub fn scopes(&self) -> Vec<ScopeKey> {
        self.lock().keys().cloned().collect()
    }

    /// Mark a first load in progress. No effect once data is visible.
    pub fn set_loading(&self, key: &ScopeKey) {
        self.update(key, |slot| {
            if slot.authoritative.is_none() {
                slot.status = ScopeStatus::Loading;
            }
        });
    }

    /// Publish authoritative data, dropping every optimistic patch.
    ///
    /// Ignored for unobserved scopes and for entries fetched before the one
    /// already shown. Returns whether the view changed.
    pub fn apply_authoritative(&self, key: &ScopeKey, entry: CacheEntry<Payload<D>>) -> bool {
        let mut slots = self.lock();
        let Some(slot) = slots.get_mut(key) else {
            return false;
        };
        if slot.fetched_at.is_some_and(|shown| shown > entry.fetched_at) {
            tracing::debug!(scope = %key, "Ignoring authoritative data older than the current view");
            return false;
        }

        let dropped = slot.patches.len();
        slot.patches.clear();
        slot.authoritative = Some(entry.payload);
        slot.server_timestamp = entry.server_timestamp;
        slot.fetched_at = Some(entry.fetched_at);
        slot.status = ScopeStatus::Ready;
        slot.error = None;
        slot.publish();

        if dropped > 0 {
            tracing::debug!(scope = %key, dropped, "Authoritative update replaced optimistic patches");
        }
        true
    }

    /// Record a failed load or refresh.
    pub fn record_failure(&self, key: &ScopeKey, error: TesseraError) {
        self.update(key, |slot| {
            if slot.authoritative.is_some() {
                tracing::debug!(scope = %key, error = %error, "Keeping previous data after failure");
                slot.status = ScopeStatus::Ready;
                slot.error = None;
            } else {
                slot.status = ScopeStatus::Error;
                slot.error = Some(error);
            }
        });
    }

    /// Degrade a scope to `Error`, keeping any data it shows.
    pub fn fail(&self, key: &ScopeKey, error: TesseraError) {
        self.update(key, |slot| {
            slot.status = ScopeStatus::Error;
            slot.error = Some(error);
        });
    }

    pub fn set_reconnecting(&self, key: &ScopeKey) {
        self.update(key, |slot| {
            slot.status = ScopeStatus::Reconnecting;
        });
    }

    /// Overlay a local change on the scope's visible payload.
    ///
    /// Unobserved scopes have nothing to overlay; the returned ticket then
    /// refers to no patch and confirming or rejecting it is a no-op.
    pub fn apply_optimistic(&self, key: &ScopeKey, patch: OptimisticPatch<D>) -> PatchTicket {
        let id = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let updated = self.update(key, |slot| {
            slot.patches.push(AppliedPatch {
                id,
                patch,
                confirmed: false,
            });
        });
        if updated.is_none() {
            tracing::debug!(scope = %key, "Ignoring optimistic patch for unobserved scope");
        }
        PatchTicket {
            scope: key.clone(),
            id,
        }
    }

    /// Mark a patch as accepted remotely. It stays visible until the next
    /// authoritative update. Returns false if the patch is already gone.
    pub fn confirm(&self, ticket: &PatchTicket) -> bool {
        let mut slots = self.lock();
        let Some(applied) = slots
            .get_mut(&ticket.scope)
            .and_then(|slot| slot.patches.iter_mut().find(|p| p.id == ticket.id))
        else {
            return false;
        };
        applied.confirmed = true;
        true
    }

    /// Revert a patch if it is still in place. Returns whether it was removed.
    pub fn reject(&self, ticket: &PatchTicket) -> bool {
        self.update(&ticket.scope, |slot| {
            let before = slot.patches.len();
            slot.patches.retain(|p| p.id != ticket.id);
            before != slot.patches.len()
        })
        .unwrap_or(false)
    }

    /// Number of patches on a scope that have been confirmed but not yet
    /// replaced by authoritative data.
    pub fn confirmed_patches(&self, key: &ScopeKey) -> usize {
        self.lock()
            .get(key)
            .map(|slot| slot.patches.iter().filter(|p| p.confirmed).count())
            .unwrap_or(0)
    }

    /// Drop a scope's slot if nobody is watching it any more.
    pub fn release(&self, key: &ScopeKey) -> bool {
        let mut slots = self.lock();
        if slots
            .get(key)
            .is_some_and(|slot| slot.sender.receiver_count() == 0)
        {
            slots.remove(key);
            return true;
        }
        false
    }

    /// Drop every slot. Open receivers observe their sender closing.
    pub fn clear(&self) -> usize {
        let mut slots = self.lock();
        let cleared = slots.len();
        slots.clear();
        cleared
    }
}

//! Remote document store seam.
//!
//! The coherence layer never talks to a network directly. Everything it needs
//! from the shared store is expressed by [`RemoteStore`]: point and predicate
//! reads, a cheap timestamp probe, realtime change subscriptions keyed by the
//! same predicates, and atomic multi-document commits.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::document::{Document, Payload};
use crate::error::TesseraResult;
use crate::identity::{DocumentId, RemoteTimestamp};
use crate::mutation::MutationOp;
use crate::query::QueryDescriptor;

/// Result of a staleness probe: mutation metadata only, no document bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScopeProbe {
    /// Max mutation timestamp across the matching documents.
    pub max_mutation: Option<RemoteTimestamp>,
    /// Number of matching documents.
    pub document_count: usize,
}

/// Realtime notification for a subscribed predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// A matching document was created or modified.
    Upserted {
        document_id: DocumentId,
        mutated_at: Option<RemoteTimestamp>,
    },
    /// A document left the result set or was deleted.
    Removed { document_id: DocumentId },
    /// The transport dropped; no further events will arrive on this stream.
    Dropped { reason: String },
}

/// Owner-side handle of an open remote listener.
///
/// `close` must be idempotent.
pub trait ListenerHandle: Send + Sync {
    fn close(&self);
}

/// An open realtime subscription.
pub struct RemoteSubscription {
    pub events: mpsc::UnboundedReceiver<ChangeEvent>,
    pub handle: Box<dyn ListenerHandle>,
}

impl std::fmt::Debug for RemoteSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSubscription").finish_non_exhaustive()
    }
}

/// Shared, multi-writer remote document store.
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    type Doc: Document;

    /// Full materialization of a query.
    async fn fetch(&self, query: &QueryDescriptor) -> TesseraResult<Payload<Self::Doc>>;

    /// Mutation timestamps of the matching set without document bodies.
    ///
    /// Must be cheaper than [`Self::fetch`]; for point queries this is a single
    /// timestamp read.
    async fn probe(&self, query: &QueryDescriptor) -> TesseraResult<ScopeProbe>;

    /// Open a realtime change subscription for the query's predicate.
    async fn subscribe(&self, query: &QueryDescriptor) -> TesseraResult<RemoteSubscription>;

    /// Apply every operation atomically, or none of them.
    async fn commit(&self, operations: Vec<MutationOp<Self::Doc>>) -> TesseraResult<RemoteTimestamp>;
}

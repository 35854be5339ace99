//! Atomic batch mutations.
//!
//! Operations accumulate locally and are applied by one atomic remote commit.
//! The pending list is cleared by every commit attempt, successful or not, so
//! a failed batch is never resent by accident. The manager never touches the
//! cache; callers use the [`CommitReceipt`] to invalidate affected scopes.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{Map, Value};
use tessera_core::{
    CoherenceError, DocumentId, DocumentRef, MutationOp, RemoteError, RemoteStore,
    RemoteTimestamp, TesseraError, TesseraResult,
};

use crate::throttle::Throttler;

/// Outcome of a successful commit.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommitReceipt {
    /// Number of operations applied.
    pub operations: usize,
    /// Remote time of the commit; `None` for an empty batch.
    pub committed_at: Option<RemoteTimestamp>,
    /// Documents written, in operation order.
    pub touched: Vec<DocumentRef>,
}

impl CommitReceipt {
    pub fn is_empty(&self) -> bool {
        self.operations == 0
    }
}

pub struct BatchMutationManager<R: RemoteStore> {
    remote: Arc<R>,
    throttle: Arc<Throttler>,
    pending: Mutex<Vec<MutationOp<R::Doc>>>,
    max_operations: usize,
}

impl<R: RemoteStore> BatchMutationManager<R> {
    pub fn new(remote: Arc<R>, throttle: Arc<Throttler>, max_operations: usize) -> Self {
        Self {
            remote,
            throttle,
            pending: Mutex::new(Vec::new()),
            max_operations,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<MutationOp<R::Doc>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create(&self, collection: impl Into<String>, document: R::Doc) -> TesseraResult<()> {
        self.enqueue(MutationOp::Create {
            collection: collection.into(),
            document,
        })
    }

    pub fn update(
        &self,
        collection: impl Into<String>,
        id: impl Into<DocumentId>,
        delta: Map<String, Value>,
    ) -> TesseraResult<()> {
        self.enqueue(MutationOp::Update {
            collection: collection.into(),
            id: id.into(),
            delta,
        })
    }

    pub fn delete(
        &self,
        collection: impl Into<String>,
        id: impl Into<DocumentId>,
    ) -> TesseraResult<()> {
        self.enqueue(MutationOp::Delete {
            collection: collection.into(),
            id: id.into(),
        })
    }

    /// Append an operation, failing once the batch holds `max_operations`.
    pub fn enqueue(&self, operation: MutationOp<R::Doc>) -> TesseraResult<()> {
        let mut pending = self.lock();
        if pending.len() >= self.max_operations {
            return Err(CoherenceError::BatchFull {
                limit: self.max_operations,
            }
            .into());
        }
        pending.push(operation);
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Discard pending operations, returning how many were dropped.
    pub fn drain(&self) -> usize {
        let mut pending = self.lock();
        let dropped = pending.len();
        pending.clear();
        dropped
    }

    /// Commit every pending operation atomically.
    ///
    /// On failure none of the operations were applied and the error is
    /// reported as [`RemoteError::BatchCommitFailed`]. Either way the batch is
    /// empty afterwards.
    pub async fn commit(&self) -> TesseraResult<CommitReceipt> {
        let operations = std::mem::take(&mut *self.lock());
        if operations.is_empty() {
            return Ok(CommitReceipt::default());
        }

        let count = operations.len();
        let touched: Vec<DocumentRef> = operations.iter().map(MutationOp::target).collect();
        let remote = Arc::clone(&self.remote);

        match self.throttle.run(|| remote.commit(operations)).await {
            Ok(committed_at) => {
                tracing::info!(operations = count, %committed_at, "Committed batch");
                Ok(CommitReceipt {
                    operations: count,
                    committed_at: Some(committed_at),
                    touched,
                })
            }
            Err(e) => {
                tracing::warn!(operations = count, error = %e, "Batch commit failed");
                Err(match e {
                    TesseraError::Remote(RemoteError::BatchCommitFailed { .. }) => e,
                    other => RemoteError::BatchCommitFailed {
                        operations: count,
                        reason: other.to_string(),
                    }
                    .into(),
                })
            }
        }
    }
}

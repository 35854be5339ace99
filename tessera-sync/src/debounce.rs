//! Per-key debouncing.
//!
//! Scheduling work for a key cancels whatever was pending for that key and
//! arms a new timer, so a burst of events yields one run after the burst has
//! been quiet for the whole window.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::AbortHandle;

struct Pending {
    id: u64,
    handle: AbortHandle,
}

type PendingTable = Arc<Mutex<HashMap<String, Pending>>>;

fn lock(table: &PendingTable) -> MutexGuard<'_, HashMap<String, Pending>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
pub struct Debouncer {
    pending: PendingTable,
    next_id: AtomicU64,
}

impl Debouncer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` once `window` has passed without another `schedule` for
    /// `key`. Must be called from within a tokio runtime.
    pub fn schedule<F>(&self, key: &str, window: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut pending = lock(&self.pending);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let table = Arc::clone(&self.pending);
        let owned_key = key.to_string();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            {
                let mut table = lock(&table);
                if !table.get(&owned_key).is_some_and(|p| p.id == id) {
                    return;
                }
                table.remove(&owned_key);
            }
            task.await;
        })
        .abort_handle();

        if let Some(previous) = pending.insert(key.to_string(), Pending { id, handle }) {
            previous.handle.abort();
        }
    }

    /// Cancel the pending run for `key`. Returns whether one was pending.
    pub fn cancel(&self, key: &str) -> bool {
        match lock(&self.pending).remove(key) {
            Some(previous) => {
                previous.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every pending run, returning how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<Pending> = lock(&self.pending).drain().map(|(_, p)| p).collect();
        for pending in &drained {
            pending.handle.abort();
        }
        drained.len()
    }

    pub fn is_pending(&self, key: &str) -> bool {
        lock(&self.pending).contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }
}

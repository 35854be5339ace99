//! Request deduplication.
//!
//! Concurrent callers asking for the same key share one in-flight remote
//! call. The in-flight table is checked and updated inside a single critical
//! section, so two callers can never both decide to start a call. Each call
//! runs as its own task and removes its record when it settles, whether it
//! succeeded or failed and whether or not anyone is still waiting; the next
//! caller after that starts a fresh call.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tessera_core::{TesseraError, TesseraResult};

type SharedCall<T> = Shared<BoxFuture<'static, TesseraResult<T>>>;

struct InFlight<T> {
    /// Distinguishes this call from a later one under the same key.
    id: u64,
    call: SharedCall<T>,
}

type Table<T> = Mutex<HashMap<String, InFlight<T>>>;

fn lock<T>(table: &Table<T>) -> MutexGuard<'_, HashMap<String, InFlight<T>>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Remove the record for `key` if it still belongs to call `id`.
fn settle<T>(table: &Table<T>, key: &str, id: u64) {
    let mut table = lock(table);
    if table.get(key).is_some_and(|entry| entry.id == id) {
        table.remove(key);
    }
}

pub struct Deduplicator<T> {
    name: &'static str,
    in_flight: Arc<Table<T>>,
    next_id: AtomicU64,
}

impl<T> Deduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Run `f` for `key`, or join the call already in flight for it.
    ///
    /// `f` is only invoked when no call is in flight; every joined caller
    /// receives a clone of the same result. Dropping the returned future does
    /// not cancel the call. Must be called from within a tokio runtime.
    pub async fn dedupe<F, Fut>(&self, key: &str, f: F) -> TesseraResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = TesseraResult<T>> + Send + 'static,
    {
        self.join_or_start(key, f).await
    }

    /// Like [`Self::dedupe`], but never joins a call that was already in
    /// flight when this one was requested.
    ///
    /// Waits for that call to settle, then starts (or joins) a new one. A
    /// call joined at that point began after this request, so its result
    /// reflects remote state at least as new as the moment of the request.
    pub async fn dedupe_fresh<F, Fut>(&self, key: &str, f: F) -> TesseraResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = TesseraResult<T>> + Send + 'static,
    {
        self.settled(key).await;
        self.dedupe(key, f).await
    }

    /// Wait for the call in flight for `key`, if any, without starting one.
    pub async fn settled(&self, key: &str) {
        let pending = lock(&self.in_flight)
            .get(key)
            .map(|entry| entry.call.clone());

        if let Some(call) = pending {
            tracing::debug!(dedup = self.name, key, "Waiting for older in-flight call");
            // Only its completion matters; the result may predate the request.
            let _ = call.await;
        }
    }

    fn join_or_start<F, Fut>(&self, key: &str, f: F) -> SharedCall<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = TesseraResult<T>> + Send + 'static,
    {
        let mut table = lock(&self.in_flight);
        if let Some(existing) = table.get(key) {
            tracing::trace!(dedup = self.name, key, "Joined in-flight call");
            return existing.call.clone();
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let owner: Weak<Table<T>> = Arc::downgrade(&self.in_flight);
        let owned_key = key.to_string();
        let work = f();
        let task = tokio::spawn(async move {
            let result = work.await;
            if let Some(table) = owner.upgrade() {
                settle(&table, &owned_key, id);
            }
            result
        });

        let name = self.name;
        let call = async move {
            task.await.unwrap_or_else(|e| {
                Err(TesseraError::transient(format!("{name} call did not complete: {e}")))
            })
        }
        .boxed()
        .shared();
        table.insert(
            key.to_string(),
            InFlight {
                id,
                call: call.clone(),
            },
        );
        call
    }

    pub fn in_flight_count(&self) -> usize {
        lock(&self.in_flight).len()
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        lock(&self.in_flight).contains_key(key)
    }
}

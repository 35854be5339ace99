//! Watermarks for staleness comparison.
//!
//! A watermark summarizes what a cache entry knows about its scope: the
//! newest remote mutation it reflects and how many documents it holds.
//! Comparing it with a fresh [`ScopeProbe`] tells whether the remote store has
//! moved on. The document count catches deletions, which never raise the max
//! mutation timestamp.

use tessera_core::{Document, Payload, RemoteTimestamp, ScopeProbe};

use crate::store::CacheEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Watermark {
    /// Max mutation timestamp reflected by the cached payload.
    pub server_timestamp: Option<RemoteTimestamp>,
    /// Documents in the cached payload.
    pub document_count: usize,
}

impl Watermark {
    pub fn new(server_timestamp: Option<RemoteTimestamp>, document_count: usize) -> Self {
        Self {
            server_timestamp,
            document_count,
        }
    }

    /// Watermark of a cache entry. Uses the entry's recorded server timestamp
    /// rather than recomputing it from the payload.
    pub fn of_entry<D: Document>(entry: &CacheEntry<Payload<D>>) -> Self {
        Self::new(entry.server_timestamp, entry.payload.len())
    }

    /// Whether the probe shows remote state this watermark does not reflect.
    ///
    /// A watermark without a server timestamp is always superseded.
    pub fn is_superseded_by(&self, probe: &ScopeProbe) -> bool {
        let Some(cached) = self.server_timestamp else {
            return true;
        };
        let newer = probe.max_mutation.is_some_and(|remote| remote > cached);
        newer || probe.document_count != self.document_count
    }
}

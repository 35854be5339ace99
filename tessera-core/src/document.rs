//! Documents and materialized query payloads.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::identity::{DocumentId, RemoteTimestamp};

/// A remote document as seen by the cache layer.
///
/// The cache only needs identity and the two mutation timestamps; the rest of
/// the document is opaque.
///
/// # Implementation Requirements
///
/// - `document_id()` must be unique within the document's collection
/// - `updated_at()` must be the authoritative remote mutation time, or `None`
///   if the document was never updated after creation
/// - Implementations must be `Clone`, `Serialize`, and `DeserializeOwned`
/// - Implementations must be `Send + Sync + 'static` for async compatibility
pub trait Document: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    fn document_id(&self) -> DocumentId;

    fn created_at(&self) -> Option<RemoteTimestamp>;

    fn updated_at(&self) -> Option<RemoteTimestamp>;

    /// Timestamp used for staleness: `updated_at`, falling back to `created_at`.
    fn mutation_timestamp(&self) -> Option<RemoteTimestamp> {
        self.updated_at().or_else(|| self.created_at())
    }
}

/// Materialized result of a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload<D> {
    /// Point read. `None` means the document does not exist, which is a valid
    /// outcome rather than an error.
    Document(Option<D>),
    /// Predicate query result.
    Collection(Vec<D>),
}

impl<D> Payload<D> {
    /// Number of documents in the payload.
    pub fn len(&self) -> usize {
        match self {
            Self::Document(doc) => usize::from(doc.is_some()),
            Self::Collection(docs) => docs.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn documents(&self) -> impl Iterator<Item = &D> {
        let (single, many): (Option<&D>, &[D]) = match self {
            Self::Document(doc) => (doc.as_ref(), Default::default()),
            Self::Collection(docs) => (None, docs.as_slice()),
        };
        single.into_iter().chain(many.iter())
    }
}

impl<D: Document> Payload<D> {
    /// Max mutation timestamp across the payload's documents.
    pub fn server_timestamp(&self) -> Option<RemoteTimestamp> {
        self.documents().filter_map(Document::mutation_timestamp).max()
    }

    pub fn get(&self, id: &DocumentId) -> Option<&D> {
        self.documents().find(|doc| &doc.document_id() == id)
    }

    /// Replace the document with the same id, or add it if absent.
    pub fn upsert(&mut self, document: D) {
        match self {
            Self::Document(slot) => *slot = Some(document),
            Self::Collection(docs) => {
                let id = document.document_id();
                match docs.iter_mut().find(|existing| existing.document_id() == id) {
                    Some(existing) => *existing = document,
                    None => docs.push(document),
                }
            }
        }
    }

    /// Remove the document with the given id, if present.
    pub fn remove(&mut self, id: &DocumentId) {
        match self {
            Self::Document(slot) => {
                if slot.as_ref().is_some_and(|doc| &doc.document_id() == id) {
                    *slot = None;
                }
            }
            Self::Collection(docs) => docs.retain(|doc| &doc.document_id() != id),
        }
    }
}

//! Mutation operations accumulated into atomic batches.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::document::Document;
use crate::identity::DocumentId;

/// Address of a single remote document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentRef {
    pub collection: String,
    pub id: DocumentId,
}

/// A pending write against the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MutationOp<D> {
    Create {
        collection: String,
        document: D,
    },
    /// Merge `delta` into the existing document's fields.
    Update {
        collection: String,
        id: DocumentId,
        delta: Map<String, Value>,
    },
    Delete {
        collection: String,
        id: DocumentId,
    },
}

impl<D: Document> MutationOp<D> {
    pub fn target(&self) -> DocumentRef {
        match self {
            Self::Create {
                collection,
                document,
            } => DocumentRef {
                collection: collection.clone(),
                id: document.document_id(),
            },
            Self::Update { collection, id, .. } | Self::Delete { collection, id } => {
                DocumentRef {
                    collection: collection.clone(),
                    id: id.clone(),
                }
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
        }
    }
}

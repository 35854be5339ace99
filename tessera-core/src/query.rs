//! Query descriptors and predicate evaluation.
//!
//! A [`QueryDescriptor`] names the result set a caller wants: either a single
//! document by id or every document in a collection matching a conjunction of
//! [`Filter`]s. Descriptors derive their [`ScopeKey`](crate::ScopeKey) through
//! a canonical text form, so filter order never produces a distinct cache
//! entry or a second subscription.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::Document;
use crate::identity::DocumentId;

/// Field predicate on a JSON-serialized document.
///
/// Field names may use dots to reach nested objects (`"owner.id"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Filter {
    /// Field equals value.
    Eq { field: String, value: Value },
    /// Field is an array that contains value.
    ArrayContains { field: String, value: Value },
    /// Field equals one of the values.
    In { field: String, values: Vec<Value> },
    /// At least one nested filter matches.
    AnyOf { filters: Vec<Filter> },
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn array_contains(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::ArrayContains {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn is_in<V: Into<Value>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Self::In {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn any_of(filters: impl IntoIterator<Item = Filter>) -> Self {
        Self::AnyOf {
            filters: filters.into_iter().collect(),
        }
    }

    /// Evaluate against a JSON-serialized document.
    pub fn matches(&self, document: &Value) -> bool {
        match self {
            Self::Eq { field, value } => lookup(document, field) == Some(value),
            Self::ArrayContains { field, value } => lookup(document, field)
                .and_then(Value::as_array)
                .is_some_and(|items| items.contains(value)),
            Self::In { field, values } => {
                lookup(document, field).is_some_and(|found| values.contains(found))
            }
            Self::AnyOf { filters } => filters.iter().any(|f| f.matches(document)),
        }
    }

    fn canonical(&self) -> String {
        match self {
            Self::Eq { field, value } => format!("{field}=={value}"),
            Self::ArrayContains { field, value } => format!("{field}[]=={value}"),
            Self::In { field, values } => {
                let mut rendered: Vec<String> = values.iter().map(Value::to_string).collect();
                rendered.sort();
                rendered.dedup();
                format!("{field} in [{}]", rendered.join(","))
            }
            Self::AnyOf { filters } => {
                let mut rendered: Vec<String> = filters.iter().map(Filter::canonical).collect();
                rendered.sort();
                rendered.dedup();
                format!("any({})", rendered.join("|"))
            }
        }
    }
}

/// What a caller wants materialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryDescriptor {
    /// Single document by id.
    Point { collection: String, id: DocumentId },
    /// All documents in `collection` matching every filter.
    Predicate {
        collection: String,
        filters: Vec<Filter>,
    },
}

impl QueryDescriptor {
    pub fn point(collection: impl Into<String>, id: impl Into<DocumentId>) -> Self {
        Self::Point {
            collection: collection.into(),
            id: id.into(),
        }
    }

    /// Every document in the collection; narrow it with [`Self::filter`].
    pub fn collection(collection: impl Into<String>) -> Self {
        Self::Predicate {
            collection: collection.into(),
            filters: Vec::new(),
        }
    }

    /// Add a conjunctive filter. No-op on point queries.
    pub fn filter(mut self, filter: Filter) -> Self {
        if let Self::Predicate { filters, .. } = &mut self {
            filters.push(filter);
        }
        self
    }

    pub fn collection_name(&self) -> &str {
        match self {
            Self::Point { collection, .. } | Self::Predicate { collection, .. } => collection,
        }
    }

    pub fn is_point(&self) -> bool {
        matches!(self, Self::Point { .. })
    }

    /// Whether a JSON-serialized document in `collection` belongs to this
    /// result set. Point queries compare the `id` field.
    pub fn matches_value(&self, collection: &str, document: &Value) -> bool {
        if collection != self.collection_name() {
            return false;
        }
        match self {
            Self::Point { id, .. } => {
                document.get("id").and_then(Value::as_str) == Some(id.as_str())
            }
            Self::Predicate { filters, .. } => filters.iter().all(|f| f.matches(document)),
        }
    }

    /// Whether a typed document in `collection` belongs to this result set.
    pub fn matches<D: Document>(&self, collection: &str, document: &D) -> bool {
        if collection != self.collection_name() {
            return false;
        }
        match self {
            Self::Point { id, .. } => &document.document_id() == id,
            Self::Predicate { filters, .. } => match serde_json::to_value(document) {
                Ok(value) => filters.iter().all(|f| f.matches(&value)),
                Err(_) => false,
            },
        }
    }

    pub(crate) fn canonical_key(&self) -> String {
        match self {
            Self::Point { collection, id } => format!("doc:{collection}/{id}"),
            Self::Predicate {
                collection,
                filters,
            } => {
                let mut rendered: Vec<String> = filters.iter().map(Filter::canonical).collect();
                rendered.sort();
                rendered.dedup();
                format!("query:{collection}?{}", rendered.join("&"))
            }
        }
    }
}

fn lookup<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(document, |current, segment| current.get(segment))
}

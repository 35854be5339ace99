//! Identity types for Tessera scopes and documents

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::query::QueryDescriptor;

/// Local wall-clock time (when something was fetched or invalidated).
pub type Timestamp = DateTime<Utc>;

/// Identifier of the signed-in identity that owns a coherence layer instance.
pub type IdentityId = Uuid;

/// Generate a new UUIDv7 identity id (timestamp-sortable).
pub fn new_identity_id() -> IdentityId {
    Uuid::now_v7()
}

/// Mutation timestamp on the remote store's clock, in milliseconds.
///
/// Only ever compared against other remote timestamps, never against the
/// local clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteTimestamp(i64);

impl RemoteTimestamp {
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    pub const fn as_millis(&self) -> i64 {
        self.0
    }
}

impl From<DateTime<Utc>> for RemoteTimestamp {
    fn from(value: DateTime<Utc>) -> Self {
        Self(value.timestamp_millis())
    }
}

impl fmt::Display for RemoteTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Remote document identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DocumentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for DocumentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Deterministic identifier of a query's result set.
///
/// The same key addresses the cache entry, the in-flight request, the
/// subscription record and the projection slot for that result set.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeKey(String);

impl ScopeKey {
    /// Wrap an explicit key such as `"lib/42"`.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Derive the key from a query descriptor.
    ///
    /// Logically equal descriptors (same filters in any order) produce the
    /// same key.
    pub fn for_query(query: &QueryDescriptor) -> Self {
        Self(query.canonical_key())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_timestamp_ordering() {
        let earlier = RemoteTimestamp::from_millis(100);
        let later = RemoteTimestamp::from_millis(150);
        assert!(later > earlier);
        assert_eq!(Some(later), [Some(earlier), Some(later), None].into_iter().flatten().max());
    }

    #[test]
    fn test_remote_timestamp_from_datetime() {
        let at = DateTime::<Utc>::from_timestamp_millis(1_700_000_000_123)
            .expect("valid timestamp");
        assert_eq!(RemoteTimestamp::from(at).as_millis(), 1_700_000_000_123);
    }

    #[test]
    fn test_remote_timestamp_serializes_as_integer() {
        let json = serde_json::to_string(&RemoteTimestamp::from_millis(42)).unwrap();
        assert_eq!(json, "42");
    }

    #[test]
    fn test_scope_key_display() {
        let key = ScopeKey::new("lib/42");
        assert_eq!(key.to_string(), "lib/42");
        assert_eq!(key.as_str(), "lib/42");
    }
}

//! Tessera Core - Shared Types
//!
//! Data types, error taxonomy, configuration and the remote-store seam used by
//! every other Tessera crate. This crate holds no caching policy of its own.

pub mod config;
pub mod document;
pub mod error;
pub mod identity;
pub mod mutation;
pub mod query;
pub mod remote;

pub use config::{
    CacheLimits, CoherenceConfig, ReconnectConfig, RematerializeMode, ThrottleConfig,
};
pub use document::{Document, Payload};
pub use error::{
    CoherenceError, ConfigError, RemoteError, TesseraError, TesseraResult,
};
pub use identity::{new_identity_id, DocumentId, IdentityId, RemoteTimestamp, ScopeKey, Timestamp};
pub use mutation::{DocumentRef, MutationOp};
pub use query::{Filter, QueryDescriptor};
pub use remote::{ChangeEvent, ListenerHandle, RemoteStore, RemoteSubscription, ScopeProbe};

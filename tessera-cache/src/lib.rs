//! Cache layer with correctness contracts against a multi-writer remote store.
//!
//! Reads are cache-first but never silently stale: every cache hit is
//! validated against the remote store with a cheap timestamp probe before it
//! is served, and a failed probe counts as stale.
//!
//! # Design Philosophy
//!
//! Traditional caches hide their staleness, leading to subtle bugs. This crate
//! makes freshness explicit: callers pick a [`Freshness`] policy, and reads
//! return [`CacheRead<T>`] which says whether the value came from the cache
//! and which remote mutation timestamp it reflects.
//!
//! # Request Volume
//!
//! Every outbound read passes through a [`Deduplicator`] (concurrent identical
//! requests share one call) and a [`Throttler`] (minimum spacing between
//! calls), so a burst of UI reads neither duplicates work nor exceeds rate
//! budgets.
//!
//! # Example
//!
//! ```ignore
//! let coordinator = QueryCoordinator::new(remote, cache, read_throttle);
//!
//! // Validated against the remote store before a hit is served
//! let read = coordinator.query(&key, &query, Freshness::Consistent).await?;
//!
//! // Skip the probe for entries fetched in the last 30 seconds
//! let read = coordinator
//!     .query(&key, &query, Freshness::best_effort(Duration::from_secs(30)))
//!     .await?;
//!
//! if read.was_cache_miss() {
//!     tracing::debug!(server_timestamp = ?read.server_timestamp(), "refetched");
//! }
//! ```

pub mod batch;
pub mod coordinator;
pub mod dedup;
pub mod freshness;
pub mod staleness;
pub mod store;
pub mod throttle;
pub mod watermark;

pub use batch::{BatchMutationManager, CommitReceipt};
pub use coordinator::{PayloadCache, QueryCoordinator};
pub use dedup::Deduplicator;
pub use freshness::{CacheRead, Freshness};
pub use staleness::{RemoteProbeOracle, StalenessOracle};
pub use store::{CacheEntry, CacheStats, CacheStore};
pub use throttle::Throttler;
pub use watermark::Watermark;

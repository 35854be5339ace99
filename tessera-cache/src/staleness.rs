//! Staleness oracle.
//!
//! Decides whether a cache entry may be served by comparing its
//! [`Watermark`] with a cheap remote probe. The oracle fails closed: when the
//! probe cannot be answered the entry is treated as stale and the caller
//! refetches, so an unreachable remote never turns into a silently stale read.

use std::sync::Arc;

use async_trait::async_trait;
use tessera_core::{QueryDescriptor, RemoteStore, ScopeKey, ScopeProbe, TesseraResult};

use crate::dedup::Deduplicator;
use crate::throttle::Throttler;
use crate::watermark::Watermark;

/// Answers whether a cached scope must be refetched.
#[async_trait]
pub trait StalenessOracle: Send + Sync {
    /// Never fails: any error answering the question means "stale".
    async fn is_stale(&self, key: &ScopeKey, query: &QueryDescriptor, watermark: Watermark)
        -> bool;

    /// Like [`Self::is_stale`], but never answers from a check that was
    /// already under way when it was called.
    async fn is_stale_now(
        &self,
        key: &ScopeKey,
        query: &QueryDescriptor,
        watermark: Watermark,
    ) -> bool {
        self.is_stale(key, query, watermark).await
    }
}

/// Oracle backed by [`RemoteStore::probe`].
///
/// Probes go through the shared read throttle and are deduplicated per scope.
pub struct RemoteProbeOracle<R> {
    remote: Arc<R>,
    throttle: Arc<Throttler>,
    probes: Deduplicator<ScopeProbe>,
}

impl<R: RemoteStore> RemoteProbeOracle<R> {
    pub fn new(remote: Arc<R>, throttle: Arc<Throttler>) -> Self {
        Self {
            remote,
            throttle,
            probes: Deduplicator::new("probe"),
        }
    }

    /// Probe the remote store for a scope's mutation metadata.
    pub async fn probe(&self, key: &ScopeKey, query: &QueryDescriptor) -> TesseraResult<ScopeProbe> {
        self.probe_with(key, query, false).await
    }

    async fn probe_with(
        &self,
        key: &ScopeKey,
        query: &QueryDescriptor,
        fresh: bool,
    ) -> TesseraResult<ScopeProbe> {
        let remote = Arc::clone(&self.remote);
        let throttle = Arc::clone(&self.throttle);
        let query = query.clone();
        let call = move || async move { throttle.run(|| remote.probe(&query)).await };
        if fresh {
            self.probes.dedupe_fresh(key.as_str(), call).await
        } else {
            self.probes.dedupe(key.as_str(), call).await
        }
    }

    async fn check(
        &self,
        key: &ScopeKey,
        query: &QueryDescriptor,
        watermark: Watermark,
        fresh: bool,
    ) -> bool {
        if watermark.server_timestamp.is_none() {
            tracing::debug!(scope = %key, "No server timestamp cached; treating as stale");
            return true;
        }

        match self.probe_with(key, query, fresh).await {
            Ok(probe) => {
                let stale = watermark.is_superseded_by(&probe);
                tracing::debug!(
                    scope = %key,
                    cached = ?watermark.server_timestamp,
                    remote = ?probe.max_mutation,
                    cached_count = watermark.document_count,
                    remote_count = probe.document_count,
                    stale,
                    "Probed scope"
                );
                stale
            }
            Err(e) => {
                tracing::warn!(
                    scope = %key,
                    error = %e,
                    "Staleness probe failed; treating cache entry as stale"
                );
                true
            }
        }
    }
}

#[async_trait]
impl<R: RemoteStore> StalenessOracle for RemoteProbeOracle<R> {
    async fn is_stale(
        &self,
        key: &ScopeKey,
        query: &QueryDescriptor,
        watermark: Watermark,
    ) -> bool {
        self.check(key, query, watermark, false).await
    }

    async fn is_stale_now(
        &self,
        key: &ScopeKey,
        query: &QueryDescriptor,
        watermark: Watermark,
    ) -> bool {
        self.check(key, query, watermark, true).await
    }
}

//! Realtime coherence for Tessera.
//!
//! Sits on top of `tessera-cache` and keeps what the application shows
//! convergent with a remote store that other clients write to:
//!
//! - [`SubscriptionManager`] holds one remote listener per observed scope,
//!   debounces change bursts and re-materializes the scope, and resubscribes
//!   with backoff when the transport drops.
//! - [`ReactiveProjection`] publishes a [`ScopeView`] per scope over a
//!   `tokio::sync::watch` channel, with optimistic patches layered on top of
//!   authoritative data.
//! - [`CoherenceLayer`] is the per-identity entry point wiring it all
//!   together.
//!
//! # Example
//!
//! ```ignore
//! let layer = CoherenceLayer::new(identity, remote, CoherenceConfig::default())?;
//!
//! let mut cards = layer.observe(cards_in_library).await?;
//! while cards.changed().await {
//!     render(&cards.view());
//! }
//!
//! // On sign-out
//! layer.reset_all();
//! ```

pub mod debounce;
pub mod layer;
pub mod projection;
pub mod reconnect;
pub mod subscription;
pub mod telemetry;

pub use debounce::Debouncer;
pub use layer::{CoherenceLayer, Observation, ResetReport};
pub use projection::{OptimisticPatch, PatchTicket, ReactiveProjection, ScopeStatus, ScopeView};
pub use reconnect::Backoff;
pub use subscription::{SubscriptionGuard, SubscriptionManager, SubscriptionSettings, SubscriptionState};
pub use telemetry::init_tracing;

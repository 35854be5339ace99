//! Tracing subscriber setup for applications embedding Tessera.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding the filter directives, e.g.
/// `TESSERA_LOG=tessera_sync=debug,info`.
pub const LOG_ENV: &str = "TESSERA_LOG";

/// Build the filter from [`LOG_ENV`], falling back to `default_directive`.
pub fn env_filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// Install a global `fmt` subscriber.
///
/// Returns `false` if a global subscriber was already set, in which case
/// the existing one is left in place.
pub fn init_tracing(default_directive: &str) -> bool {
    let installed = tracing_subscriber::registry()
        .with(env_filter(default_directive))
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()
        .is_ok();

    if installed {
        tracing::debug!(env = LOG_ENV, "Tracing initialized");
    }
    installed
}

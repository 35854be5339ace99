//! Error types for Tessera operations

use thiserror::Error;

/// Failures reported by (or about) the remote document store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Transient network error: {reason}")]
    TransientNetwork { reason: String },

    #[error("Permission denied on {resource}")]
    PermissionDenied { resource: String },

    /// Atomic: the caller must assume none of the operations were applied.
    #[error("Batch commit of {operations} operations failed: {reason}")]
    BatchCommitFailed { operations: usize, reason: String },

    #[error("Subscription for {scope} dropped: {reason}")]
    SubscriptionDropped { scope: String, reason: String },

    #[error("Invalid document: {reason}")]
    InvalidDocument { reason: String },
}

/// Failures of the coherence layer's own bookkeeping.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoherenceError {
    #[error("No query registered for scope {scope}")]
    UnknownScope { scope: String },

    #[error("Subscription limit of {limit} reached")]
    SubscriptionLimitReached { limit: usize },

    #[error("Batch is full ({limit} operations)")]
    BatchFull { limit: usize },

    #[error("Resubscribing {scope} failed after {attempts} attempts")]
    ResubscribeExhausted { scope: String, attempts: u32 },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("Failed to parse config TOML: {reason}")]
    Parse { reason: String },

    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        Self::Parse {
            reason: e.to_string(),
        }
    }
}

/// Master error type for all Tessera errors.
///
/// `Clone` so that one deduplicated remote call can hand the same failure to
/// every waiting caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TesseraError {
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Coherence error: {0}")]
    Coherence(#[from] CoherenceError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl TesseraError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Remote(RemoteError::TransientNetwork { .. })
                | Self::Remote(RemoteError::SubscriptionDropped { .. })
        )
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::Remote(RemoteError::PermissionDenied { .. }))
    }

    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Remote(RemoteError::TransientNetwork {
            reason: reason.into(),
        })
    }
}

/// Result type alias for Tessera operations.
pub type TesseraResult<T> = Result<T, TesseraError>;

// =============================================================================
// TESTS
// =============================================================================

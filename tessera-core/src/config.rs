//! Configuration for a coherence layer instance.
//!
//! Loaded from TOML (`CoherenceConfig::from_path`) or built in code from
//! `CoherenceConfig::default()`. Every loaded config goes through `validate`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoherenceConfig {
    /// Quiet period after the last realtime event before a scope is
    /// re-materialized.
    pub debounce_window_ms: u64,
    /// Max concurrently observed scopes (open realtime subscriptions).
    pub max_subscriptions: usize,
    /// Max operations in one atomic batch.
    pub max_batch_operations: usize,
    pub rematerialize: RematerializeMode,
    pub throttle: ThrottleConfig,
    pub cache: CacheLimits,
    pub reconnect: ReconnectConfig,
}

/// What a debounced realtime burst does to its scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RematerializeMode {
    /// Re-fetch immediately and push into cache and projection.
    Eager,
    /// Drop the cache entry; the next query refetches lazily.
    Invalidate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThrottleConfig {
    /// Min spacing between read calls (fetch and probe).
    pub read_spacing_ms: u64,
    /// Min spacing between batch commits.
    pub write_spacing_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheLimits {
    /// LRU capacity of the cache store.
    pub max_entries: usize,
    /// Optional age limit layered over watermark validation.
    #[serde(default)]
    pub entry_ttl_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconnectConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    pub jitter_ms: u64,
    /// Consecutive failed subscribe attempts before a scope degrades to error.
    pub max_attempts: u32,
}

impl Default for CoherenceConfig {
    fn default() -> Self {
        Self {
            debounce_window_ms: 400,
            max_subscriptions: 256,
            max_batch_operations: 500,
            rematerialize: RematerializeMode::Eager,
            throttle: ThrottleConfig {
                read_spacing_ms: 50,
                write_spacing_ms: 100,
            },
            cache: CacheLimits {
                max_entries: 1024,
                entry_ttl_ms: None,
            },
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_ms: 250,
            max_ms: 30_000,
            multiplier: 2.0,
            jitter_ms: 100,
            max_attempts: 8,
        }
    }
}

impl CoherenceConfig {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: CoherenceConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.debounce_window_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "debounce_window_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.max_subscriptions == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_subscriptions",
                reason: "must be > 0".to_string(),
            });
        }
        if self.max_batch_operations == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_batch_operations",
                reason: "must be > 0".to_string(),
            });
        }
        if self.cache.max_entries == 0 {
            return Err(ConfigError::InvalidValue {
                field: "cache.max_entries",
                reason: "must be > 0".to_string(),
            });
        }
        if self.cache.entry_ttl_ms == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "cache.entry_ttl_ms",
                reason: "must be > 0 when set".to_string(),
            });
        }
        if self.reconnect.initial_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "reconnect.initial_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.reconnect.max_ms < self.reconnect.initial_ms {
            return Err(ConfigError::InvalidValue {
                field: "reconnect.max_ms",
                reason: "must be >= reconnect.initial_ms".to_string(),
            });
        }
        if !(self.reconnect.multiplier >= 1.0) {
            return Err(ConfigError::InvalidValue {
                field: "reconnect.multiplier",
                reason: "must be >= 1.0".to_string(),
            });
        }
        if self.reconnect.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "reconnect.max_attempts",
                reason: "must be > 0".to_string(),
            });
        }
        Ok(())
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_window_ms)
    }
}

impl ThrottleConfig {
    pub fn read_spacing(&self) -> Duration {
        Duration::from_millis(self.read_spacing_ms)
    }

    pub fn write_spacing(&self) -> Duration {
        Duration::from_millis(self.write_spacing_ms)
    }
}

impl CacheLimits {
    pub fn entry_ttl(&self) -> Option<Duration> {
        self.entry_ttl_ms.map(Duration::from_millis)
    }
}

//! Resubscribe backoff.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tessera_core::ReconnectConfig;

/// Jittered exponential backoff between resubscribe attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config }
    }

    /// Consecutive failed attempts after which a scope gives up.
    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Delay before the next attempt, given how many attempts have failed in
    /// a row.
    pub fn delay(&self, failed_attempts: u32) -> Duration {
        Duration::from_millis(jittered_backoff(
            self.base_ms(failed_attempts),
            self.config.jitter_ms,
        ))
    }

    fn base_ms(&self, failed_attempts: u32) -> u64 {
        let mut backoff = self.config.initial_ms;
        for _ in 0..failed_attempts {
            let next = ((backoff as f64 * self.config.multiplier) as u64).min(self.config.max_ms);
            if next == backoff {
                break;
            }
            backoff = next;
        }
        backoff
    }
}

fn jittered_backoff(base_ms: u64, jitter_ms: u64) -> u64 {
    if jitter_ms == 0 {
        return base_ms;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_nanos(0))
        .subsec_nanos() as u64;
    let jitter = nanos % jitter_ms;
    base_ms.saturating_add(jitter)
}

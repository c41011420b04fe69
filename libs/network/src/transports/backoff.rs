//! Reconnection backoff schedule

use crate::{Result, TransportError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounded exponential backoff with jitter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the second attempt
    pub base: Duration,
    /// Upper bound for any single delay
    pub max: Duration,
    /// Connection attempts per cycle before the link reports `LinkBroken`
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

impl BackoffConfig {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max,
            max_attempts,
        }
    }

    /// Upper bound of the delay after `attempt` failed attempts (0-based)
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Jittered delay in `[ceiling / 2, ceiling]`
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        let half = ceiling / 2;
        let spread = (ceiling - half).as_millis() as u64;
        if spread == 0 {
            return ceiling;
        }
        half + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(TransportError::configuration(
                "max_attempts must be at least 1",
                Some("max_reconnect_attempts"),
            ));
        }
        if self.base > self.max {
            return Err(TransportError::configuration(
                "backoff base exceeds backoff cap",
                Some("backoff_base_ms"),
            ));
        }
        Ok(())
    }
}

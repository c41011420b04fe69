//! Actor Transport Layer
//!
//! Persistent multiplexed TCP links between processes:
//!
//! - [`Link`]: client side of one connection to a remote endpoint, lazily
//!   connected, kept warm with `Ping`, reconnected with bounded backoff
//! - [`Listener`]: accepts inbound connections and hands envelopes to an
//!   [`InboundHandler`]; replies travel back on the same connection
//! - [`LinkPool`]: endpoint → link map shared by the router

use crate::{Result, TransportError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub mod backoff;
pub mod link;
pub mod listener;
pub mod metrics;
pub mod pool;
pub mod tcp;

pub use backoff::BackoffConfig;
pub use link::{Link, LinkReply, LinkState};
pub use listener::{InboundHandler, Listener, ReplySink};
pub use metrics::{LinkMetrics, MetricsTracker};
pub use pool::{LinkPool, LinkPoolStats};

/// Pool id reserved for link-level control traffic
pub const SYSTEM_POOL: &str = "$system";

/// What a link does with tells while it has no live connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TellPolicy {
    /// Queue up to `max` tells and flush them in order after reconnecting
    Buffer { max: usize },
    /// Fail the tell with `LinkBroken` immediately
    FailFast,
}

impl Default for TellPolicy {
    fn default() -> Self {
        TellPolicy::Buffer { max: 1024 }
    }
}

/// Link configuration shared by every link in a pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Per-attempt connect timeout
    pub connect_timeout: Duration,
    /// Reconnection schedule
    pub backoff: BackoffConfig,
    /// Interval between `Ping` frames on an idle link
    pub keepalive_interval: Duration,
    /// Maximum frame body size accepted or produced
    pub max_frame_size: usize,
    /// Tell policy for endpoints without an override
    pub tell_policy: TellPolicy,
    /// Per-endpoint tell policy overrides
    pub link_overrides: HashMap<String, TellPolicy>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            backoff: BackoffConfig::default(),
            keepalive_interval: Duration::from_secs(5),
            max_frame_size: crate::protocol::WireFormat::MAX_FRAME_SIZE,
            tell_policy: TellPolicy::default(),
            link_overrides: HashMap::new(),
        }
    }
}

impl LinkConfig {
    /// Effective tell policy for one endpoint
    pub fn tell_policy_for(&self, endpoint: &str) -> TellPolicy {
        self.link_overrides
            .get(endpoint)
            .copied()
            .unwrap_or(self.tell_policy)
    }

    pub fn with_tell_policy(mut self, policy: TellPolicy) -> Self {
        self.tell_policy = policy;
        self
    }

    pub fn with_override(mut self, endpoint: impl Into<String>, policy: TellPolicy) -> Self {
        self.link_overrides.insert(endpoint.into(), policy);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_frame_size == 0 || self.max_frame_size > u32::MAX as usize {
            return Err(TransportError::configuration(
                "max_frame_size must be within 1..=u32::MAX",
                Some("max_frame_size"),
            ));
        }
        if self.keepalive_interval.is_zero() {
            return Err(TransportError::configuration(
                "keepalive_interval must be non-zero",
                Some("keepalive_interval"),
            ));
        }
        self.backoff.validate()
    }
}

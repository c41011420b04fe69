//! Runtime Configuration Module
//!
//! Loads the actor runtime configuration from an optional TOML file with
//! `OSCAR_`-prefixed environment overrides. Nested keys use a double
//! underscore: `OSCAR_POOL__WORKERS=8`, `OSCAR_TRANSPORT__TELL_POLICY=fail_fast`.

use crate::defaults;
use anyhow::{bail, Context, Result};
use config_crate::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Complete runtime configuration
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    pub pool: PoolSection,
    pub transport: TransportSection,
    pub supervision: SupervisionSection,
    pub call: CallSection,
    pub logging: LoggingSection,
}

/// Worker and mailbox settings applied to every pool
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct PoolSection {
    pub workers: usize,
    /// Mailbox length at which senders start to wait; unbounded when absent
    pub high_watermark: Option<usize>,
    /// Length a full mailbox must drain to before senders resume; `high / 2` when absent
    pub low_watermark: Option<usize>,
}

/// How tells are handled while a link is disconnected
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TellPolicySetting {
    /// Queue up to `tell_buffer` tells and flush them after reconnecting
    #[default]
    Buffer,
    /// Fail the tell with `LinkBroken`
    FailFast,
}

/// Link and listener settings
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct TransportSection {
    pub connect_timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub max_reconnect_attempts: u32,
    pub keepalive_interval_ms: u64,
    pub max_frame_size: usize,
    pub tell_policy: TellPolicySetting,
    pub tell_buffer: usize,
    /// Per-endpoint tell policy, keyed by `host:port`
    pub link_overrides: HashMap<String, TellPolicySetting>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct SupervisionSection {
    /// Restarts allowed per actor within `restart_window_ms` before it is stopped
    pub max_restarts: u32,
    pub restart_window_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct CallSection {
    pub default_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    pub log_dir: Option<PathBuf>,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(defaults::pool::FALLBACK_WORKERS),
            high_watermark: None,
            low_watermark: None,
        }
    }
}

impl PoolSection {
    /// Effective low watermark, if the mailbox is bounded
    pub fn effective_low_watermark(&self) -> Option<usize> {
        self.high_watermark
            .map(|high| self.low_watermark.unwrap_or(high / 2))
    }
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            connect_timeout_ms: defaults::transport::CONNECT_TIMEOUT_MS,
            backoff_base_ms: defaults::transport::BACKOFF_BASE_MS,
            backoff_max_ms: defaults::transport::BACKOFF_MAX_MS,
            max_reconnect_attempts: defaults::transport::MAX_RECONNECT_ATTEMPTS,
            keepalive_interval_ms: defaults::transport::KEEPALIVE_INTERVAL_MS,
            max_frame_size: defaults::transport::MAX_FRAME_SIZE,
            tell_policy: TellPolicySetting::default(),
            tell_buffer: defaults::transport::TELL_BUFFER,
            link_overrides: HashMap::new(),
        }
    }
}

impl Default for SupervisionSection {
    fn default() -> Self {
        Self {
            max_restarts: defaults::supervision::MAX_RESTARTS,
            restart_window_ms: defaults::supervision::RESTART_WINDOW_MS,
        }
    }
}

impl Default for CallSection {
    fn default() -> Self {
        Self {
            default_timeout_ms: defaults::call::DEFAULT_TIMEOUT_MS,
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl RuntimeConfig {
    /// Load from `path` (optional) with `OSCAR_` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_prefix(path, defaults::ENV_PREFIX)
    }

    /// Load with a custom environment prefix
    pub fn load_with_prefix(path: Option<&Path>, env_prefix: &str) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            info!("Loading runtime config: {:?}", path);
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(env_prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: RuntimeConfig = builder
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.expand_env_vars()?;
        config.validate()?;
        debug!(workers = config.pool.workers, "Runtime config loaded");
        Ok(config)
    }

    /// Parse a TOML document directly, without environment overrides
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut config: RuntimeConfig =
            toml::from_str(content).context("Failed to parse runtime config")?;
        config.expand_env_vars()?;
        config.validate()?;
        Ok(config)
    }

    /// Expand environment variables and `~` in path values
    pub fn expand_env_vars(&mut self) -> Result<()> {
        if let Some(dir) = &self.logging.log_dir {
            let raw = dir.to_string_lossy().into_owned();
            let expanded = shellexpand::full(&raw)
                .context("Failed to expand log_dir")?
                .into_owned();
            self.logging.log_dir = Some(PathBuf::from(expanded));
        }
        Ok(())
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> Result<()> {
        if self.pool.workers == 0 {
            bail!("pool.workers must be at least 1");
        }
        match (self.pool.high_watermark, self.pool.low_watermark) {
            (Some(0), _) => bail!("pool.high_watermark must be at least 1"),
            (Some(high), Some(low)) if low >= high => {
                bail!("pool.low_watermark ({}) must be below pool.high_watermark ({})", low, high)
            }
            (None, Some(_)) => bail!("pool.low_watermark requires pool.high_watermark"),
            _ => {}
        }

        let transport = &self.transport;
        if transport.max_reconnect_attempts == 0 {
            bail!("transport.max_reconnect_attempts must be at least 1");
        }
        if transport.backoff_base_ms > transport.backoff_max_ms {
            bail!(
                "transport.backoff_base_ms ({}) exceeds transport.backoff_max_ms ({})",
                transport.backoff_base_ms,
                transport.backoff_max_ms
            );
        }
        if transport.keepalive_interval_ms == 0 || transport.connect_timeout_ms == 0 {
            bail!("transport timeouts and intervals must be non-zero");
        }
        if transport.max_frame_size < 64 {
            bail!("transport.max_frame_size ({}) is too small", transport.max_frame_size);
        }
        if transport.tell_buffer == 0 {
            bail!("transport.tell_buffer must be at least 1");
        }

        if self.supervision.restart_window_ms == 0 {
            bail!("supervision.restart_window_ms must be non-zero");
        }
        if self.call.default_timeout_ms == 0 {
            bail!("call.default_timeout_ms must be non-zero");
        }
        Ok(())
    }
}

/// Convenience function to load configuration from an optional file
pub fn load_config(path: Option<&Path>) -> Result<RuntimeConfig> {
    RuntimeConfig::load(path)
}

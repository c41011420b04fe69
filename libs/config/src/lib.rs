//! # oscar Runtime Configuration
//!
//! Layered configuration for the actor runtime: defaults, an optional TOML
//! file, then `OSCAR_`-prefixed environment variables.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use oscar_config::RuntimeConfig;
//! use std::path::Path;
//!
//! let config = RuntimeConfig::load(Some(Path::new("config/oscar.toml"))).unwrap();
//! println!("workers per pool: {}", config.pool.workers);
//! ```

pub mod defaults;
pub mod runtime;

// Re-export commonly used types
pub use runtime::{
    load_config, CallSection, LoggingSection, PoolSection, RuntimeConfig, SupervisionSection,
    TellPolicySetting, TransportSection,
};

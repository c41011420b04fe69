//! Runtime defaults
//!
//! Default values used when a setting is absent from both the config file
//! and the environment.

/// Pool defaults
pub mod pool {
    /// Lower bound on workers when the CPU count cannot be read
    pub const FALLBACK_WORKERS: usize = 4;
}

/// Transport defaults
pub mod transport {
    /// Connection timeout (milliseconds)
    pub const CONNECT_TIMEOUT_MS: u64 = 5_000;

    /// Reconnection backoff base (milliseconds)
    pub const BACKOFF_BASE_MS: u64 = 100;

    /// Reconnection backoff cap (milliseconds)
    pub const BACKOFF_MAX_MS: u64 = 5_000;

    /// Connection attempts per reconnection cycle
    pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

    /// Link keep-alive ping interval (milliseconds)
    pub const KEEPALIVE_INTERVAL_MS: u64 = 5_000;

    /// Largest accepted frame body
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

    /// Tells queued per link while disconnected
    pub const TELL_BUFFER: usize = 1024;
}

/// Supervision defaults
pub mod supervision {
    pub const MAX_RESTARTS: u32 = 3;

    pub const RESTART_WINDOW_MS: u64 = 60_000;
}

/// Call defaults
pub mod call {
    pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
}

/// Environment variable prefix for overrides, e.g. `OSCAR_POOL__WORKERS=8`
pub const ENV_PREFIX: &str = "OSCAR";

//! Tracing Setup
//!
//! Installs a global `tracing` subscriber from the `[logging]` section.
//! `RUST_LOG` wins over the configured level when set. With a `log_dir`,
//! events are also written as JSON lines to `<log_dir>/oscar.log` by a
//! background writer thread.

use crate::error::{ActorError, Result};
use oscar_config::LoggingSection;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const LOG_FILE: &str = "oscar.log";

/// Install the global subscriber; fails if one is already installed
///
/// When a log file is configured the returned guard owns its writer
/// thread. Keep it alive for the life of the process; dropping it flushes
/// and closes the file.
pub fn init_tracing(logging: &LoggingSection) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .map_err(|e| ActorError::Configuration(format!("invalid log level '{}': {}", logging.level, e)))?;

    let (file_layer, guard) = match &logging.log_dir {
        Some(dir) => {
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::NEVER)
                .filename_prefix(LOG_FILE)
                .build(dir)
                .map_err(|e| ActorError::Configuration(format!("cannot open log in {}: {}", dir.display(), e)))?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .try_init()
        .map_err(|e| ActorError::Configuration(format!("tracing already initialized: {}", e)))?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test per binary may own the global subscriber
    #[test]
    fn test_json_log_file_and_single_install() {
        let dir = tempfile::tempdir().unwrap();
        let logging = LoggingSection {
            level: "info".to_string(),
            log_dir: Some(dir.path().join("logs")),
        };

        let guard = init_tracing(&logging).unwrap();
        assert!(guard.is_some());
        tracing::info!(pool = "main", "pool ready for the log file");

        let err = init_tracing(&LoggingSection::default()).unwrap_err();
        assert!(matches!(err, ActorError::Configuration(_)));

        // Dropping the guard flushes the writer thread
        drop(guard);
        let written = std::fs::read_to_string(dir.path().join("logs").join(LOG_FILE)).unwrap();
        let line = written
            .lines()
            .find(|line| line.contains("pool ready for the log file"))
            .expect("event in log file");
        assert!(line.starts_with('{'));
        assert!(line.contains("\"pool\":\"main\""));
    }
}

//! Transport Error Types
//!
//! Failures of the envelope codec, outbound links and the inbound listener.
//! Sources are shared behind `Arc` so errors stay cheap to clone; a single
//! failed connection fans the same error out to every call waiting on it.

use std::error::Error as StdError;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

type Source = Arc<dyn StdError + Send + Sync>;

#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// Socket-level failure on an established or listening socket
    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<Source>,
    },

    /// Connecting to, or writing back to, a specific peer failed
    #[error("Connection error: {message}{}", peer_suffix(.peer))]
    Connection {
        message: String,
        peer: Option<SocketAddr>,
        #[source]
        source: Option<Source>,
    },

    /// Malformed envelope, payload or control message
    #[error("Protocol error: {message}")]
    Protocol {
        message: String,
        #[source]
        source: Option<Source>,
    },

    /// A frame above the negotiated maximum; the connection is dropped
    #[error("Frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    /// Invalid link or backoff settings
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    #[error("Timeout error: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// The link to a remote endpoint is down and the operation cannot complete
    #[error("Link to {endpoint} broken: {reason}")]
    LinkBroken { endpoint: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[source] Arc<std::io::Error>),
}

fn peer_suffix(peer: &Option<SocketAddr>) -> String {
    peer.map(|p| format!(" (peer {})", p)).unwrap_or_default()
}

/// Result type alias for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

impl TransportError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            source: None,
        }
    }

    pub fn network_with_source(message: impl Into<String>, source: impl StdError + Send + Sync + 'static) -> Self {
        Self::Network {
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }

    pub fn connection(message: impl Into<String>, peer: Option<SocketAddr>) -> Self {
        Self::Connection {
            message: message.into(),
            peer,
            source: None,
        }
    }

    pub fn connection_with_source(
        message: impl Into<String>,
        peer: Option<SocketAddr>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            peer,
            source: Some(Arc::new(source)),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
            source: None,
        }
    }

    pub fn protocol_with_source(message: impl Into<String>, source: impl StdError + Send + Sync + 'static) -> Self {
        Self::Protocol {
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }

    pub fn configuration(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: field.map(str::to_string),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn link_broken(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::LinkBroken {
            endpoint: endpoint.into(),
            reason: reason.into(),
        }
    }

    /// Whether the failure came from a connection going away
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            Self::LinkBroken { .. } | Self::Connection { .. } | Self::Network { .. } | Self::Io(_)
        )
    }

    /// Whether a fresh connection attempt may succeed
    ///
    /// Only connection establishment is retried by the transport itself;
    /// payload traffic surfaces every error to the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network { .. } | Self::Connection { .. } | Self::Timeout { .. } | Self::Io(_)
        )
    }

    /// Label for metrics and log fields
    pub fn category(&self) -> &'static str {
        match self {
            Self::Network { .. } => "network",
            Self::Connection { .. } => "connection",
            Self::Protocol { .. } => "protocol",
            Self::FrameTooLarge { .. } => "frame_too_large",
            Self::Configuration { .. } => "configuration",
            Self::Timeout { .. } => "timeout",
            Self::LinkBroken { .. } => "link_broken",
            Self::Io(_) => "io",
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(Arc::new(error))
    }
}

impl From<bincode::Error> for TransportError {
    fn from(error: bincode::Error) -> Self {
        Self::protocol_with_source("Binary serialization failed", error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_names_peer() {
        let peer: SocketAddr = "192.168.1.1:7100".parse().unwrap();
        let err = TransportError::connection("handshake failed", Some(peer));
        assert!(err.to_string().ends_with("(peer 192.168.1.1:7100)"));
        assert!(err.is_link_failure());
        assert!(err.is_retryable());
        assert_eq!(TransportError::connection("gone", None).to_string(), "Connection error: gone");
    }

    #[test]
    fn test_link_broken_is_not_retried() {
        let err = TransportError::link_broken("10.0.0.1:7000", "peer reset");
        assert_eq!(err.category(), "link_broken");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("10.0.0.1:7000"));
    }

    #[test]
    fn test_codec_errors_are_terminal() {
        let oversized = TransportError::FrameTooLarge { len: 10, max: 4 };
        assert_eq!(oversized.category(), "frame_too_large");
        assert!(!oversized.is_retryable());
        assert!(!TransportError::protocol("bad frame").is_link_failure());
        assert!(!TransportError::configuration("zero backoff", Some("backoff")).is_retryable());
    }

    #[test]
    fn test_clone_shares_source() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err = TransportError::network_with_source("write failed", io);
        let cloned = err.clone();
        assert_eq!(err.to_string(), cloned.to_string());
        assert_eq!(cloned.source().map(|s| s.to_string()), Some("pipe".to_string()));
    }

    #[test]
    fn test_io_error_conversion() {
        let err = TransportError::from(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"));
        assert!(matches!(err, TransportError::Io(_)));
        assert!(err.to_string().contains("refused"));
    }
}

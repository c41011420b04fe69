//! Actor Error Types
//!
//! Errors surfaced by the public actor API. Transport failures that mean
//! "the remote side is unreachable" are lifted into [`ActorError::LinkBroken`];
//! everything else from the transport is kept as [`ActorError::Transport`].

use oscar_network::{ReplyError, TransportError};
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum ActorError {
    /// Unknown pool, unknown actor, or an address this system cannot serve
    #[error("Routing failure: {0}")]
    RoutingFailure(String),

    /// The call deadline elapsed before a reply arrived
    #[error("Call timed out: {0}")]
    Timeout(String),

    /// The link to the remote endpoint is down
    #[error("Link to {endpoint} broken: {reason}")]
    LinkBroken { endpoint: String, reason: String },

    /// The destination stopped before or while handling the request
    #[error("Actor terminated: {0}")]
    ActorTerminated(String),

    /// The handler failed (returned an error or panicked) on this request
    #[error("Handler failure: {0}")]
    HandlerFailure(String),

    #[error("Actor already exists: {0}")]
    AlreadyExists(String),

    /// Refused by the receiving system, e.g. an unknown actor type
    #[error("Request rejected: {0}")]
    Rejected(String),

    /// Typed payload could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Transport(TransportError),
}

/// Result type alias for actor operations
pub type Result<T> = std::result::Result<T, ActorError>;

impl ActorError {
    pub fn routing(message: impl Into<String>) -> Self {
        Self::RoutingFailure(message.into())
    }

    pub fn terminated(message: impl Into<String>) -> Self {
        Self::ActorTerminated(message.into())
    }

    /// Error category for logging fields and metrics
    pub fn category(&self) -> &'static str {
        match self {
            ActorError::RoutingFailure(_) => "routing_failure",
            ActorError::Timeout(_) => "timeout",
            ActorError::LinkBroken { .. } => "link_broken",
            ActorError::ActorTerminated(_) => "actor_terminated",
            ActorError::HandlerFailure(_) => "handler_failure",
            ActorError::AlreadyExists(_) => "already_exists",
            ActorError::Rejected(_) => "rejected",
            ActorError::Codec(_) => "codec",
            ActorError::Configuration(_) => "configuration",
            ActorError::Transport(e) => e.category(),
        }
    }

    /// Form in which this error travels back to a remote caller
    pub fn to_reply_error(&self) -> ReplyError {
        match self {
            ActorError::RoutingFailure(m) => ReplyError::RoutingFailure(m.clone()),
            ActorError::Timeout(m) => ReplyError::Timeout(m.clone()),
            ActorError::ActorTerminated(m) => ReplyError::ActorTerminated(m.clone()),
            ActorError::HandlerFailure(m) => ReplyError::HandlerFailure(m.clone()),
            ActorError::AlreadyExists(m) => ReplyError::AlreadyExists(m.clone()),
            other => ReplyError::Rejected(other.to_string()),
        }
    }
}

impl From<TransportError> for ActorError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::LinkBroken { endpoint, reason } => ActorError::LinkBroken { endpoint, reason },
            other => ActorError::Transport(other),
        }
    }
}

impl From<ReplyError> for ActorError {
    fn from(error: ReplyError) -> Self {
        match error {
            ReplyError::RoutingFailure(m) => ActorError::RoutingFailure(m),
            ReplyError::ActorTerminated(m) => ActorError::ActorTerminated(m),
            ReplyError::HandlerFailure(m) => ActorError::HandlerFailure(m),
            ReplyError::Timeout(m) => ActorError::Timeout(m),
            ReplyError::AlreadyExists(m) => ActorError::AlreadyExists(m),
            ReplyError::Rejected(m) => ActorError::Rejected(m),
        }
    }
}

impl From<bincode::Error> for ActorError {
    fn from(error: bincode::Error) -> Self {
        ActorError::Codec(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_broken_is_lifted_from_transport() {
        let err: ActorError = TransportError::link_broken("10.0.0.1:7100", "connection reset").into();
        assert!(matches!(err, ActorError::LinkBroken { ref endpoint, .. } if endpoint == "10.0.0.1:7100"));
        assert_eq!(err.category(), "link_broken");

        let err: ActorError = TransportError::protocol("bad frame").into();
        assert!(matches!(err, ActorError::Transport(_)));
    }

    #[test]
    fn test_reply_error_mapping_is_symmetric() {
        let errors = [
            ActorError::RoutingFailure("a".into()),
            ActorError::Timeout("b".into()),
            ActorError::ActorTerminated("c".into()),
            ActorError::HandlerFailure("d".into()),
            ActorError::AlreadyExists("e".into()),
        ];
        for err in errors {
            let back = ActorError::from(err.to_reply_error());
            assert_eq!(back.category(), err.category());
        }
        assert!(matches!(
            ActorError::Codec("x".into()).to_reply_error(),
            ReplyError::Rejected(_)
        ));
    }
}

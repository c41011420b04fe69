//! Actor Wire Protocol
//!
//! Envelope wire format, length-prefixed framing and the control messages
//! exchanged between pools: call replies, cancellation, lifecycle watches and
//! link keep-alives.

pub mod envelope;
pub mod frame;

pub use envelope::{Envelope, EnvelopeKind, WireFormat};
pub use frame::{encode_frame, FrameDecoder};

use crate::{ActorUid, Result, TransportError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Encode a payload value with bincode
pub fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| TransportError::protocol_with_source("Payload encode failed", e))
}

/// Decode a payload value with bincode
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| TransportError::protocol_with_source("Payload decode failed", e))
}

/// Failure reported back to a caller in place of a reply payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyError {
    /// Destination pool or actor is unknown at the receiving process
    RoutingFailure(String),
    /// Destination stopped before or while handling the request
    ActorTerminated(String),
    /// The handler failed while processing this exact request
    HandlerFailure(String),
    /// The request deadline elapsed before the handler picked it up
    Timeout(String),
    /// An actor with the requested uid already exists
    AlreadyExists(String),
    /// The request was well-formed but refused (unknown actor type, bad init)
    Rejected(String),
}

impl fmt::Display for ReplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplyError::RoutingFailure(m) => write!(f, "routing failure: {}", m),
            ReplyError::ActorTerminated(m) => write!(f, "actor terminated: {}", m),
            ReplyError::HandlerFailure(m) => write!(f, "handler failure: {}", m),
            ReplyError::Timeout(m) => write!(f, "timeout: {}", m),
            ReplyError::AlreadyExists(m) => write!(f, "already exists: {}", m),
            ReplyError::Rejected(m) => write!(f, "rejected: {}", m),
        }
    }
}

/// Outcome of a `Call`, `CreateActor` or `DestroyActor` request
pub type Reply = std::result::Result<Vec<u8>, ReplyError>;

/// Actor lifecycle events published to watchers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleEvent {
    Started,
    Restarted,
    Stopped,
}

/// Control traffic carried in `EnvelopeKind::Control` envelopes
///
/// The envelope id gives the correlation: the original request id for
/// `Reply` and `Cancel`, the subscription id for `Watch`, `Unwatch` and
/// `Lifecycle`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    Reply(Reply),
    Cancel,
    Watch,
    Unwatch,
    Lifecycle(LifecycleEvent),
    Ping,
    Pong,
}

impl ControlMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        encode_payload(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        decode_payload(bytes)
    }
}

/// Supervisor action applied when an actor's handler fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RestartPolicy {
    /// Recreate from the original initial state at the same address
    Restart,
    /// Destroy the actor and its mailbox
    #[default]
    Stop,
    /// Treat the failure as the parent's failure
    Escalate,
}

/// What a child does when its parent is stopped or restarted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OnParentExit {
    /// Apply the parent's resolved action to this child too
    #[default]
    Follow,
    /// Re-parent to the pool root and keep running
    Detach,
}

/// Options accepted by `spawn` and carried by remote `CreateActor` requests
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnOptions {
    /// Explicit uid; generated when absent
    pub uid: Option<ActorUid>,
    pub restart_policy: RestartPolicy,
    /// Parent actor in the same pool; the pool root when absent
    pub parent: Option<ActorUid>,
    pub on_parent_exit: OnParentExit,
}

impl SpawnOptions {
    pub fn with_policy(restart_policy: RestartPolicy) -> Self {
        Self {
            restart_policy,
            ..Default::default()
        }
    }

    pub fn uid(mut self, uid: impl Into<ActorUid>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    pub fn parent(mut self, parent: ActorUid) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn on_parent_exit(mut self, on_parent_exit: OnParentExit) -> Self {
        self.on_parent_exit = on_parent_exit;
        self
    }
}

/// Payload of a `CreateActor` envelope
///
/// The destination address of the envelope is the address the new actor
/// will have; `type_name` selects a factory registered at the receiving
/// process and `init` is handed to that factory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateActorRequest {
    pub type_name: String,
    pub init: Vec<u8>,
    pub options: SpawnOptions,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_message_reply_error_survives_encoding() {
        let msg = ControlMessage::Reply(Err(ReplyError::ActorTerminated("worker-3".into())));
        let bytes = msg.encode().unwrap();
        assert_eq!(ControlMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_decode_garbage_is_protocol_error() {
        let err = ControlMessage::decode(&[0xff, 0xff, 0xff, 0xff, 0xff]).unwrap_err();
        assert_eq!(err.category(), "protocol");
    }

    #[test]
    fn test_default_policy_is_stop() {
        let options = SpawnOptions::default();
        assert_eq!(options.restart_policy, RestartPolicy::Stop);
        assert_eq!(options.on_parent_exit, OnParentExit::Follow);
        assert!(options.uid.is_none());
    }

    #[test]
    fn test_spawn_options_builder() {
        let options = SpawnOptions::with_policy(RestartPolicy::Restart)
            .uid("cache")
            .parent(ActorUid::new("owner"))
            .on_parent_exit(OnParentExit::Detach);
        assert_eq!(options.uid, Some(ActorUid::new("cache")));
        assert_eq!(options.parent, Some(ActorUid::new("owner")));
        assert_eq!(options.on_parent_exit, OnParentExit::Detach);
    }
}

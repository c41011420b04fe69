//! Actor Network Infrastructure
//!
//! Addressing, the envelope wire format and the persistent TCP transport
//! that extends actor routing across processes.
//!
//! - [`address`]: location-transparent actor addresses and ids
//! - [`protocol`]: envelopes, framing and control messages
//! - [`transports`]: links, the inbound listener and the link pool

pub mod address;
pub mod error;
pub mod protocol;
pub mod transports;

pub use address::{ActorAddress, ActorUid, EnvelopeId, PoolId, LOCAL_ENDPOINT};
pub use error::{Result, TransportError};
pub use protocol::{
    decode_payload, encode_payload, ControlMessage, CreateActorRequest, Envelope, EnvelopeKind,
    LifecycleEvent, OnParentExit, Reply, ReplyError, RestartPolicy, SpawnOptions, WireFormat,
};
pub use transports::{
    InboundHandler, Link, LinkConfig, LinkPool, LinkReply, LinkState, Listener, ReplySink,
    TellPolicy,
};

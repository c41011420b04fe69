//! Actor Behavior
//!
//! An actor is a value implementing [`Actor`]; the value is its state. Every
//! message reaches the single `handle` entry point with its kind and raw
//! payload, one at a time, in mailbox order.

use crate::error::{ActorError, Result};
use crate::system::ActorSystem;
use async_trait::async_trait;
use bytes::Bytes;
use oscar_network::{ActorAddress, EnvelopeId, SpawnOptions, TransportError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Kind of a message handed to [`Actor::handle`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Fire-and-forget; the returned value is discarded
    Tell,
    /// Request; the returned value (or empty payload) is the reply
    Call,
}

/// Failure reported by an actor hook
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<ActorError> for HandlerError {
    fn from(error: ActorError) -> Self {
        Self::new(error.to_string())
    }
}

impl From<TransportError> for HandlerError {
    fn from(error: TransportError) -> Self {
        Self::new(error.to_string())
    }
}

impl From<bincode::Error> for HandlerError {
    fn from(error: bincode::Error) -> Self {
        Self::new(format!("payload codec: {}", error))
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

/// Actor behavior
///
/// `spawn` keeps a clone of the initial value as the restart template, so a
/// restarted actor begins again from exactly that state.
#[async_trait]
pub trait Actor: Send + 'static {
    /// Runs after creation and after every restart, before any message
    async fn on_start(&mut self, _ctx: &mut ActorContext) -> std::result::Result<(), HandlerError> {
        Ok(())
    }

    /// Handle one message
    async fn handle(
        &mut self,
        ctx: &mut ActorContext,
        kind: MessageKind,
        payload: Bytes,
    ) -> std::result::Result<Option<Bytes>, HandlerError>;

    /// Runs once when the actor is destroyed
    async fn on_stop(&mut self, _ctx: &mut ActorContext) {}
}

/// What a hook can see and do while it runs
pub struct ActorContext {
    system: ActorSystem,
    address: ActorAddress,
    sender: Option<ActorAddress>,
    envelope_id: Option<EnvelopeId>,
    stop_requested: bool,
}

impl ActorContext {
    pub(crate) fn new(
        system: ActorSystem,
        address: ActorAddress,
        sender: Option<ActorAddress>,
        envelope_id: Option<EnvelopeId>,
    ) -> Self {
        Self {
            system,
            address,
            sender,
            envelope_id,
            stop_requested: false,
        }
    }

    /// Address of the actor running this hook
    pub fn address(&self) -> &ActorAddress {
        &self.address
    }

    /// Sender of the current message, when it was sent by an actor
    pub fn sender(&self) -> Option<&ActorAddress> {
        self.sender.as_ref()
    }

    pub fn envelope_id(&self) -> Option<EnvelopeId> {
        self.envelope_id
    }

    pub fn system(&self) -> &ActorSystem {
        &self.system
    }

    /// Tell another actor, with this actor as sender
    pub async fn tell(&self, to: &ActorAddress, payload: impl Into<Bytes>) -> Result<()> {
        self.system
            .send_tell(Some(self.address.clone()), to, payload.into())
            .await
    }

    /// Call another actor, with this actor as sender
    ///
    /// The handler is suspended while waiting; the worker keeps running
    /// other actors. Calling back into the calling actor deadlocks until
    /// the timeout fires.
    pub async fn call(&self, to: &ActorAddress, payload: impl Into<Bytes>, timeout: Duration) -> Result<Bytes> {
        self.system
            .send_call(Some(self.address.clone()), to, payload.into(), Some(timeout))
            .await
    }

    pub async fn tell_typed<M: Serialize>(&self, to: &ActorAddress, message: &M) -> Result<()> {
        let payload = bincode::serialize(message)?;
        self.tell(to, payload).await
    }

    pub async fn call_typed<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        to: &ActorAddress,
        request: &Req,
        timeout: Duration,
    ) -> Result<Resp> {
        let payload = bincode::serialize(request)?;
        let reply = self.call(to, payload, timeout).await?;
        Ok(bincode::deserialize(&reply)?)
    }

    /// Spawn a supervised child in this actor's pool
    pub async fn spawn_child<A: Actor + Clone>(&self, actor: A, options: SpawnOptions) -> Result<ActorAddress> {
        let options = options.parent(self.address.uid().clone());
        self.system
            .spawn_with(self.address.pool_id().clone(), actor, options)
            .await
    }

    /// Stop this actor once the current hook returns
    ///
    /// Messages still queued are failed with `ActorTerminated`.
    pub fn stop_self(&mut self) {
        self.stop_requested = true;
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop_requested
    }
}

impl std::fmt::Debug for ActorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorContext")
            .field("address", &self.address)
            .field("sender", &self.sender)
            .field("envelope_id", &self.envelope_id)
            .finish()
    }
}

/// Decode a typed payload inside a handler
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> std::result::Result<T, HandlerError> {
    Ok(bincode::deserialize(payload)?)
}

/// Encode a typed reply inside a handler
pub fn encode<T: Serialize>(value: &T) -> std::result::Result<Option<Bytes>, HandlerError> {
    Ok(Some(Bytes::from(bincode::serialize(value)?)))
}

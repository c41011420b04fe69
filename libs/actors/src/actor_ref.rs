//! Actor References
//!
//! An [`ActorRef`] pairs an address with the system that sends to it, so
//! callers holding a reference need not carry the system around.

use crate::error::Result;
use crate::system::ActorSystem;
use crate::watch::LifecycleStream;
use bytes::Bytes;
use oscar_network::ActorAddress;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

#[derive(Clone)]
pub struct ActorRef {
    system: ActorSystem,
    address: ActorAddress,
}

impl ActorRef {
    pub(crate) fn new(system: ActorSystem, address: ActorAddress) -> Self {
        Self { system, address }
    }

    pub fn address(&self) -> &ActorAddress {
        &self.address
    }

    pub async fn tell(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.system.tell(&self.address, payload).await
    }

    /// Call with the system's default timeout
    pub async fn call(&self, payload: impl Into<Bytes>) -> Result<Bytes> {
        self.call_timeout(payload, self.system.default_call_timeout())
            .await
    }

    pub async fn call_timeout(&self, payload: impl Into<Bytes>, timeout: Duration) -> Result<Bytes> {
        self.system.call(&self.address, payload, timeout).await
    }

    pub async fn tell_typed<M: Serialize>(&self, message: &M) -> Result<()> {
        self.system.tell_typed(&self.address, message).await
    }

    pub async fn call_typed<Req: Serialize, Resp: DeserializeOwned>(&self, request: &Req) -> Result<Resp> {
        self.system
            .call_typed(&self.address, request, self.system.default_call_timeout())
            .await
    }

    pub async fn stop(&self) -> Result<()> {
        self.system.stop(&self.address).await
    }

    pub fn watch(&self) -> LifecycleStream {
        self.system.watch(&self.address)
    }
}

impl std::fmt::Debug for ActorRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ActorRef").field(&self.address).finish()
    }
}

impl std::fmt::Display for ActorRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.address.fmt(f)
    }
}

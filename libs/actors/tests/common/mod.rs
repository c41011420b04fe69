//! Shared actors and helpers for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use oscar::{
    Actor, ActorAddress, ActorContext, ActorSystem, HandlerError, LifecycleEvent, LifecycleStream, MessageKind,
    RuntimeConfig,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

pub const CALL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    Add(u64),
    Get,
    History,
    Fail,
    Panic,
    /// Sleep for the given milliseconds, then answer the total
    Sleep(u64),
    StopSelf,
    /// Call `Add(n)` on another actor and answer its total
    Forward(ActorAddress, u64),
    /// `Forward` with an overflowing timeout
    ForwardUnbounded(ActorAddress, u64),
}

pub fn command(command: &Command) -> Bytes {
    Bytes::from(bincode::serialize(command).expect("encode command"))
}

/// Counting actor; every hook is observable
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Counter {
    pub total: u64,
    pub history: Vec<u64>,
    #[serde(skip)]
    pub stops: Arc<AtomicUsize>,
}

impl Counter {
    pub fn starting_at(total: u64) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Actor for Counter {
    async fn handle(
        &mut self,
        ctx: &mut ActorContext,
        _kind: MessageKind,
        payload: Bytes,
    ) -> Result<Option<Bytes>, HandlerError> {
        match oscar::decode::<Command>(&payload)? {
            Command::Add(n) => {
                self.total += n;
                self.history.push(n);
                oscar::encode(&self.total)
            }
            Command::Get => oscar::encode(&self.total),
            Command::History => oscar::encode(&self.history),
            Command::Fail => Err(HandlerError::new("requested failure")),
            Command::Panic => panic!("requested panic"),
            Command::Sleep(ms) => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                oscar::encode(&self.total)
            }
            Command::StopSelf => {
                ctx.stop_self();
                Ok(None)
            }
            Command::Forward(to, n) => {
                let total: u64 = ctx.call_typed(&to, &Command::Add(n), CALL_TIMEOUT).await?;
                oscar::encode(&total)
            }
            Command::ForwardUnbounded(to, n) => {
                let total: u64 = ctx.call_typed(&to, &Command::Add(n), Duration::MAX).await?;
                oscar::encode(&total)
            }
        }
    }

    async fn on_stop(&mut self, _ctx: &mut ActorContext) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Actor whose `on_start` always fails
#[derive(Debug, Clone, Default)]
pub struct BrokenStart;

#[async_trait]
impl Actor for BrokenStart {
    async fn on_start(&mut self, _ctx: &mut ActorContext) -> Result<(), HandlerError> {
        Err(HandlerError::new("cannot start"))
    }

    async fn handle(
        &mut self,
        _ctx: &mut ActorContext,
        _kind: MessageKind,
        _payload: Bytes,
    ) -> Result<Option<Bytes>, HandlerError> {
        Ok(None)
    }
}

/// Config with short reconnect cycles so link failures surface quickly
pub fn fast_config() -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.pool.workers = 4;
    config.transport.connect_timeout_ms = 500;
    config.transport.backoff_base_ms = 20;
    config.transport.backoff_max_ms = 100;
    config.transport.max_reconnect_attempts = 2;
    config.call.default_timeout_ms = 5_000;
    config
}

pub fn local_system() -> ActorSystem {
    let system = ActorSystem::new(fast_config()).expect("system");
    system.add_pool("main").expect("pool");
    system
}

pub async fn remote_system() -> ActorSystem {
    let system = ActorSystem::bind(fast_config(), "127.0.0.1:0").await.expect("bind");
    system.add_pool("main").expect("pool");
    system
}

pub async fn add(system: &ActorSystem, to: &ActorAddress, n: u64) -> oscar::Result<u64> {
    system.call_typed(to, &Command::Add(n), CALL_TIMEOUT).await
}

pub async fn total(system: &ActorSystem, to: &ActorAddress) -> oscar::Result<u64> {
    system.call_typed(to, &Command::Get, CALL_TIMEOUT).await
}

/// Subscribe now; local watch streams subscribe on their first poll
pub fn subscribed(mut events: LifecycleStream) -> LifecycleStream {
    use futures::FutureExt;
    assert!(events.next().now_or_never().is_none(), "no event expected yet");
    events
}

pub async fn next_event(events: &mut LifecycleStream) -> Option<LifecycleEvent> {
    timeout(CALL_TIMEOUT, events.next()).await.expect("lifecycle event")
}

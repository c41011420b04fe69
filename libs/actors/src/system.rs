//! Actor System Core
//!
//! The public entry point: pools, spawning, location-transparent `tell` and
//! `call`, stopping, lifecycle watches and remote creation. A system with a
//! listener also serves envelopes arriving from remote links.
//!
//! Several systems can live in one process; nothing here is global.

use crate::actor::Actor;
use crate::actor_ref::ActorRef;
use crate::error::{ActorError, Result};
use crate::mailbox::Delivery;
use crate::pool::{ActorCell, ActorFactory, Pool, PoolSettings, PoolStats};
use crate::registry::ActorTypeRegistry;
use crate::router::{Route, Router};
use crate::watch::LifecycleStream;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::{BoxStream, StreamExt};
use oscar_config::{RuntimeConfig, TellPolicySetting, TransportSection};
use oscar_network::transports::{BackoffConfig, LinkMetrics, LinkPoolStats};
use oscar_network::{
    decode_payload, encode_payload, ActorAddress, ActorUid, ControlMessage, CreateActorRequest, Envelope,
    EnvelopeId, EnvelopeKind, InboundHandler, LifecycleEvent, Link, LinkConfig, LinkPool, Listener, PoolId,
    Reply, ReplyError, ReplySink, RestartPolicy, SpawnOptions, TellPolicy, LOCAL_ENDPOINT,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Handle to an actor system; cheap to clone
///
/// Call [`ActorSystem::shutdown`] to stop actors with their `on_stop`
/// hooks. Dropping the last handle without it still stops the workers and
/// releases every actor, but skips the hooks.
#[derive(Clone)]
pub struct ActorSystem {
    inner: Arc<SystemInner>,
}

pub(crate) struct SystemInner {
    config: RuntimeConfig,
    router: Router,
    registry: ActorTypeRegistry,
    listener: Mutex<Option<Listener>>,
    /// Calls received from remote links, by envelope id, for `Cancel`
    inbound_calls: DashMap<EnvelopeId, Arc<ActorCell>>,
    /// Lifecycle forwarding tasks for remote watchers, by subscription id
    served_watches: DashMap<EnvelopeId, JoinHandle<()>>,
    shut_down: AtomicBool,
}

impl Drop for SystemInner {
    fn drop(&mut self) {
        if *self.shut_down.get_mut() {
            return;
        }
        for entry in self.served_watches.iter() {
            entry.value().abort();
        }
        for pool in self.router.drain_pools() {
            pool.abandon();
        }
        self.router.links().close_all();
    }
}

impl std::fmt::Debug for ActorSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorSystem")
            .field("endpoint", &self.endpoint())
            .field("pools", &self.pool_ids())
            .finish()
    }
}

/// Link settings from the transport section of the runtime config
pub fn link_config(transport: &TransportSection) -> LinkConfig {
    let policy = |setting: TellPolicySetting| match setting {
        TellPolicySetting::Buffer => TellPolicy::Buffer {
            max: transport.tell_buffer,
        },
        TellPolicySetting::FailFast => TellPolicy::FailFast,
    };
    LinkConfig {
        connect_timeout: Duration::from_millis(transport.connect_timeout_ms),
        backoff: BackoffConfig::new(
            Duration::from_millis(transport.backoff_base_ms),
            Duration::from_millis(transport.backoff_max_ms),
            transport.max_reconnect_attempts,
        ),
        keepalive_interval: Duration::from_millis(transport.keepalive_interval_ms),
        max_frame_size: transport.max_frame_size,
        tell_policy: policy(transport.tell_policy),
        link_overrides: transport
            .link_overrides
            .iter()
            .map(|(endpoint, setting)| (endpoint.clone(), policy(*setting)))
            .collect(),
    }
}

impl ActorSystem {
    /// System without a listener; its actors are reachable in-process only
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        Self::build(config, LOCAL_ENDPOINT.to_string(), None)
    }

    /// System serving remote links on `addr`
    ///
    /// The bound `host:port` becomes the endpoint part of every address this
    /// system hands out, so bind to an address peers can reach.
    pub async fn bind(config: RuntimeConfig, addr: &str) -> Result<Self> {
        config
            .validate()
            .map_err(|e| ActorError::Configuration(e.to_string()))?;
        let handler = Arc::new(SystemHandler::default());
        let listener = Listener::bind(addr, config.transport.max_frame_size, handler.clone()).await?;
        let endpoint = listener.local_addr().to_string();
        let system = Self::build(config, endpoint, Some(listener))?;
        let _ = handler.system.set(Arc::downgrade(&system.inner));
        Ok(system)
    }

    fn build(config: RuntimeConfig, endpoint: String, listener: Option<Listener>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| ActorError::Configuration(e.to_string()))?;
        let links = link_config(&config.transport);
        links.validate()?;

        info!(endpoint = %endpoint, listening = listener.is_some(), "Actor system started");
        Ok(Self {
            inner: Arc::new(SystemInner {
                router: Router::new(endpoint, LinkPool::new(links)),
                config,
                registry: ActorTypeRegistry::new(),
                listener: Mutex::new(listener),
                inbound_calls: DashMap::new(),
                served_watches: DashMap::new(),
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    pub(crate) fn upgrade(weak: &Weak<SystemInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    /// `host:port` of the listener, or `"local"`
    pub fn endpoint(&self) -> &str {
        self.inner.router.endpoint()
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.inner.listener.lock().as_ref().map(Listener::local_addr)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Actor types this system can create for `spawn_remote`
    pub fn registry(&self) -> &ActorTypeRegistry {
        &self.inner.registry
    }

    pub fn default_call_timeout(&self) -> Duration {
        Duration::from_millis(self.inner.config.call.default_timeout_ms)
    }

    // ---- pools ----

    /// Add a pool with the configured worker count and watermarks
    pub fn add_pool(&self, pool_id: impl Into<PoolId>) -> Result<()> {
        self.add_pool_with(pool_id, PoolSettings::from_config(&self.inner.config))
    }

    pub fn add_pool_with(&self, pool_id: impl Into<PoolId>, settings: PoolSettings) -> Result<()> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(ActorError::Rejected("actor system is shut down".to_string()));
        }
        let pool_id = pool_id.into();
        let pool = Pool::new(pool_id.clone(), settings);
        if !self.inner.router.insert_pool(pool.clone()) {
            return Err(ActorError::AlreadyExists(format!("pool {}", pool_id)));
        }
        pool.start_workers(Arc::downgrade(&self.inner));
        Ok(())
    }

    /// Stop every actor of the pool and its workers
    pub async fn remove_pool(&self, pool_id: impl Into<PoolId>) -> Result<()> {
        let pool_id = pool_id.into();
        let pool = self
            .inner
            .router
            .remove_pool(&pool_id)
            .ok_or_else(|| ActorError::routing(format!("unknown pool {}", pool_id)))?;
        pool.shutdown(self).await;
        Ok(())
    }

    pub fn pool_ids(&self) -> Vec<PoolId> {
        let mut ids: Vec<PoolId> = self.inner.router.pools().iter().map(|p| p.id().clone()).collect();
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        ids
    }

    pub fn pool_stats(&self, pool_id: impl Into<PoolId>) -> Result<PoolStats> {
        Ok(self.inner.router.pool(&pool_id.into())?.stats())
    }

    pub fn link_stats(&self) -> LinkPoolStats {
        self.inner.router.links().stats()
    }

    /// Counters of the inbound listener; `None` for a local-only system
    pub fn listener_metrics(&self) -> Option<LinkMetrics> {
        self.inner.listener.lock().as_ref().map(Listener::metrics)
    }

    /// Stop the listener, every pool and every link
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(endpoint = %self.endpoint(), "Actor system shutting down");

        if let Some(listener) = self.inner.listener.lock().take() {
            listener.shutdown();
        }
        let watches: Vec<EnvelopeId> = self.inner.served_watches.iter().map(|e| *e.key()).collect();
        for id in watches {
            if let Some((_, task)) = self.inner.served_watches.remove(&id) {
                task.abort();
            }
        }
        for pool in self.inner.router.drain_pools() {
            pool.shutdown(self).await;
        }
        self.inner.router.links().close_all();
        info!(endpoint = %self.endpoint(), "Actor system stopped");
    }

    // ---- actors ----

    /// Spawn `actor` in `pool_id` at the pool root
    pub async fn spawn<A: Actor + Clone>(
        &self,
        pool_id: impl Into<PoolId>,
        actor: A,
        restart_policy: RestartPolicy,
    ) -> Result<ActorAddress> {
        self.spawn_with(pool_id, actor, SpawnOptions::with_policy(restart_policy))
            .await
    }

    /// Spawn with an explicit uid, parent or parent-exit behavior
    pub async fn spawn_with<A: Actor + Clone>(
        &self,
        pool_id: impl Into<PoolId>,
        actor: A,
        options: SpawnOptions,
    ) -> Result<ActorAddress> {
        let pool = self.inner.router.pool(&pool_id.into())?;
        let factory: ActorFactory = Box::new(move || Box::new(actor.clone()) as Box<dyn Actor>);
        pool.spawn(self, factory, options).await
    }

    /// Create an actor of a registered type on `endpoint`
    ///
    /// The uid is chosen here (unless given), so the address is known
    /// before the remote side answers.
    pub async fn spawn_remote(
        &self,
        endpoint: &str,
        pool_id: impl Into<PoolId>,
        type_name: &str,
        init: impl Into<Vec<u8>>,
        options: SpawnOptions,
    ) -> Result<ActorAddress> {
        let mut options = options;
        let uid = options.uid.get_or_insert_with(ActorUid::generate).clone();
        let address = ActorAddress::new(endpoint, pool_id.into(), uid);
        let request = CreateActorRequest {
            type_name: type_name.to_string(),
            init: init.into(),
            options,
        };

        if self.inner.router.is_local(&address) {
            return self.create_from_request(&address, request).await;
        }

        let payload = encode_payload(&request)?;
        let envelope = Envelope::new(EnvelopeKind::CreateActor, address.clone(), payload);
        let link = self.inner.router.links().link(endpoint);
        let deadline = deadline_after(Some(self.default_call_timeout()));
        self.request_remote(link, envelope, deadline).await?;
        debug!(actor = %address, actor_type = %type_name, "Remote actor created");
        Ok(address)
    }

    /// Fire-and-forget send
    pub async fn tell(&self, to: &ActorAddress, payload: impl Into<Bytes>) -> Result<()> {
        self.send_tell(None, to, payload.into()).await
    }

    /// Request/response send
    ///
    /// Dropping the returned future, or the timeout elapsing, cancels the
    /// call: a queued local delivery is removed, a remote one gets `Cancel`.
    /// A timeout too large to express as an instant means no deadline.
    pub async fn call(&self, to: &ActorAddress, payload: impl Into<Bytes>, timeout: Duration) -> Result<Bytes> {
        self.send_call(None, to, payload.into(), Some(timeout)).await
    }

    /// Request/response send that waits until the actor answers, stops or
    /// the link breaks
    pub async fn call_without_deadline(&self, to: &ActorAddress, payload: impl Into<Bytes>) -> Result<Bytes> {
        self.send_call(None, to, payload.into(), None).await
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

    /// Stop an actor and the children that follow it
    pub async fn stop(&self, address: &ActorAddress) -> Result<()> {
        if self.inner.router.is_local(address) {
            let pool = self.inner.router.pool(address.pool_id())?;
            return match pool.stop_actor(self, address.uid()).await {
                true => Ok(()),
                false => Err(ActorError::routing(format!("no actor at {}", address))),
            };
        }

        let envelope = Envelope::new(EnvelopeKind::DestroyActor, address.clone(), Bytes::new());
        let link = self.inner.router.links().link(address.endpoint());
        let deadline = deadline_after(Some(self.default_call_timeout()));
        self.request_remote(link, envelope, deadline).await.map(|_| ())
    }

    /// Lifecycle events of `address`; see [`LifecycleStream`]
    pub fn watch(&self, address: &ActorAddress) -> LifecycleStream {
        let system = self.clone();
        let address = address.clone();
        LifecycleStream::lazy(async move { system.subscribe(address).await })
    }

    /// Whether this system hosts `address`
    pub fn has_actor(&self, address: &ActorAddress) -> bool {
        self.inner.router.is_local(address)
            && self
                .inner
                .router
                .pool(address.pool_id())
                .map(|pool| pool.contains(address.uid()))
                .unwrap_or(false)
    }

    /// Reference to `address`
    ///
    /// Local addresses are checked to exist; remote ones are not contacted.
    pub fn actor_ref(&self, address: &ActorAddress) -> Result<ActorRef> {
        if self.inner.router.is_local(address) && !self.has_actor(address) {
            return Err(ActorError::routing(format!("no actor at {}", address)));
        }
        Ok(ActorRef::new(self.clone(), address.clone()))
    }

    /// Queued messages of a local actor
    pub fn mailbox_len(&self, address: &ActorAddress) -> Option<usize> {
        if !self.inner.router.is_local(address) {
            return None;
        }
        self.inner
            .router
            .pool(address.pool_id())
            .ok()?
            .mailbox_len(address.uid())
    }

    // ---- delivery ----

    pub(crate) async fn send_tell(&self, sender: Option<ActorAddress>, to: &ActorAddress, payload: Bytes) -> Result<()> {
        let envelope = Envelope::tell(to.clone(), payload).with_sender(sender);
        match self.inner.router.resolve(to)? {
            Route::Local { pool, cell } => pool.deliver(&cell, Delivery::tell(envelope)).await,
            Route::Remote(link) => Ok(link.tell(envelope).await?),
        }
    }

    pub(crate) async fn send_call(
        &self,
        sender: Option<ActorAddress>,
        to: &ActorAddress,
        payload: Bytes,
        timeout: Option<Duration>,
    ) -> Result<Bytes> {
        let deadline = deadline_after(timeout);
        let envelope = Envelope::call(to.clone(), payload)
            .with_sender(sender)
            .with_timeout(timeout.filter(|_| deadline.is_some()));

        match self.inner.router.resolve(to)? {
            Route::Local { pool, cell } => {
                let id = envelope.id();
                let (tx, rx) = oneshot::channel();
                let guard = CallGuard::local(id, cell.clone());

                within(deadline, pool.deliver(&cell, Delivery::call(envelope, tx)))
                    .await
                    .ok_or_else(|| timed_out(to, timeout))??;
                let reply = within(deadline, rx)
                    .await
                    .ok_or_else(|| timed_out(to, timeout))?;
                guard.disarm();

                match reply {
                    Ok(reply) => Ok(Bytes::from(reply?)),
                    Err(_) => Err(ActorError::terminated(format!("{} stopped before replying", to))),
                }
            }
            Route::Remote(link) => self
                .request_remote(link, envelope, deadline)
                .await
                .map(Bytes::from)
                .map_err(|e| match e {
                    ActorError::Timeout(_) => timed_out(to, timeout),
                    other => other,
                }),
        }
    }

    /// Send a request over `link` and wait for its reply until `deadline`
    async fn request_remote(&self, link: Link, envelope: Envelope, deadline: Option<Instant>) -> Result<Vec<u8>> {
        let id = envelope.id();
        let destination = envelope.destination().clone();
        let timeout_error = || ActorError::Timeout(format!("no reply from {}", destination));

        let rx = within(deadline, link.request(envelope))
            .await
            .ok_or_else(timeout_error)??;
        let guard = CallGuard::remote(id, link.clone(), destination.clone());
        let reply = within(deadline, rx).await.ok_or_else(timeout_error)?;
        guard.disarm();

        match reply {
            Ok(Ok(reply)) => Ok(reply?),
            Ok(Err(transport)) => Err(transport.into()),
            Err(_) => Err(ActorError::LinkBroken {
                endpoint: link.endpoint().to_string(),
                reason: "reply dropped".to_string(),
            }),
        }
    }

    async fn subscribe(self, address: ActorAddress) -> BoxStream<'static, LifecycleEvent> {
        match self.inner.router.resolve(&address) {
            Ok(Route::Local { cell, .. }) => match cell.subscribe() {
                Some(receiver) => LifecycleStream::local(receiver),
                None => LifecycleStream::stopped(),
            },
            Ok(Route::Remote(link)) => {
                let subscription = EnvelopeId::new();
                match link.watch(subscription, address.clone()).await {
                    Ok(events) => LifecycleStream::remote(link, subscription, address, events),
                    Err(e) => {
                        debug!(actor = %address, error = %e, "Remote watch failed");
                        LifecycleStream::stopped()
                    }
                }
            }
            Err(_) => LifecycleStream::stopped(),
        }
    }

    async fn create_from_request(&self, destination: &ActorAddress, request: CreateActorRequest) -> Result<ActorAddress> {
        let pool = self.inner.router.pool(destination.pool_id())?;
        let factory = self.inner.registry.build(&request.type_name, &request.init)?;
        let mut options = request.options;
        options.uid = Some(destination.uid().clone());
        pool.spawn(self, factory, options).await
    }

    // ---- inbound ----

    /// Pool and cell for an address this process hosts
    fn resolve_hosted(&self, address: &ActorAddress) -> Result<(Arc<Pool>, Arc<ActorCell>)> {
        if !self.inner.router.is_local(address) {
            return Err(ActorError::routing(format!(
                "{} is not hosted at {}",
                address,
                self.endpoint()
            )));
        }
        match self.inner.router.resolve(address)? {
            Route::Local { pool, cell } => Ok((pool, cell)),
            Route::Remote(_) => Err(ActorError::routing(format!("no actor at {}", address))),
        }
    }

    async fn handle_inbound(&self, envelope: Envelope, replies: ReplySink) {
        let id = envelope.id();
        let reply_to = envelope
            .sender()
            .cloned()
            .unwrap_or_else(|| envelope.destination().clone());

        match envelope.kind() {
            EnvelopeKind::Tell => {
                let destination = envelope.destination().clone();
                let delivered = match self.resolve_hosted(&destination) {
                    Ok((pool, cell)) => pool.deliver(&cell, Delivery::tell(envelope)).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = delivered {
                    replies.record_dropped_tell();
                    warn!(actor = %destination, peer = %replies.peer(), error = %e, "Dropping remote tell");
                }
            }
            EnvelopeKind::Call => self.serve_call(envelope, replies, reply_to).await,
            EnvelopeKind::CreateActor => {
                let destination = envelope.destination().clone();
                let result = match decode_payload::<CreateActorRequest>(envelope.payload()) {
                    Ok(request) => self.create_from_request(&destination, request).await,
                    Err(e) => Err(ActorError::Rejected(format!("malformed create request: {}", e))),
                };
                send_reply(&replies, id, reply_to, result.map(|_| Vec::new()));
            }
            EnvelopeKind::DestroyActor => {
                let destination = envelope.destination().clone();
                let result = match self.resolve_hosted(&destination) {
                    Ok((pool, _)) => {
                        pool.stop_actor(self, destination.uid()).await;
                        Ok(Vec::new())
                    }
                    Err(e) => Err(e),
                };
                send_reply(&replies, id, reply_to, result);
            }
            EnvelopeKind::Control => self.serve_control(envelope, replies),
        }
    }

    async fn serve_call(&self, envelope: Envelope, replies: ReplySink, reply_to: ActorAddress) {
        let id = envelope.id();
        let (pool, cell) = match self.resolve_hosted(envelope.destination()) {
            Ok(found) => found,
            Err(e) => {
                send_reply(&replies, id, reply_to, Err(e));
                return;
            }
        };

        let (tx, rx) = oneshot::channel::<Reply>();
        self.inner.inbound_calls.insert(id, cell.clone());
        if let Err(e) = pool.deliver(&cell, Delivery::call(envelope, tx)).await {
            self.inner.inbound_calls.remove(&id);
            send_reply(&replies, id, reply_to, Err(e));
            return;
        }

        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let reply = rx.await;
            let cancelled = inner
                .upgrade()
                .map(|inner| inner.inbound_calls.remove(&id).is_none())
                .unwrap_or(false);
            if cancelled {
                return;
            }
            let reply = reply.unwrap_or_else(|_| {
                Err(ReplyError::ActorTerminated(format!("{} stopped before replying", cell.address)))
            });
            if let Err(e) = replies.reply(id, reply_to, reply) {
                debug!(envelope = %id, error = %e, "Could not deliver remote reply");
            }
        });
    }

    fn serve_control(&self, envelope: Envelope, replies: ReplySink) {
        let id = envelope.id();
        match envelope.control_message() {
            Ok(ControlMessage::Cancel) => {
                if let Some((_, cell)) = self.inner.inbound_calls.remove(&id) {
                    let removed = cell.mailbox.cancel(id);
                    debug!(envelope = %id, removed, "Remote call cancelled");
                }
            }
            Ok(ControlMessage::Watch) => self.serve_watch(id, envelope.destination().clone(), replies),
            Ok(ControlMessage::Unwatch) => {
                if let Some((_, task)) = self.inner.served_watches.remove(&id) {
                    task.abort();
                }
            }
            Ok(other) => debug!(envelope = %id, message = ?other, "Ignoring control message"),
            Err(e) => warn!(peer = %replies.peer(), error = %e, "Malformed control envelope"),
        }
    }

    fn serve_watch(&self, subscription: EnvelopeId, destination: ActorAddress, replies: ReplySink) {
        let receiver = self
            .resolve_hosted(&destination)
            .ok()
            .and_then(|(_, cell)| cell.subscribe());
        let Some(receiver) = receiver else {
            let _ = replies.lifecycle(subscription, destination, LifecycleEvent::Stopped);
            return;
        };

        let inner = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            let mut events = LifecycleStream::local(receiver);
            loop {
                tokio::select! {
                    event = events.next() => match event {
                        Some(event) => {
                            if replies.lifecycle(subscription, destination.clone(), event).is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = replies.closed() => break,
                }
            }
            if let Some(inner) = inner.upgrade() {
                inner.served_watches.remove(&subscription);
            }
        });
        self.inner.served_watches.insert(subscription, task);
    }
}

/// `None` when there is no timeout or it overflows the clock
fn deadline_after(timeout: Option<Duration>) -> Option<Instant> {
    timeout.and_then(|timeout| Instant::now().checked_add(timeout))
}

/// Run `future` to completion, or until `deadline` passes
async fn within<F: Future>(deadline: Option<Instant>, future: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, future).await.ok(),
        None => Some(future.await),
    }
}

fn timed_out(to: &ActorAddress, timeout: Option<Duration>) -> ActorError {
    match timeout {
        Some(timeout) => ActorError::Timeout(format!("{} did not answer within {:?}", to, timeout)),
        None => ActorError::Timeout(format!("{} did not answer", to)),
    }
}

fn send_reply(replies: &ReplySink, id: EnvelopeId, reply_to: ActorAddress, result: Result<Vec<u8>>) {
    let reply = result.map_err(|e| e.to_reply_error());
    if let Err(e) = replies.reply(id, reply_to, reply) {
        debug!(envelope = %id, error = %e, "Could not deliver reply");
    }
}

/// Cancels an unfinished call when dropped
struct CallGuard {
    id: EnvelopeId,
    target: Option<CancelTarget>,
}

enum CancelTarget {
    Local(Arc<ActorCell>),
    Remote { link: Link, destination: ActorAddress },
}

impl CallGuard {
    fn local(id: EnvelopeId, cell: Arc<ActorCell>) -> Self {
        Self {
            id,
            target: Some(CancelTarget::Local(cell)),
        }
    }

    fn remote(id: EnvelopeId, link: Link, destination: ActorAddress) -> Self {
        Self {
            id,
            target: Some(CancelTarget::Remote { link, destination }),
        }
    }

    fn disarm(mut self) {
        self.target = None;
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        match self.target.take() {
            Some(CancelTarget::Local(cell)) => {
                if cell.mailbox.cancel(self.id) {
                    debug!(actor = %cell.address, envelope = %self.id, "Cancelled queued call");
                }
            }
            Some(CancelTarget::Remote { link, destination }) => link.cancel(self.id, &destination),
            None => {}
        }
    }
}

/// Serves envelopes from the listener; holds the system weakly
#[derive(Default)]
struct SystemHandler {
    system: OnceLock<Weak<SystemInner>>,
}

#[async_trait]
impl InboundHandler for SystemHandler {
    async fn handle_envelope(&self, envelope: Envelope, replies: ReplySink) {
        match self.system.get().and_then(ActorSystem::upgrade) {
            Some(system) => system.handle_inbound(envelope, replies).await,
            None => {
                if envelope.kind().expects_reply() {
                    let reply_to = envelope.destination().clone();
                    send_reply(
                        &replies,
                        envelope.id(),
                        reply_to,
                        Err(ActorError::routing("actor system is not running")),
                    );
                }
            }
        }
    }
}

//! Actor Pool
//!
//! A pool owns an actor table, a shared ready queue and N worker tasks.
//! An actor is on the ready queue when its mailbox has messages and no turn
//! is running. A worker pops an actor, takes exactly one delivery and runs
//! the handler as a turn inside its own set of in-flight turns, so a turn
//! that awaits (a call, backpressure, I/O) leaves the worker free to run
//! other actors. When the turn ends the actor goes back to the end of the
//! ready queue if more messages are waiting.
//!
//! # Lock Ordering
//!
//! 1. `actors`
//! 2. `supervision`
//! 3. `ready`
//!
//! Locks are never held across an await.

use crate::actor::{Actor, ActorContext, HandlerError, MessageKind};
use crate::error::{ActorError, Result};
use crate::mailbox::{Delivery, Mailbox, MailboxStatus, RestartClaim, TurnEnd, Watermarks};
use crate::supervisor::{RestartLimit, SupervisionTree, SupervisorAction};
use crate::system::{ActorSystem, SystemInner};
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use oscar_config::RuntimeConfig;
use oscar_network::{ActorAddress, ActorUid, EnvelopeKind, LifecycleEvent, PoolId, ReplyError, SpawnOptions};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const LIFECYCLE_CHANNEL_CAPACITY: usize = 32;

/// Builds a fresh actor from the restart template
pub(crate) type ActorFactory = Box<dyn Fn() -> Box<dyn Actor> + Send>;

/// Per-pool settings
#[derive(Debug, Clone, PartialEq)]
pub struct PoolSettings {
    pub workers: usize,
    pub watermarks: Watermarks,
    pub restart_limit: RestartLimit,
}

impl PoolSettings {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        let watermarks = match config.pool.high_watermark {
            Some(high) => Watermarks::bounded(high, config.pool.low_watermark),
            None => Watermarks::unbounded(),
        };
        Self {
            workers: config.pool.workers.max(1),
            watermarks,
            restart_limit: RestartLimit {
                max_restarts: config.supervision.max_restarts,
                window: Duration::from_millis(config.supervision.restart_window_ms),
            },
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_watermarks(mut self, watermarks: Watermarks) -> Self {
        self.watermarks = watermarks;
        self
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::from_config(&RuntimeConfig::default())
    }
}

/// Pool-wide counters
#[derive(Debug, Default)]
pub struct PoolMetrics {
    pub actors_spawned: AtomicU64,
    pub actors_stopped: AtomicU64,
    pub messages_processed: AtomicU64,
    pub total_processing_time_ns: AtomicU64,
    pub handler_failures: AtomicU64,
    pub actor_restarts: AtomicU64,
    pub restart_failures: AtomicU64,
}

impl PoolMetrics {
    pub fn record_message_handled(&self, duration: Duration) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
        self.total_processing_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_actor_restart(&self, success: bool) {
        self.actor_restarts.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.restart_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn avg_processing_time_ns(&self) -> f64 {
        let count = self.messages_processed.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        self.total_processing_time_ns.load(Ordering::Relaxed) as f64 / count as f64
    }
}

/// Point-in-time pool statistics
#[derive(Debug, Clone, PartialEq)]
pub struct PoolStats {
    pub pool_id: PoolId,
    pub workers: usize,
    pub actors: usize,
    pub ready: usize,
    pub queued_messages: usize,
    pub actors_spawned: u64,
    pub actors_stopped: u64,
    pub messages_processed: u64,
    pub avg_processing_time_ns: f64,
    pub handler_failures: u64,
    pub actor_restarts: u64,
    pub restart_failures: u64,
    pub expired_calls: u64,
    pub backpressure_waits: u64,
}

/// One actor: its mailbox, its instance when idle, and its template
pub(crate) struct ActorCell {
    pub address: ActorAddress,
    pub mailbox: Mailbox,
    slot: Mutex<Option<Box<dyn Actor>>>,
    factory: Mutex<ActorFactory>,
    events: broadcast::Sender<LifecycleEvent>,
}

impl ActorCell {
    fn new(address: ActorAddress, watermarks: Watermarks, factory: ActorFactory) -> Self {
        let (events, _) = broadcast::channel(LIFECYCLE_CHANNEL_CAPACITY);
        Self {
            address,
            mailbox: Mailbox::new(watermarks),
            slot: Mutex::new(None),
            factory: Mutex::new(factory),
            events,
        }
    }

    fn instantiate(&self) -> Box<dyn Actor> {
        let factory = self.factory.lock();
        (*factory)()
    }

    fn take_instance(&self) -> Option<Box<dyn Actor>> {
        self.slot.lock().take()
    }

    fn emit(&self, event: LifecycleEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    /// Lifecycle subscription; `None` once the actor has stopped
    pub fn subscribe(&self) -> Option<broadcast::Receiver<LifecycleEvent>> {
        let receiver = self.events.subscribe();
        if self.mailbox.status() == MailboxStatus::Stopped {
            return None;
        }
        Some(receiver)
    }
}

pub struct Pool {
    id: PoolId,
    settings: PoolSettings,
    actors: RwLock<HashMap<ActorUid, Arc<ActorCell>>>,
    supervision: Mutex<SupervisionTree>,
    ready: Mutex<VecDeque<Arc<ActorCell>>>,
    ready_signal: Notify,
    metrics: PoolMetrics,
    workers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.id)
            .field("workers", &self.settings.workers)
            .field("actors", &self.actors.read().len())
            .finish()
    }
}

impl Pool {
    pub(crate) fn new(id: PoolId, settings: PoolSettings) -> Arc<Self> {
        Arc::new(Self {
            supervision: Mutex::new(SupervisionTree::new(settings.restart_limit)),
            id,
            settings,
            actors: RwLock::new(HashMap::new()),
            ready: Mutex::new(VecDeque::new()),
            ready_signal: Notify::new(),
            metrics: PoolMetrics::default(),
            workers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn start_workers(self: &Arc<Self>, system: Weak<SystemInner>) {
        let mut workers = self.workers.lock();
        for index in 0..self.settings.workers {
            workers.push(tokio::spawn(worker_loop(self.clone(), system.clone(), index)));
        }
        info!(pool = %self.id, workers = self.settings.workers, "Pool started");
    }

    pub fn id(&self) -> &PoolId {
        &self.id
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn len(&self) -> usize {
        self.actors.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, uid: &ActorUid) -> bool {
        self.actors.read().contains_key(uid)
    }

    pub fn stats(&self) -> PoolStats {
        let (queued_messages, expired_calls, backpressure_waits) = self.actors.read().values().fold(
            (0, 0, 0),
            |(queued, expired, waits), cell| {
                (
                    queued + cell.mailbox.len(),
                    expired + cell.mailbox.expired(),
                    waits + cell.mailbox.backpressure_waits(),
                )
            },
        );
        PoolStats {
            pool_id: self.id.clone(),
            workers: self.settings.workers,
            actors: self.len(),
            ready: self.ready.lock().len(),
            queued_messages,
            actors_spawned: self.metrics.actors_spawned.load(Ordering::Relaxed),
            actors_stopped: self.metrics.actors_stopped.load(Ordering::Relaxed),
            messages_processed: self.metrics.messages_processed.load(Ordering::Relaxed),
            avg_processing_time_ns: self.metrics.avg_processing_time_ns(),
            handler_failures: self.metrics.handler_failures.load(Ordering::Relaxed),
            actor_restarts: self.metrics.actor_restarts.load(Ordering::Relaxed),
            restart_failures: self.metrics.restart_failures.load(Ordering::Relaxed),
            expired_calls,
            backpressure_waits,
        }
    }

    /// Queued deliveries for `uid`
    pub fn mailbox_len(&self, uid: &ActorUid) -> Option<usize> {
        self.actors.read().get(uid).map(|cell| cell.mailbox.len())
    }

    /// Whether `uid` sits above its high watermark
    pub fn is_backpressured(&self, uid: &ActorUid) -> Option<bool> {
        self.actors.read().get(uid).map(|cell| !cell.mailbox.is_accepting())
    }

    pub fn parent_of(&self, uid: &ActorUid) -> Option<ActorUid> {
        self.supervision.lock().parent(uid).cloned()
    }

    pub fn children_of(&self, uid: &ActorUid) -> Vec<ActorUid> {
        self.supervision.lock().children(uid).to_vec()
    }

    pub(crate) fn cell(&self, uid: &ActorUid) -> Option<Arc<ActorCell>> {
        self.actors.read().get(uid).cloned()
    }

    /// Create an actor and run its `on_start`
    pub(crate) async fn spawn(
        self: &Arc<Self>,
        system: &ActorSystem,
        factory: ActorFactory,
        options: SpawnOptions,
    ) -> Result<ActorAddress> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ActorError::routing(format!("pool {} is shut down", self.id)));
        }

        let uid = options.uid.clone().unwrap_or_else(ActorUid::generate);
        let address = ActorAddress::new(system.endpoint(), self.id.clone(), uid.clone());
        let mut instance = factory();
        let cell = Arc::new(ActorCell::new(address.clone(), self.settings.watermarks, factory));

        {
            let mut actors = self.actors.write();
            if actors.contains_key(&uid) {
                return Err(ActorError::AlreadyExists(address.to_string()));
            }
            let inserted = self.supervision.lock().insert(
                uid.clone(),
                options.parent.clone(),
                options.restart_policy,
                options.on_parent_exit,
            );
            if !inserted {
                return Err(ActorError::Rejected(format!(
                    "parent {:?} is not an actor of pool {}",
                    options.parent.as_ref().map(ActorUid::as_str),
                    self.id
                )));
            }
            actors.insert(uid.clone(), cell.clone());
        }

        debug!(actor = %address, policy = ?options.restart_policy, "Spawning actor");
        let mut ctx = ActorContext::new(system.clone(), address.clone(), None, None);
        if let Err(e) = run_guarded(instance.on_start(&mut ctx)).await {
            warn!(actor = %address, error = %e, "Actor failed to start");
            self.stop_actor(system, &uid).await;
            cell.emit(LifecycleEvent::Stopped);
            return Err(ActorError::HandlerFailure(format!("on_start failed: {}", e)));
        }

        self.metrics.actors_spawned.fetch_add(1, Ordering::Relaxed);
        cell.emit(LifecycleEvent::Started);
        info!(actor = %address, "Actor started");
        self.settle(system, &cell, instance).await;
        Ok(address)
    }

    /// Enqueue a delivery, waiting on backpressure
    pub(crate) async fn deliver(&self, cell: &Arc<ActorCell>, delivery: Delivery) -> Result<()> {
        match cell.mailbox.push(delivery).await {
            Ok(true) => {
                self.schedule(cell.clone());
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(_) => Err(ActorError::terminated(cell.address.to_string())),
        }
    }

    /// Stop `uid` and the children that follow it; false if unknown
    pub(crate) async fn stop_actor(&self, system: &ActorSystem, uid: &ActorUid) -> bool {
        if !self.contains(uid) {
            return false;
        }
        let mut targets = self.supervision.lock().on_stop(uid);
        if targets.is_empty() {
            targets.push(uid.clone());
        }
        for target in targets {
            self.stop_cell(system, &target).await;
        }
        true
    }

    /// Stop every actor and the workers
    ///
    /// Turns in flight are dropped; their waiters see `ActorTerminated`.
    /// Must not be awaited from inside one of this pool's own actors.
    pub(crate) async fn shutdown(&self, system: &ActorSystem) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for worker in &workers {
            worker.abort();
        }
        for worker in workers {
            let _ = worker.await;
        }

        self.ready.lock().clear();
        let cells: Vec<Arc<ActorCell>> = self.actors.write().drain().map(|(_, cell)| cell).collect();
        *self.supervision.lock() = SupervisionTree::new(self.settings.restart_limit);

        for cell in &cells {
            self.fail_queued(cell);
            match cell.take_instance() {
                Some(actor) => self.destroy(system, cell, actor).await,
                None => cell.emit(LifecycleEvent::Stopped),
            }
        }
        info!(pool = %self.id, actors = cells.len(), "Pool stopped");
    }

    /// Tear the pool down without running hooks
    ///
    /// Used when the owning system is dropped without `shutdown`: there is
    /// no system left to hand `on_stop`, so instances are released as is.
    pub(crate) fn abandon(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for worker in self.workers.lock().drain(..) {
            worker.abort();
        }

        self.ready.lock().clear();
        let cells: Vec<Arc<ActorCell>> = self.actors.write().drain().map(|(_, cell)| cell).collect();
        *self.supervision.lock() = SupervisionTree::new(self.settings.restart_limit);
        for cell in &cells {
            self.fail_queued(cell);
            drop(cell.take_instance());
            cell.emit(LifecycleEvent::Stopped);
        }
        warn!(pool = %self.id, actors = cells.len(), "Pool released without shutdown");
    }

    fn schedule(&self, cell: Arc<ActorCell>) {
        self.ready.lock().push_back(cell);
        self.ready_signal.notify_one();
    }

    fn pop_ready(&self) -> Option<Arc<ActorCell>> {
        let mut ready = self.ready.lock();
        let cell = ready.pop_front();
        if cell.is_some() && !ready.is_empty() {
            // Hand the rest to another worker
            self.ready_signal.notify_one();
        }
        cell
    }

    /// Start a turn for `cell` if it has something to do
    fn begin_turn(self: &Arc<Self>, system: &Weak<SystemInner>, cell: Arc<ActorCell>) -> Option<BoxFuture<'static, ()>> {
        let system = ActorSystem::upgrade(system)?;
        let delivery = cell.mailbox.begin_turn()?;
        let Some(actor) = cell.take_instance() else {
            error!(actor = %cell.address, "Running actor has no instance");
            delivery.respond(Err(ReplyError::ActorTerminated(cell.address.to_string())));
            return None;
        };
        Some(self.clone().run_turn(system, cell, actor, delivery).boxed())
    }

    async fn run_turn(self: Arc<Self>, system: ActorSystem, cell: Arc<ActorCell>, mut actor: Box<dyn Actor>, delivery: Delivery) {
        let Delivery { envelope, responder } = delivery;
        let kind = match envelope.kind() {
            EnvelopeKind::Call => MessageKind::Call,
            _ => MessageKind::Tell,
        };
        let mut ctx = ActorContext::new(
            system.clone(),
            cell.address.clone(),
            envelope.sender().cloned(),
            Some(envelope.id()),
        );

        let started = Instant::now();
        let result = run_guarded(actor.handle(&mut ctx, kind, envelope.into_payload())).await;
        self.metrics.record_message_handled(started.elapsed());

        match result {
            Ok(reply) => {
                if let Some(responder) = responder {
                    let _ = responder.send(Ok(reply.map(|b| b.to_vec()).unwrap_or_default()));
                }
                if ctx.stop_requested() {
                    debug!(actor = %cell.address, "Actor requested stop");
                    self.stop_actor(&system, cell.address.uid()).await;
                }
            }
            Err(e) => {
                self.metrics.handler_failures.fetch_add(1, Ordering::Relaxed);
                warn!(actor = %cell.address, error = %e, "Handler failed");
                if let Some(responder) = responder {
                    let _ = responder.send(Err(ReplyError::HandlerFailure(e.to_string())));
                }
                self.supervise(&system, &cell).await;
            }
        }
        self.settle(&system, &cell, actor).await;
    }

    /// Apply the supervision plan for a failure of `cell`
    async fn supervise(&self, system: &ActorSystem, cell: &Arc<ActorCell>) {
        let plan = self.supervision.lock().on_failure(cell.address.uid(), Instant::now());
        for (uid, action) in plan {
            debug!(pool = %self.id, actor = %uid, action = ?action, "Supervisor decision");
            match action {
                SupervisorAction::Stop => self.stop_cell(system, &uid).await,
                SupervisorAction::Restart => self.restart_cell(system, &uid).await,
            }
        }
    }

    /// Return the instance after a turn, startup or restart
    ///
    /// Whoever takes the instance out of the slot after the mailbox is
    /// stopped runs `on_stop`, so it runs exactly once.
    async fn settle(&self, system: &ActorSystem, cell: &Arc<ActorCell>, actor: Box<dyn Actor>) {
        let mut actor = actor;
        loop {
            *cell.slot.lock() = Some(actor);
            match cell.mailbox.finish_turn() {
                TurnEnd::Idle { reschedule } => {
                    if reschedule {
                        self.schedule(cell.clone());
                    }
                    return;
                }
                TurnEnd::Stopped => {
                    if let Some(actor) = cell.take_instance() {
                        self.destroy(system, cell, actor).await;
                    }
                    return;
                }
                TurnEnd::Restart => {
                    if cell.take_instance().is_none() {
                        return;
                    }
                    match self.restart_instance(system, cell).await {
                        Some(fresh) => actor = fresh,
                        None => return,
                    }
                }
            }
        }
    }

    async fn restart_cell(&self, system: &ActorSystem, uid: &ActorUid) {
        let Some(cell) = self.cell(uid) else {
            return;
        };
        match cell.mailbox.claim_for_restart() {
            RestartClaim::Claimed => {
                if cell.take_instance().is_none() {
                    return;
                }
                if let Some(fresh) = self.restart_instance(system, &cell).await {
                    self.settle(system, &cell, fresh).await;
                }
            }
            // The running turn restarts it when it ends
            RestartClaim::Deferred => {}
            RestartClaim::Stopped => {}
        }
    }

    /// New instance from the template, started; `None` if `on_start` failed
    async fn restart_instance(&self, system: &ActorSystem, cell: &Arc<ActorCell>) -> Option<Box<dyn Actor>> {
        let mut fresh = cell.instantiate();
        let mut ctx = ActorContext::new(system.clone(), cell.address.clone(), None, None);
        match run_guarded(fresh.on_start(&mut ctx)).await {
            Ok(()) => {
                self.metrics.record_actor_restart(true);
                cell.emit(LifecycleEvent::Restarted);
                info!(actor = %cell.address, "Actor restarted");
                Some(fresh)
            }
            Err(e) => {
                self.metrics.record_actor_restart(false);
                error!(actor = %cell.address, error = %e, "Restart failed, stopping actor");
                self.stop_actor(system, cell.address.uid()).await;
                cell.emit(LifecycleEvent::Stopped);
                None
            }
        }
    }

    async fn stop_cell(&self, system: &ActorSystem, uid: &ActorUid) {
        let Some(cell) = self.actors.write().remove(uid) else {
            return;
        };
        self.fail_queued(&cell);
        if let Some(actor) = cell.take_instance() {
            self.destroy(system, &cell, actor).await;
        }
    }

    fn fail_queued(&self, cell: &ActorCell) {
        let drained = cell.mailbox.stop();
        if !drained.is_empty() {
            debug!(actor = %cell.address, pending = drained.len(), "Failing queued messages");
        }
        for delivery in drained {
            delivery.respond(Err(ReplyError::ActorTerminated(format!("{} stopped", cell.address))));
        }
    }

    async fn destroy(&self, system: &ActorSystem, cell: &ActorCell, mut actor: Box<dyn Actor>) {
        let mut ctx = ActorContext::new(system.clone(), cell.address.clone(), None, None);
        if AssertUnwindSafe(actor.on_stop(&mut ctx)).catch_unwind().await.is_err() {
            warn!(actor = %cell.address, "on_stop panicked");
        }
        self.metrics.actors_stopped.fetch_add(1, Ordering::Relaxed);
        cell.emit(LifecycleEvent::Stopped);
        info!(actor = %cell.address, "Actor stopped");
    }
}

async fn worker_loop(pool: Arc<Pool>, system: Weak<SystemInner>, index: usize) {
    debug!(pool = %pool.id, worker = index, "Worker started");
    let mut turns: FuturesUnordered<BoxFuture<'static, ()>> = FuturesUnordered::new();

    loop {
        if let Some(cell) = pool.pop_ready() {
            if let Some(turn) = pool.begin_turn(&system, cell) {
                turns.push(turn);
            }
        }

        tokio::select! {
            biased;
            Some(()) = turns.next(), if !turns.is_empty() => {}
            _ = pool.ready_signal.notified() => {}
        }
    }
}

/// Run a hook future, turning a panic into a `HandlerError`
async fn run_guarded<T, F>(future: F) -> std::result::Result<T, HandlerError>
where
    F: Future<Output = std::result::Result<T, HandlerError>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(HandlerError::new(format!("panicked: {}", panic_message(panic.as_ref())))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

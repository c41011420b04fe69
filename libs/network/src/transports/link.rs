//! Outbound Link
//!
//! One persistent TCP connection to a remote endpoint, shared by every actor
//! in the process that talks to that endpoint.
//!
//! - Connected lazily on first use; a connection cycle makes up to
//!   `backoff.max_attempts` attempts before the link reports `LinkBroken`.
//! - Calls are multiplexed and matched to replies by envelope id.
//! - A dropped connection fails every call in flight on it with
//!   `LinkBroken`, ends remote watch streams, and starts a background
//!   reconnection cycle.
//! - Tells follow the endpoint's [`TellPolicy`] while no connection is up.
//!   Buffered tells discarded by a failed connection cycle are reported:
//!   the next tell on the link fails with `LinkBroken` naming the count.

use super::{tcp, LinkConfig, LinkMetrics, MetricsTracker, TellPolicy, SYSTEM_POOL};
use crate::protocol::{encode_frame, ControlMessage, Envelope, FrameDecoder, LifecycleEvent, Reply};
use crate::{ActorAddress, ActorUid, EnvelopeId, PoolId, Result, TransportError};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

/// Outcome of a request sent over a link
pub type LinkReply = Result<Reply>;

/// Observable link state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No connection and no connection cycle running
    Idle,
    /// First connection cycle in progress
    Connecting,
    Connected,
    /// Connection dropped; a new cycle is pending or running
    Reconnecting,
    /// Closed by the owner; no further traffic
    Closed,
}

struct Connection {
    tx: mpsc::UnboundedSender<Bytes>,
    generation: u64,
}

struct PendingCall {
    generation: u64,
    sent_at: Instant,
    reply: oneshot::Sender<LinkReply>,
}

struct RemoteWatch {
    generation: u64,
    events: mpsc::UnboundedSender<LifecycleEvent>,
}

#[derive(Default)]
struct LinkInner {
    connection: Option<Connection>,
    generation: u64,
    connecting: bool,
    reconnecting: bool,
    closed: bool,
    buffer: VecDeque<Bytes>,
    /// Buffered tells discarded since the last tell was told about it
    unreported_drops: usize,
}

struct LinkShared {
    endpoint: String,
    config: LinkConfig,
    tell_policy: TellPolicy,
    inner: Mutex<LinkInner>,
    /// Serializes connection cycles
    connect_lock: tokio::sync::Mutex<()>,
    pending: DashMap<EnvelopeId, PendingCall>,
    watchers: DashMap<EnvelopeId, RemoteWatch>,
    metrics: MetricsTracker,
}

/// Client side of a persistent connection to one remote endpoint
#[derive(Clone)]
pub struct Link {
    shared: Arc<LinkShared>,
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("endpoint", &self.shared.endpoint)
            .field("state", &self.state())
            .field("pending_calls", &self.pending_calls())
            .finish()
    }
}

impl Link {
    pub fn new(endpoint: impl Into<String>, config: LinkConfig) -> Self {
        let endpoint = endpoint.into();
        let tell_policy = config.tell_policy_for(&endpoint);
        Self {
            shared: Arc::new(LinkShared {
                endpoint,
                config,
                tell_policy,
                inner: Mutex::new(LinkInner::default()),
                connect_lock: tokio::sync::Mutex::new(()),
                pending: DashMap::new(),
                watchers: DashMap::new(),
                metrics: MetricsTracker::new(),
            }),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.shared.endpoint
    }

    pub fn tell_policy(&self) -> TellPolicy {
        self.shared.tell_policy
    }

    pub fn state(&self) -> LinkState {
        let inner = self.shared.inner.lock();
        if inner.closed {
            LinkState::Closed
        } else if inner.connection.is_some() {
            LinkState::Connected
        } else if inner.reconnecting {
            LinkState::Reconnecting
        } else if inner.connecting {
            LinkState::Connecting
        } else {
            LinkState::Idle
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Calls awaiting a reply on this link
    pub fn pending_calls(&self) -> usize {
        self.shared.pending.len()
    }

    /// Tells queued while disconnected
    pub fn buffered_tells(&self) -> usize {
        self.shared.inner.lock().buffer.len()
    }

    pub fn metrics(&self) -> LinkMetrics {
        self.shared.metrics.snapshot()
    }

    /// Run a connection cycle now if the link is not connected
    pub async fn connect(&self) -> Result<()> {
        self.sender(false).await.map(|_| ())
    }

    /// Send a fire-and-forget envelope
    pub async fn tell(&self, envelope: Envelope) -> Result<()> {
        let frame = encode_frame(&envelope, self.shared.config.max_frame_size)?;
        match self.shared.tell_policy {
            TellPolicy::FailFast => {
                let (tx, _) = self.sender(true).await?;
                tx.send(frame)
                    .map_err(|_| self.broken("connection lost during send"))
            }
            TellPolicy::Buffer { max } => self.send_or_buffer(frame, max),
        }
    }

    /// Send an envelope that expects a reply
    ///
    /// The returned receiver completes with the remote reply, or with
    /// `LinkBroken` if the connection carrying the request goes away.
    /// Dropping the receiver does not unregister the call; use
    /// [`Link::cancel`] for that.
    pub async fn request(&self, envelope: Envelope) -> Result<oneshot::Receiver<LinkReply>> {
        let id = envelope.id();
        let frame = encode_frame(&envelope, self.shared.config.max_frame_size)?;
        let (tx, generation) = self.sender(false).await?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared.pending.insert(
            id,
            PendingCall {
                generation,
                sent_at: Instant::now(),
                reply: reply_tx,
            },
        );

        if !self.is_current(generation) || tx.send(frame).is_err() {
            self.shared.pending.remove(&id);
            return Err(self.broken("connection lost before send"));
        }

        trace!(endpoint = %self.shared.endpoint, envelope = %id, "Request sent");
        Ok(reply_rx)
    }

    /// Forget a pending call and ask the remote side to drop it
    pub fn cancel(&self, id: EnvelopeId, destination: &ActorAddress) {
        if self.shared.pending.remove(&id).is_some() {
            debug!(endpoint = %self.shared.endpoint, envelope = %id, "Cancelling remote call");
            self.send_control_if_connected(id, destination, &ControlMessage::Cancel);
        }
    }

    /// Subscribe to lifecycle events of a remote actor
    ///
    /// The stream ends after `Stopped` or when the connection drops.
    pub async fn watch(
        &self,
        subscription: EnvelopeId,
        destination: ActorAddress,
    ) -> Result<mpsc::UnboundedReceiver<LifecycleEvent>> {
        let envelope = Envelope::control(subscription, destination, &ControlMessage::Watch)?;
        let frame = encode_frame(&envelope, self.shared.config.max_frame_size)?;
        let (tx, generation) = self.sender(false).await?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.shared.watchers.insert(
            subscription,
            RemoteWatch {
                generation,
                events: events_tx,
            },
        );

        if !self.is_current(generation) || tx.send(frame).is_err() {
            self.shared.watchers.remove(&subscription);
            return Err(self.broken("connection lost before watch"));
        }
        Ok(events_rx)
    }

    pub fn unwatch(&self, subscription: EnvelopeId, destination: &ActorAddress) {
        if self.shared.watchers.remove(&subscription).is_some() {
            self.send_control_if_connected(subscription, destination, &ControlMessage::Unwatch);
        }
    }

    /// Close the link; calls in flight fail with `LinkBroken`
    pub fn close(&self) {
        let connection = {
            let mut inner = self.shared.inner.lock();
            inner.closed = true;
            inner.buffer.clear();
            inner.connection.take()
        };
        if connection.is_some() {
            info!(endpoint = %self.shared.endpoint, "Closing link");
        }
    }

    fn broken(&self, reason: impl Into<String>) -> TransportError {
        TransportError::link_broken(self.shared.endpoint.clone(), reason)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.shared
            .inner
            .lock()
            .connection
            .as_ref()
            .map(|c| c.generation)
            == Some(generation)
    }

    fn current_sender(&self, fail_fast: bool) -> Result<Option<(mpsc::UnboundedSender<Bytes>, u64)>> {
        let inner = self.shared.inner.lock();
        if inner.closed {
            return Err(self.broken("link closed"));
        }
        if let Some(connection) = inner.connection.as_ref() {
            return Ok(Some((connection.tx.clone(), connection.generation)));
        }
        if fail_fast && inner.reconnecting {
            return Err(self.broken("link is reconnecting"));
        }
        Ok(None)
    }

    /// Outbound channel of the live connection, connecting if needed
    async fn sender(&self, fail_fast: bool) -> Result<(mpsc::UnboundedSender<Bytes>, u64)> {
        if let Some(found) = self.current_sender(fail_fast)? {
            return Ok(found);
        }
        self.establish().await?;
        self.current_sender(false)?
            .ok_or_else(|| self.broken("connection lost right after connect"))
    }

    fn send_or_buffer(&self, mut frame: Bytes, max: usize) -> Result<()> {
        {
            let mut inner = self.shared.inner.lock();
            if inner.closed {
                return Err(self.broken("link closed"));
            }
            if inner.unreported_drops > 0 {
                let dropped = std::mem::take(&mut inner.unreported_drops);
                return Err(self.broken(format!(
                    "{} buffered tells discarded after a failed connection cycle",
                    dropped
                )));
            }
            if let Some(connection) = inner.connection.as_ref() {
                match connection.tx.send(frame) {
                    Ok(()) => return Ok(()),
                    Err(mpsc::error::SendError(returned)) => frame = returned,
                }
            }
            if inner.buffer.len() >= max {
                self.shared.metrics.record_error("link_broken");
                return Err(self.broken(format!("tell buffer full ({} queued)", max)));
            }
            inner.buffer.push_back(frame);
        }
        self.schedule_connect();
        Ok(())
    }

    fn send_control_if_connected(&self, id: EnvelopeId, destination: &ActorAddress, message: &ControlMessage) {
        let frame = match Envelope::control(id, destination.clone(), message)
            .and_then(|envelope| encode_frame(&envelope, self.shared.config.max_frame_size))
        {
            Ok(frame) => frame,
            Err(e) => {
                warn!(endpoint = %self.shared.endpoint, error = %e, "Failed to encode control frame");
                return;
            }
        };

        if let Some(connection) = self.shared.inner.lock().connection.as_ref() {
            let _ = connection.tx.send(frame);
        }
    }

    /// Start a background connection cycle unless one is already running
    fn schedule_connect(&self) {
        {
            let mut inner = self.shared.inner.lock();
            if inner.closed || inner.connecting || inner.connection.is_some() {
                return;
            }
            inner.connecting = true;
        }

        let link = self.clone();
        tokio::spawn(async move {
            if let Err(e) = link.establish().await {
                warn!(endpoint = %link.shared.endpoint, error = %e, "Background connection cycle failed");
            }
        });
    }

    /// Run one connection cycle with bounded exponential backoff
    async fn establish(&self) -> Result<()> {
        let _cycle = self.shared.connect_lock.lock().await;
        {
            let mut inner = self.shared.inner.lock();
            if inner.closed {
                return Err(self.broken("link closed"));
            }
            if inner.connection.is_some() {
                return Ok(());
            }
            inner.connecting = true;
        }

        let backoff = &self.shared.config.backoff;
        let mut last_error = None;

        for attempt in 0..backoff.max_attempts {
            if attempt > 0 {
                let delay = backoff.delay(attempt - 1);
                debug!(
                    endpoint = %self.shared.endpoint,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying link connection"
                );
                tokio::time::sleep(delay).await;
            }

            match tcp::connect(&self.shared.endpoint, self.shared.config.connect_timeout).await {
                Ok(stream) => return self.install(stream),
                Err(e) => {
                    warn!(
                        endpoint = %self.shared.endpoint,
                        attempt = attempt + 1,
                        max_attempts = backoff.max_attempts,
                        error = %e,
                        "Link connection attempt failed"
                    );
                    self.shared.metrics.record_error(e.category());
                    last_error = Some(e);
                }
            }
        }

        let dropped = {
            let mut inner = self.shared.inner.lock();
            inner.connecting = false;
            inner.reconnecting = false;
            let dropped = inner.buffer.len();
            inner.buffer.clear();
            inner.unreported_drops += dropped;
            dropped
        };
        if dropped > 0 {
            self.shared.metrics.record_dropped_tells(dropped as u64);
            warn!(
                endpoint = %self.shared.endpoint,
                dropped,
                "Discarding buffered tells after failed connection cycle"
            );
        }

        Err(self.broken(format!(
            "gave up after {} attempts: {}",
            backoff.max_attempts,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Publish a fresh connection and flush buffered tells in order
    fn install(&self, stream: TcpStream) -> Result<()> {
        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut inner = self.shared.inner.lock();
        inner.connecting = false;
        if inner.closed {
            return Err(self.broken("link closed while connecting"));
        }

        inner.generation += 1;
        let generation = inner.generation;
        let flushed = inner.buffer.len();
        for frame in inner.buffer.drain(..) {
            let _ = tx.send(frame);
        }

        tokio::spawn(self.clone().run_connection(reader, writer, rx, tx.downgrade(), generation));
        inner.connection = Some(Connection { tx, generation });
        inner.reconnecting = false;
        drop(inner);

        self.shared.metrics.record_connect();
        info!(
            endpoint = %self.shared.endpoint,
            generation,
            flushed_tells = flushed,
            "Link connected"
        );
        Ok(())
    }

    async fn run_connection(
        self,
        mut reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        rx: mpsc::UnboundedReceiver<Bytes>,
        keepalive_tx: mpsc::WeakUnboundedSender<Bytes>,
        generation: u64,
    ) {
        let metrics = self.shared.metrics.clone();

        let read_loop = async {
            let mut decoder = FrameDecoder::new(self.shared.config.max_frame_size);
            loop {
                match tcp::read_envelope(&mut reader, &mut decoder, &metrics).await {
                    Ok(Some(envelope)) => self.dispatch(envelope),
                    Ok(None) => break "connection closed by peer".to_string(),
                    Err(e) => {
                        metrics.record_error(e.category());
                        break e.to_string();
                    }
                }
            }
        };

        let reason = tokio::select! {
            reason = read_loop => reason,
            result = tcp::write_frames(writer, rx, metrics.clone()) => match result {
                Ok(()) => "link closed".to_string(),
                Err(e) => e.to_string(),
            },
            _ = self.keepalive(keepalive_tx) => "keep-alive stopped".to_string(),
        };

        self.on_disconnect(generation, reason);
    }

    async fn keepalive(&self, tx: mpsc::WeakUnboundedSender<Bytes>) {
        let destination = ActorAddress::new(
            self.shared.endpoint.clone(),
            PoolId::new(SYSTEM_POOL),
            ActorUid::new("link"),
        );
        let mut ticker = tokio::time::interval(self.shared.config.keepalive_interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(tx) = tx.upgrade() else {
                return;
            };
            let frame = match Envelope::control(EnvelopeId::new(), destination.clone(), &ControlMessage::Ping)
                .and_then(|envelope| encode_frame(&envelope, self.shared.config.max_frame_size))
            {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(endpoint = %self.shared.endpoint, error = %e, "Failed to encode ping");
                    return;
                }
            };
            if tx.send(frame).is_err() {
                return;
            }
        }
    }

    /// Route one inbound frame to the call or watch it belongs to
    fn dispatch(&self, envelope: Envelope) {
        let id = envelope.id();
        let message = match envelope.control_message() {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    endpoint = %self.shared.endpoint,
                    kind = ?envelope.kind(),
                    error = %e,
                    "Unexpected envelope on outbound link"
                );
                return;
            }
        };

        match message {
            ControlMessage::Reply(reply) => match self.shared.pending.remove(&id) {
                Some((_, call)) => {
                    self.shared
                        .metrics
                        .record_call_latency(call.sent_at.elapsed().as_nanos() as u64);
                    let _ = call.reply.send(Ok(reply));
                }
                None => debug!(
                    endpoint = %self.shared.endpoint,
                    envelope = %id,
                    "Dropping reply for unknown or cancelled call"
                ),
            },
            ControlMessage::Lifecycle(event) => {
                let delivered = self
                    .shared
                    .watchers
                    .get(&id)
                    .map(|watch| watch.events.send(event).is_ok())
                    .unwrap_or(false);
                if !delivered || event == LifecycleEvent::Stopped {
                    self.shared.watchers.remove(&id);
                }
            }
            ControlMessage::Pong => trace!(endpoint = %self.shared.endpoint, "Pong"),
            other => warn!(
                endpoint = %self.shared.endpoint,
                message = ?other,
                "Unexpected control message on outbound link"
            ),
        }
    }

    fn on_disconnect(&self, generation: u64, reason: String) {
        let reconnect = {
            let mut inner = self.shared.inner.lock();
            let current = inner.connection.as_ref().map(|c| c.generation) == Some(generation);
            if current {
                inner.connection = None;
                inner.reconnecting = !inner.closed;
            }
            current && !inner.closed
        };
        self.shared.metrics.record_disconnect();

        let error = self.broken(reason.clone());
        let failed: Vec<EnvelopeId> = self
            .shared
            .pending
            .iter()
            .filter(|entry| entry.generation == generation)
            .map(|entry| *entry.key())
            .collect();
        for id in &failed {
            if let Some((_, call)) = self.shared.pending.remove(id) {
                let _ = call.reply.send(Err(error.clone()));
            }
        }
        self.shared
            .watchers
            .retain(|_, watch| watch.generation != generation);

        warn!(
            endpoint = %self.shared.endpoint,
            generation,
            failed_calls = failed.len(),
            reason = %reason,
            "Link disconnected"
        );

        if reconnect {
            self.schedule_connect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transports::BackoffConfig;
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn dead_endpoint() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr.to_string()
    }

    fn config(policy: TellPolicy, base_ms: u64) -> LinkConfig {
        LinkConfig {
            connect_timeout: Duration::from_millis(200),
            backoff: BackoffConfig::new(Duration::from_millis(base_ms), Duration::from_millis(base_ms * 4), 3),
            tell_policy: policy,
            ..Default::default()
        }
    }

    fn envelope(endpoint: &str) -> Envelope {
        Envelope::tell(
            ActorAddress::new(endpoint, PoolId::new("main"), ActorUid::new("sink")),
            vec![1u8],
        )
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_reports_link_broken() {
        let endpoint = dead_endpoint().await;
        let link = Link::new(endpoint.clone(), config(TellPolicy::FailFast, 5));

        let err = link.tell(envelope(&endpoint)).await.unwrap_err();
        assert!(matches!(err, TransportError::LinkBroken { .. }));
        assert_eq!(link.state(), LinkState::Idle);
        assert_eq!(link.metrics().connects, 0);
    }

    #[tokio::test]
    async fn test_buffer_policy_overflow() {
        let endpoint = dead_endpoint().await;
        let link = Link::new(endpoint.clone(), config(TellPolicy::Buffer { max: 2 }, 200));

        link.tell(envelope(&endpoint)).await.unwrap();
        link.tell(envelope(&endpoint)).await.unwrap();
        assert_eq!(link.buffered_tells(), 2);

        let err = link.tell(envelope(&endpoint)).await.unwrap_err();
        assert!(matches!(err, TransportError::LinkBroken { .. }));
    }

    #[tokio::test]
    async fn test_discarded_buffer_is_reported_on_next_tell() {
        let endpoint = dead_endpoint().await;
        let link = Link::new(endpoint.clone(), config(TellPolicy::Buffer { max: 8 }, 5));

        link.tell(envelope(&endpoint)).await.unwrap();
        link.tell(envelope(&endpoint)).await.unwrap();
        assert!(link.connect().await.is_err());
        assert_eq!(link.buffered_tells(), 0);
        assert_eq!(link.metrics().dropped_tells, 2);

        let err = link.tell(envelope(&endpoint)).await.unwrap_err();
        match err {
            TransportError::LinkBroken { reason, .. } => assert!(reason.contains("2 buffered tells discarded")),
            other => panic!("expected LinkBroken, got {:?}", other),
        }

        // Reported once; later tells are buffered again
        link.tell(envelope(&endpoint)).await.unwrap();
        assert_eq!(link.buffered_tells(), 1);
    }

    #[tokio::test]
    async fn test_closed_link_rejects_traffic() {
        let endpoint = dead_endpoint().await;
        let link = Link::new(endpoint.clone(), config(TellPolicy::Buffer { max: 8 }, 5));
        link.close();

        assert_eq!(link.state(), LinkState::Closed);
        assert!(link.tell(envelope(&endpoint)).await.is_err());
        assert!(link
            .request(Envelope::call(envelope(&endpoint).destination().clone(), Vec::new()))
            .await
            .is_err());
    }
}

//! Inbound Listener
//!
//! Accepts connections from remote links, decodes frames and hands each
//! envelope to the [`InboundHandler`]. Anything the handler sends back
//! (call replies, lifecycle events) goes out on the connection the request
//! arrived on, through a [`ReplySink`]. `Ping` is answered here.

use super::{tcp, LinkMetrics, MetricsTracker};
use crate::protocol::{encode_frame, ControlMessage, Envelope, EnvelopeKind, FrameDecoder, LifecycleEvent, Reply};
use crate::{ActorAddress, EnvelopeId, Result, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Receiver of envelopes arriving on inbound connections
#[async_trait]
pub trait InboundHandler: Send + Sync + 'static {
    /// Handle one envelope; requests are answered through `replies`
    ///
    /// Envelopes from one connection are handed over in arrival order and
    /// the next one is not read until this returns.
    async fn handle_envelope(&self, envelope: Envelope, replies: ReplySink);
}

/// Write side of one inbound connection
#[derive(Clone)]
pub struct ReplySink {
    tx: mpsc::UnboundedSender<Bytes>,
    peer: SocketAddr,
    max_frame_size: usize,
    metrics: MetricsTracker,
}

impl std::fmt::Debug for ReplySink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplySink")
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ReplySink {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Whether the connection behind this sink has gone away
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Completes once the connection behind this sink has gone away
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    pub fn send_control(
        &self,
        id: EnvelopeId,
        destination: ActorAddress,
        message: &ControlMessage,
    ) -> Result<()> {
        let envelope = Envelope::control(id, destination, message)?;
        let frame = encode_frame(&envelope, self.max_frame_size)?;
        self.tx.send(frame).map_err(|_| {
            TransportError::connection(format!("Inbound connection closed ({})", id), Some(self.peer))
        })
    }

    /// Count an inbound tell that could not be delivered
    ///
    /// Tells carry no reply, so the sender never learns about it; the
    /// count shows up in [`Listener::metrics`].
    pub fn record_dropped_tell(&self) {
        self.metrics.record_dropped_tells(1);
    }

    /// Answer the request `request_id`
    pub fn reply(&self, request_id: EnvelopeId, destination: ActorAddress, reply: Reply) -> Result<()> {
        self.send_control(request_id, destination, &ControlMessage::Reply(reply))
    }

    /// Forward a lifecycle event for the watch `subscription`
    pub fn lifecycle(
        &self,
        subscription: EnvelopeId,
        destination: ActorAddress,
        event: LifecycleEvent,
    ) -> Result<()> {
        self.send_control(subscription, destination, &ControlMessage::Lifecycle(event))
    }
}

/// TCP listener serving remote links
pub struct Listener {
    local_addr: SocketAddr,
    metrics: MetricsTracker,
    task: JoinHandle<()>,
}

impl Listener {
    /// Bind `addr` and start accepting connections
    pub async fn bind(
        addr: &str,
        max_frame_size: usize,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::network_with_source(format!("Failed to bind {}", addr), e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TransportError::network_with_source("Failed to get local address", e))?;

        let metrics = MetricsTracker::new();
        let task = tokio::spawn(accept_loop(listener, handler, max_frame_size, metrics.clone()));

        info!(address = %local_addr, "Actor listener started");
        Ok(Self {
            local_addr,
            metrics,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn metrics(&self) -> LinkMetrics {
        self.metrics.snapshot()
    }

    /// Stop accepting and drop every inbound connection
    pub fn shutdown(&self) {
        if !self.task.is_finished() {
            info!(address = %self.local_addr, "Actor listener stopping");
        }
        self.task.abort();
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    handler: Arc<dyn InboundHandler>,
    max_frame_size: usize,
    metrics: MetricsTracker,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tcp::configure(&stream);
                    debug!(peer = %peer, "Accepted inbound connection");
                    connections.spawn(serve_connection(
                        stream,
                        peer,
                        handler.clone(),
                        max_frame_size,
                        metrics.clone(),
                    ));
                }
                Err(e) => {
                    warn!("Failed to accept inbound connection: {}", e);
                    metrics.record_error("io");
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<dyn InboundHandler>,
    max_frame_size: usize,
    metrics: MetricsTracker,
) {
    let (mut reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let sink = ReplySink {
        tx,
        peer,
        max_frame_size,
        metrics: metrics.clone(),
    };

    let read_loop = async {
        let mut decoder = FrameDecoder::new(max_frame_size);
        loop {
            match tcp::read_envelope(&mut reader, &mut decoder, &metrics).await {
                Ok(Some(envelope)) => {
                    if envelope.kind() == EnvelopeKind::Control
                        && matches!(envelope.control_message(), Ok(ControlMessage::Ping))
                    {
                        let destination = envelope.destination().clone();
                        if let Err(e) = sink.send_control(envelope.id(), destination, &ControlMessage::Pong) {
                            debug!(peer = %peer, error = %e, "Failed to answer ping");
                        }
                        continue;
                    }
                    handler.handle_envelope(envelope, sink.clone()).await;
                }
                Ok(None) => {
                    debug!(peer = %peer, "Inbound connection closed");
                    break;
                }
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Dropping inbound connection");
                    metrics.record_error(e.category());
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = read_loop => {}
        result = tcp::write_frames(writer, rx, metrics.clone()) => {
            if let Err(e) = result {
                warn!(peer = %peer, error = %e, "Inbound connection write failed");
            }
        }
    }
}

//! TCP Connection Plumbing
//!
//! Connect with timeout, a batching frame writer fed by a channel, and a
//! frame reader over the decoder. Links and the listener both build their
//! connection tasks out of these pieces.

use super::MetricsTracker;
use crate::protocol::{Envelope, FrameDecoder};
use crate::{Result, TransportError};
use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Upper bound on bytes coalesced into one write
const WRITE_BATCH_BYTES: usize = 64 * 1024;

/// Connect to `endpoint` (`host:port`) within `timeout`
pub async fn connect(endpoint: &str, timeout: Duration) -> Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(endpoint))
        .await
        .map_err(|_| TransportError::timeout(format!("connect {}", endpoint), timeout.as_millis() as u64))?
        .map_err(|e| TransportError::connection_with_source(format!("Failed to connect to {}", endpoint), None, e))?;

    configure(&stream);
    debug!(endpoint = %endpoint, "TCP connection established");
    Ok(stream)
}

/// Apply socket options used on every actor connection
pub fn configure(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }
}

/// Drain `rx` onto the socket until the channel closes
///
/// Frames queued together are coalesced into a single write.
pub async fn write_frames(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    metrics: MetricsTracker,
) -> Result<()> {
    let mut buffer = BytesMut::with_capacity(WRITE_BATCH_BYTES);

    while let Some(frame) = rx.recv().await {
        buffer.clear();
        metrics.record_send(frame.len());
        buffer.extend_from_slice(&frame);

        while buffer.len() < WRITE_BATCH_BYTES {
            match rx.try_recv() {
                Ok(frame) => {
                    metrics.record_send(frame.len());
                    buffer.extend_from_slice(&frame);
                }
                Err(_) => break,
            }
        }

        writer
            .write_all(&buffer)
            .await
            .map_err(|e| TransportError::network_with_source("Failed to write frames", e))?;
        writer
            .flush()
            .await
            .map_err(|e| TransportError::network_with_source("Failed to flush TCP stream", e))?;
        trace!(bytes = buffer.len(), "Wrote frame batch");
    }

    if let Err(e) = writer.shutdown().await {
        debug!("Error shutting down TCP write half: {}", e);
    }
    Ok(())
}

/// Read the next envelope, or `None` on a clean end of stream
pub async fn read_envelope(
    reader: &mut OwnedReadHalf,
    decoder: &mut FrameDecoder,
    metrics: &MetricsTracker,
) -> Result<Option<Envelope>> {
    loop {
        if let Some(body) = decoder.next_frame()? {
            metrics.record_receive(body.len());
            return Envelope::from_bytes(&body).map(Some);
        }

        let read = reader
            .read_buf(decoder.buffer_mut())
            .await
            .map_err(|e| TransportError::network_with_source("Failed to read from TCP stream", e))?;

        if read == 0 {
            if decoder.buffered() > 0 {
                return Err(TransportError::protocol(format!(
                    "Connection closed with {} bytes of a partial frame",
                    decoder.buffered()
                )));
            }
            return Ok(None);
        }
    }
}

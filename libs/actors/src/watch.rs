//! Lifecycle Watch Streams
//!
//! `watch` hands out a lazy stream: nothing is subscribed until the first
//! poll. The stream yields `Started`/`Restarted` events as they happen and
//! ends after `Stopped`. Watching an actor that does not exist yields a
//! single `Stopped`.

use futures::stream::{self, BoxStream, Stream, StreamExt};
use oscar_network::{ActorAddress, EnvelopeId, LifecycleEvent, Link};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{broadcast, mpsc};

/// Stream of lifecycle events for one actor
pub struct LifecycleStream {
    inner: BoxStream<'static, LifecycleEvent>,
}

impl LifecycleStream {
    /// Stream that subscribes by running `subscribe` on first poll
    pub(crate) fn lazy<F>(subscribe: F) -> Self
    where
        F: Future<Output = BoxStream<'static, LifecycleEvent>> + Send + 'static,
    {
        Self {
            inner: stream::once(subscribe).flatten().boxed(),
        }
    }

    pub(crate) fn stopped() -> BoxStream<'static, LifecycleEvent> {
        stream::iter([LifecycleEvent::Stopped]).boxed()
    }

    /// Events of a local actor
    pub(crate) fn local(receiver: broadcast::Receiver<LifecycleEvent>) -> BoxStream<'static, LifecycleEvent> {
        stream::unfold(Some(receiver), |state| async move {
            let mut receiver = state?;
            loop {
                match receiver.recv().await {
                    Ok(LifecycleEvent::Stopped) | Err(broadcast::error::RecvError::Closed) => {
                        return Some((LifecycleEvent::Stopped, None));
                    }
                    Ok(event) => return Some((event, Some(receiver))),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }
        })
        .boxed()
    }

    /// Events of a remote actor, forwarded over `link`
    pub(crate) fn remote(
        link: Link,
        subscription: EnvelopeId,
        destination: ActorAddress,
        events: mpsc::UnboundedReceiver<LifecycleEvent>,
    ) -> BoxStream<'static, LifecycleEvent> {
        RemoteWatch {
            link,
            subscription,
            destination,
            events,
            finished: false,
        }
        .boxed()
    }
}

impl Stream for LifecycleStream {
    type Item = LifecycleEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl std::fmt::Debug for LifecycleStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleStream").finish_non_exhaustive()
    }
}

/// Remote subscription; unsubscribes when dropped before `Stopped`
struct RemoteWatch {
    link: Link,
    subscription: EnvelopeId,
    destination: ActorAddress,
    events: mpsc::UnboundedReceiver<LifecycleEvent>,
    finished: bool,
}

impl Stream for RemoteWatch {
    type Item = LifecycleEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.events.poll_recv(cx) {
            Poll::Ready(Some(LifecycleEvent::Stopped)) | Poll::Ready(None) => {
                // End of stream from the link means the connection dropped
                self.finished = true;
                Poll::Ready(Some(LifecycleEvent::Stopped))
            }
            Poll::Ready(Some(event)) => Poll::Ready(Some(event)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for RemoteWatch {
    fn drop(&mut self) {
        if !self.finished {
            self.link.unwatch(self.subscription, &self.destination);
        }
    }
}

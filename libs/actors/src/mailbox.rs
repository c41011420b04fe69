//! Actor Mailbox
//!
//! FIFO of pending deliveries plus the actor's run status. The mailbox is
//! also the turn gate: a worker may only run the actor after moving the
//! status from `Idle` to `Running`, so at most one delivery per actor is
//! ever being handled.
//!
//! With a high watermark set, `push` suspends once the queue reaches it and
//! stays suspended until the queue drains to the low watermark. Nothing is
//! dropped for backpressure.

use oscar_network::{Envelope, EnvelopeId, EnvelopeKind, Reply, ReplyError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{oneshot, Notify};

/// One-shot completion for a `Call`
pub(crate) type Responder = oneshot::Sender<Reply>;

/// An envelope and, for calls, where its reply goes
pub(crate) struct Delivery {
    pub envelope: Envelope,
    pub responder: Option<Responder>,
}

impl Delivery {
    pub fn tell(envelope: Envelope) -> Self {
        Self {
            envelope,
            responder: None,
        }
    }

    pub fn call(envelope: Envelope, responder: Responder) -> Self {
        Self {
            envelope,
            responder: Some(responder),
        }
    }

    /// Complete the waiter, if any, with `reply`
    pub fn respond(self, reply: Reply) {
        if let Some(responder) = self.responder {
            let _ = responder.send(reply);
        }
    }
}

/// Run status of a mailbox's actor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxStatus {
    Idle,
    Running,
    Stopped,
}

/// High/low watermark pair; `None` high means unbounded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Watermarks {
    pub high: Option<usize>,
    pub low: usize,
}

impl Watermarks {
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Bounded at `high`, resuming at `low` (`high / 2` when `None`)
    pub fn bounded(high: usize, low: Option<usize>) -> Self {
        Self {
            high: Some(high.max(1)),
            low: low.unwrap_or(high / 2).min(high.saturating_sub(1)),
        }
    }
}

/// What `finish_turn` decided for the actor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TurnEnd {
    /// Back to idle; `reschedule` when messages are waiting
    Idle { reschedule: bool },
    /// A restart was requested while the turn ran; status stays `Running`
    Restart,
    Stopped,
}

/// Outcome of `claim_for_restart`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RestartClaim {
    /// Mailbox was idle and is now `Running`; the caller restarts the actor
    Claimed,
    /// A turn is running; it will restart the actor when it ends
    Deferred,
    Stopped,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    expired: AtomicU64,
    cancelled: AtomicU64,
    backpressure_waits: AtomicU64,
}

struct MailboxInner {
    queue: VecDeque<Delivery>,
    status: MailboxStatus,
    /// Sitting in the pool's ready queue
    queued: bool,
    accepting: bool,
    restart_pending: bool,
}

pub(crate) struct Mailbox {
    inner: Mutex<MailboxInner>,
    space: Notify,
    watermarks: Watermarks,
    counters: Counters,
}

impl Mailbox {
    /// New mailbox, `Running` until the actor's `on_start` completes
    pub fn new(watermarks: Watermarks) -> Self {
        Self {
            inner: Mutex::new(MailboxInner {
                queue: VecDeque::new(),
                status: MailboxStatus::Running,
                queued: false,
                accepting: true,
                restart_pending: false,
            }),
            space: Notify::new(),
            watermarks,
            counters: Counters::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn status(&self) -> MailboxStatus {
        self.inner.lock().status
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.lock().accepting
    }

    pub fn backpressure_waits(&self) -> u64 {
        self.counters.backpressure_waits.load(Ordering::Relaxed)
    }

    pub fn expired(&self) -> u64 {
        self.counters.expired.load(Ordering::Relaxed)
    }

    /// Enqueue a delivery, waiting while the mailbox is above its watermark
    ///
    /// Returns `Ok(true)` when the caller must put the actor on the ready
    /// queue, and hands the delivery back if the actor has stopped.
    pub async fn push(&self, delivery: Delivery) -> Result<bool, Delivery> {
        let mut waited = false;
        loop {
            let notified = self.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                if inner.status == MailboxStatus::Stopped {
                    return Err(delivery);
                }
                if inner.accepting {
                    inner.queue.push_back(delivery);
                    if let Some(high) = self.watermarks.high {
                        if inner.queue.len() >= high {
                            inner.accepting = false;
                        }
                    }
                    self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                    let schedule = inner.status == MailboxStatus::Idle && !inner.queued;
                    if schedule {
                        inner.queued = true;
                    }
                    return Ok(schedule);
                }
            }

            if !waited {
                waited = true;
                self.counters.backpressure_waits.fetch_add(1, Ordering::Relaxed);
            }
            notified.await;
        }
    }

    /// Take the next delivery and mark the actor `Running`
    ///
    /// Expired calls at the head are completed with `Timeout` and skipped.
    /// Returns `None` if the actor is not idle or nothing is left.
    pub fn begin_turn(&self) -> Option<Delivery> {
        let mut expired = Vec::new();
        let next = {
            let mut inner = self.inner.lock();
            inner.queued = false;
            if inner.status != MailboxStatus::Idle {
                return None;
            }
            let now = oscar_network::protocol::envelope::now_epoch_millis();
            let mut next = None;
            while let Some(delivery) = inner.queue.pop_front() {
                if delivery.envelope.kind() == EnvelopeKind::Call && delivery.envelope.is_expired_at(now) {
                    expired.push(delivery);
                    continue;
                }
                next = Some(delivery);
                break;
            }
            if next.is_some() {
                inner.status = MailboxStatus::Running;
            }
            self.release_if_drained(&mut inner);
            next
        };

        for delivery in expired {
            self.counters.expired.fetch_add(1, Ordering::Relaxed);
            let message = format!("deadline passed before {} was handled", delivery.envelope.id());
            delivery.respond(Err(ReplyError::Timeout(message)));
        }
        next
    }

    /// End the current turn (or startup)
    pub fn finish_turn(&self) -> TurnEnd {
        let mut inner = self.inner.lock();
        match inner.status {
            MailboxStatus::Stopped => TurnEnd::Stopped,
            _ if inner.restart_pending => {
                inner.restart_pending = false;
                TurnEnd::Restart
            }
            _ => {
                inner.status = MailboxStatus::Idle;
                let reschedule = !inner.queue.is_empty() && !inner.queued;
                if reschedule {
                    inner.queued = true;
                }
                TurnEnd::Idle { reschedule }
            }
        }
    }

    /// Claim an idle actor for restart, or leave a note for the running turn
    pub fn claim_for_restart(&self) -> RestartClaim {
        let mut inner = self.inner.lock();
        match inner.status {
            MailboxStatus::Stopped => RestartClaim::Stopped,
            MailboxStatus::Idle => {
                inner.status = MailboxStatus::Running;
                RestartClaim::Claimed
            }
            MailboxStatus::Running => {
                inner.restart_pending = true;
                RestartClaim::Deferred
            }
        }
    }

    /// Remove a queued call; false if it was already taken or never queued
    pub fn cancel(&self, id: EnvelopeId) -> bool {
        let removed = {
            let mut inner = self.inner.lock();
            let position = inner.queue.iter().position(|d| d.envelope.id() == id);
            let removed = position.and_then(|p| inner.queue.remove(p));
            if removed.is_some() {
                self.release_if_drained(&mut inner);
            }
            removed
        };
        match removed {
            Some(_) => {
                self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Mark stopped and hand back everything still queued
    pub fn stop(&self) -> Vec<Delivery> {
        let drained = {
            let mut inner = self.inner.lock();
            inner.status = MailboxStatus::Stopped;
            inner.queued = false;
            inner.restart_pending = false;
            inner.accepting = false;
            inner.queue.drain(..).collect()
        };
        self.space.notify_waiters();
        drained
    }

    fn release_if_drained(&self, inner: &mut MailboxInner) {
        if !inner.accepting && inner.status != MailboxStatus::Stopped && inner.queue.len() <= self.watermarks.low {
            inner.accepting = true;
            self.space.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oscar_network::{ActorAddress, ActorUid, PoolId};
    use std::sync::Arc;
    use std::time::Duration;

    fn address() -> ActorAddress {
        ActorAddress::new("local", PoolId::new("main"), ActorUid::new("a"))
    }

    fn tell(n: u8) -> Delivery {
        Delivery::tell(Envelope::tell(address(), vec![n]))
    }

    fn idle(watermarks: Watermarks) -> Mailbox {
        let mailbox = Mailbox::new(watermarks);
        assert_eq!(mailbox.finish_turn(), TurnEnd::Idle { reschedule: false });
        mailbox
    }

    #[tokio::test]
    async fn test_fifo_and_single_turn() {
        let mailbox = idle(Watermarks::unbounded());
        assert!(mailbox.push(tell(1)).await.ok().unwrap());
        assert!(!mailbox.push(tell(2)).await.ok().unwrap());

        let first = mailbox.begin_turn().unwrap();
        assert_eq!(first.envelope.payload().as_ref(), &[1]);
        assert_eq!(mailbox.status(), MailboxStatus::Running);
        assert!(mailbox.begin_turn().is_none());

        assert_eq!(mailbox.finish_turn(), TurnEnd::Idle { reschedule: true });
        let second = mailbox.begin_turn().unwrap();
        assert_eq!(second.envelope.payload().as_ref(), &[2]);
        assert_eq!(mailbox.finish_turn(), TurnEnd::Idle { reschedule: false });
    }

    #[tokio::test]
    async fn test_messages_during_startup_are_kept() {
        let mailbox = Mailbox::new(Watermarks::unbounded());
        assert!(!mailbox.push(tell(1)).await.ok().unwrap());
        assert_eq!(mailbox.finish_turn(), TurnEnd::Idle { reschedule: true });
        assert!(mailbox.begin_turn().is_some());
    }

    #[tokio::test]
    async fn test_expired_call_is_skipped_with_timeout() {
        let mailbox = idle(Watermarks::unbounded());
        let (tx, rx) = oneshot::channel();
        let expired = Envelope::call(address(), vec![9]).with_deadline_ms(Some(1));
        mailbox.push(Delivery::call(expired, tx)).await.ok().unwrap();
        mailbox.push(tell(1)).await.ok().unwrap();

        let next = mailbox.begin_turn().unwrap();
        assert_eq!(next.envelope.payload().as_ref(), &[1]);
        assert!(matches!(rx.await.unwrap(), Err(ReplyError::Timeout(_))));
        assert_eq!(mailbox.expired(), 1);
    }

    #[tokio::test]
    async fn test_cancel_removes_queued_call() {
        let mailbox = idle(Watermarks::unbounded());
        let (tx, rx) = oneshot::channel();
        let call = Envelope::call(address(), vec![1]);
        let id = call.id();
        mailbox.push(Delivery::call(call, tx)).await.ok().unwrap();

        assert!(mailbox.cancel(id));
        assert_eq!(mailbox.len(), 0);
        assert!(!mailbox.cancel(id));
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_stop_rejects_and_drains() {
        let mailbox = idle(Watermarks::unbounded());
        mailbox.push(tell(1)).await.ok().unwrap();
        let drained = mailbox.stop();
        assert_eq!(drained.len(), 1);
        assert!(mailbox.push(tell(2)).await.is_err());
        assert!(mailbox.begin_turn().is_none());
        assert_eq!(mailbox.finish_turn(), TurnEnd::Stopped);
    }

    #[tokio::test]
    async fn test_restart_claim() {
        let mailbox = idle(Watermarks::unbounded());
        assert_eq!(mailbox.claim_for_restart(), RestartClaim::Claimed);
        // Already running now: a second request is deferred to the turn end
        assert_eq!(mailbox.claim_for_restart(), RestartClaim::Deferred);
        assert_eq!(mailbox.finish_turn(), TurnEnd::Restart);
        assert_eq!(mailbox.finish_turn(), TurnEnd::Idle { reschedule: false });
    }

    #[tokio::test]
    async fn test_watermark_hysteresis() {
        let mailbox = Arc::new(idle(Watermarks::bounded(4, Some(1))));
        for n in 0..4 {
            mailbox.push(tell(n)).await.ok().unwrap();
        }
        assert!(!mailbox.is_accepting());

        let blocked = {
            let mailbox = mailbox.clone();
            tokio::spawn(async move { mailbox.push(tell(4)).await.is_ok() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        // 4 -> 2: still above low watermark
        for _ in 0..2 {
            mailbox.begin_turn().unwrap();
            mailbox.finish_turn();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        // 2 -> 1: released
        mailbox.begin_turn().unwrap();
        mailbox.finish_turn();
        assert!(tokio::time::timeout(Duration::from_secs(1), blocked).await.unwrap().unwrap());
        assert_eq!(mailbox.len(), 2);
        assert_eq!(mailbox.backpressure_waits(), 1);
    }

    #[tokio::test]
    async fn test_stop_wakes_blocked_senders() {
        let mailbox = Arc::new(idle(Watermarks::bounded(1, None)));
        mailbox.push(tell(0)).await.ok().unwrap();
        let blocked = {
            let mailbox = mailbox.clone();
            tokio::spawn(async move { mailbox.push(tell(1)).await.is_err() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        mailbox.stop();
        assert!(tokio::time::timeout(Duration::from_secs(1), blocked).await.unwrap().unwrap());
    }

    proptest::proptest! {
        #[test]
        fn prop_cancellation_keeps_remaining_order(
            cancelled in proptest::collection::vec(proptest::bool::ANY, 1..64),
        ) {
            let mailbox = idle(Watermarks::unbounded());
            let mut ids = Vec::new();
            futures::executor::block_on(async {
                for n in 0..cancelled.len() {
                    let delivery = tell(n as u8);
                    ids.push(delivery.envelope.id());
                    mailbox.push(delivery).await.ok().unwrap();
                }
            });
            for (id, cancel) in ids.iter().zip(&cancelled) {
                if *cancel {
                    proptest::prop_assert!(mailbox.cancel(*id));
                }
            }

            let expected: Vec<u8> = (0..cancelled.len())
                .filter(|n| !cancelled[*n])
                .map(|n| n as u8)
                .collect();
            proptest::prop_assert_eq!(mailbox.len(), expected.len());

            let mut handled = Vec::new();
            while let Some(delivery) = mailbox.begin_turn() {
                handled.push(delivery.envelope.payload()[0]);
                mailbox.finish_turn();
            }
            proptest::prop_assert_eq!(handled, expected);
        }
    }
}

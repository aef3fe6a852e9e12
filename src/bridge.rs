//! The bridge between the I/O executor and the application side.
//!
//! The bridge owns request/response correlation state and performs every
//! thread handoff: inbound messages queue towards the application
//! dispatcher, reply and write promises complete on the application
//! executor, never on the I/O thread.

use std::collections::{BTreeMap, VecDeque};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant;
use tracing::warn;

use crate::error::{Error, ErrorKind, Result};
use crate::message::{InboundMessage, Message};

/// What to do when the inbound dispatch queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressurePolicy {
    /// Queue without bound. The default.
    Unbounded,
    /// Keep at most this many queued messages, discarding the oldest.
    DropOldest(usize),
    /// Keep at most this many queued messages, suspending the reader until
    /// the dispatcher catches up.
    BlockWriter(usize),
}

/// Commands crossing from the application side to the I/O driver.
pub(crate) enum Command {
    /// Write a message; optionally acknowledge the completed write.
    Send {
        message: Message,
        ack: Option<oneshot::Sender<Result<()>>>,
    },
    /// Write a method call and correlate its reply.
    Call {
        message: Message,
        reply: oneshot::Sender<Result<InboundMessage>>,
    },
    /// Stop the driver. With `restart` the manager will reconnect.
    Shutdown { restart: bool },
}

/// Out-of-band notices from the I/O driver to the connection manager.
pub(crate) enum Notice {
    /// SASL concluded, the Hello roundtrip is in flight.
    AcquiringName,
    /// A non-fatal inbound failure for the application pipeline.
    InboundFailure(Error),
}

/// The per-connection serial counter. Serials are non-zero and skip zero
/// on wrap-around.
#[derive(Default)]
pub(crate) struct Serials(AtomicU32);

impl Serials {
    pub(crate) fn next(&self) -> NonZeroU32 {
        loop {
            let serial = self.0.fetch_add(1, Ordering::Relaxed).wrapping_add(1);

            if let Some(serial) = NonZeroU32::new(serial) {
                return serial;
            }
        }
    }

    /// Restart the counter for a fresh transport.
    pub(crate) fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

/// A method call awaiting its reply.
pub(crate) struct PendingCall {
    pub(crate) reply: oneshot::Sender<Result<InboundMessage>>,
    pub(crate) deadline: Instant,
}

/// The pending-call table, keyed by serial.
///
/// Serials increase monotonically within a connection, so iterating the
/// map in key order is iteration in insertion order.
#[derive(Default)]
pub(crate) struct PendingTable {
    map: BTreeMap<u32, PendingCall>,
}

impl PendingTable {
    pub(crate) fn insert(&mut self, serial: NonZeroU32, call: PendingCall) {
        self.map.insert(serial.get(), call);
    }

    pub(crate) fn remove(&mut self, serial: NonZeroU32) -> Option<PendingCall> {
        self.map.remove(&serial.get())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    /// The earliest deadline over all pending calls.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.map.values().map(|call| call.deadline).min()
    }

    /// Remove and return every call whose deadline has passed.
    pub(crate) fn expire(&mut self, now: Instant) -> Vec<PendingCall> {
        let expired: Vec<u32> = self
            .map
            .iter()
            .filter(|(_, call)| call.deadline <= now)
            .map(|(&serial, _)| serial)
            .collect();

        expired
            .into_iter()
            .filter_map(|serial| self.map.remove(&serial))
            .collect()
    }

    /// Remove every call, in insertion order.
    pub(crate) fn drain(&mut self) -> Vec<PendingCall> {
        std::mem::take(&mut self.map).into_values().collect()
    }
}

struct QueueState {
    items: VecDeque<InboundMessage>,
    closed: bool,
}

/// The inbound dispatch queue between the I/O driver and the application
/// dispatcher. Messages come out in the order they were pushed.
pub(crate) struct InboundQueue {
    state: Mutex<QueueState>,
    policy: BackpressurePolicy,
    reader: Notify,
    writer: Notify,
}

impl InboundQueue {
    pub(crate) fn new(policy: BackpressurePolicy) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            policy,
            reader: Notify::new(),
            writer: Notify::new(),
        }
    }

    fn capacity(&self) -> Option<usize> {
        match self.policy {
            BackpressurePolicy::Unbounded => None,
            BackpressurePolicy::DropOldest(cap) => Some(cap.max(1)),
            BackpressurePolicy::BlockWriter(cap) => Some(cap.max(1)),
        }
    }

    /// Push a message, applying the backpressure policy.
    pub(crate) async fn push(&self, message: InboundMessage) {
        let mut message = Some(message);

        loop {
            {
                let mut state = self.state.lock().expect("queue poisoned");

                if state.closed {
                    return;
                }

                let full = self
                    .capacity()
                    .is_some_and(|cap| state.items.len() >= cap);

                if !full {
                    state.items.push_back(message.take().expect("message consumed"));
                    self.reader.notify_one();
                    return;
                }

                if matches!(self.policy, BackpressurePolicy::DropOldest(..)) {
                    let dropped = state.items.pop_front();
                    warn!(
                        serial = dropped.map(|m| m.serial().get()),
                        "inbound queue full, dropping oldest message"
                    );
                    state.items.push_back(message.take().expect("message consumed"));
                    self.reader.notify_one();
                    return;
                }
            }

            // Block-writer: wait for the dispatcher to drain a slot.
            self.writer.notified().await;
        }
    }

    /// Pop the next message; `None` once the queue is closed and drained.
    pub(crate) async fn pop(&self) -> Option<InboundMessage> {
        loop {
            {
                let mut state = self.state.lock().expect("queue poisoned");

                if let Some(message) = state.items.pop_front() {
                    self.writer.notify_one();
                    return Some(message);
                }

                if state.closed {
                    return None;
                }
            }

            self.reader.notified().await;
        }
    }

    pub(crate) fn close(&self) {
        self.state.lock().expect("queue poisoned").closed = true;
        self.reader.notify_one();
        self.writer.notify_one();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.state.lock().expect("queue poisoned").items.len()
    }
}

/// The application-facing half the I/O driver talks to.
pub(crate) struct Bridge {
    pub(crate) queue: Arc<InboundQueue>,
    pub(crate) serials: Arc<Serials>,
    pub(crate) app: runtime::Handle,
    pub(crate) notices: mpsc::UnboundedSender<Notice>,
    pub(crate) default_timeout: Duration,
}

impl Bridge {
    /// Complete a reply promise on the application executor.
    pub(crate) fn complete_reply(
        &self,
        reply: oneshot::Sender<Result<InboundMessage>>,
        result: Result<InboundMessage>,
    ) {
        self.app.spawn(async move {
            let _ = reply.send(result);
        });
    }

    /// Complete a write acknowledgement on the application executor.
    pub(crate) fn complete_ack(&self, ack: oneshot::Sender<Result<()>>, result: Result<()>) {
        self.app.spawn(async move {
            let _ = ack.send(result);
        });
    }

    /// Fail every pending call with `Disconnected`, in insertion order.
    ///
    /// A single task performs the completions so the order survives the
    /// executor handoff.
    pub(crate) fn fail_all_pending(&self, table: &mut PendingTable) {
        let calls = table.drain();

        if calls.is_empty() {
            return;
        }

        self.app.spawn(async move {
            for call in calls {
                let _ = call
                    .reply
                    .send(Err(Error::new(ErrorKind::Disconnected)));
            }
        });
    }

    /// Surface a non-fatal inbound failure to the application pipeline.
    pub(crate) fn inbound_failure(&self, error: Error) {
        let _ = self.notices.send(Notice::InboundFailure(error));
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;

    use super::*;
    use crate::message::MessageKind;
    use crate::object_path::ObjectPath;
    use crate::proto::Flags;

    fn message(serial: u32) -> InboundMessage {
        InboundMessage {
            serial: NonZeroU32::new(serial).unwrap(),
            flags: Flags::EMPTY,
            kind: MessageKind::Signal {
                path: ObjectPath::new("/x").unwrap(),
                interface: "i.f".into(),
                member: "S".into(),
            },
            sender: Some(":1.7".into()),
            destination: None,
            signature: None,
            body: Vec::new(),
        }
    }

    #[test]
    fn serials_are_monotonic_and_skip_zero() {
        let serials = Serials::default();
        assert_eq!(serials.next().get(), 1);
        assert_eq!(serials.next().get(), 2);

        serials.0.store(u32::MAX, Ordering::Relaxed);
        assert_eq!(serials.next().get(), 1);
    }

    #[test]
    fn pending_table_drains_in_insertion_order() {
        let mut table = PendingTable::default();
        let deadline = Instant::now();

        let mut receivers = Vec::new();

        for serial in [3u32, 5, 9] {
            let (tx, rx) = oneshot::channel();
            receivers.push(rx);
            table.insert(
                NonZeroU32::new(serial).unwrap(),
                PendingCall {
                    reply: tx,
                    deadline,
                },
            );
        }

        let drained = table.drain();
        assert_eq!(drained.len(), 3);
        assert!(table.is_empty());
    }

    #[test]
    fn pending_table_expiry() {
        let mut table = PendingTable::default();
        let now = Instant::now();

        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();

        table.insert(
            NonZeroU32::new(1).unwrap(),
            PendingCall {
                reply: tx1,
                deadline: now,
            },
        );
        table.insert(
            NonZeroU32::new(2).unwrap(),
            PendingCall {
                reply: tx2,
                deadline: now + Duration::from_secs(60),
            },
        );

        assert_eq!(table.next_deadline(), Some(now));
        assert_eq!(table.expire(now).len(), 1);
        assert_eq!(table.len(), 1);
        assert_eq!(table.next_deadline(), Some(now + Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn unbounded_queue_preserves_order() {
        let queue = InboundQueue::new(BackpressurePolicy::Unbounded);

        queue.push(message(1)).await;
        queue.push(message(2)).await;
        queue.push(message(3)).await;

        assert_eq!(queue.pop().await.unwrap().serial().get(), 1);
        assert_eq!(queue.pop().await.unwrap().serial().get(), 2);
        assert_eq!(queue.pop().await.unwrap().serial().get(), 3);
    }

    #[tokio::test]
    async fn drop_oldest_discards_the_head() {
        let queue = InboundQueue::new(BackpressurePolicy::DropOldest(2));

        queue.push(message(1)).await;
        queue.push(message(2)).await;
        queue.push(message(3)).await;

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().await.unwrap().serial().get(), 2);
        assert_eq!(queue.pop().await.unwrap().serial().get(), 3);
    }

    #[tokio::test]
    async fn block_writer_waits_for_the_dispatcher() {
        let queue = Arc::new(InboundQueue::new(BackpressurePolicy::BlockWriter(1)));

        queue.push(message(1)).await;

        let writer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue.push(message(2)).await;
            })
        };

        tokio::task::yield_now().await;
        assert!(!writer.is_finished());

        assert_eq!(queue.pop().await.unwrap().serial().get(), 1);
        writer.await.unwrap();
        assert_eq!(queue.pop().await.unwrap().serial().get(), 2);
    }

    #[tokio::test]
    async fn closed_queue_drains_then_ends() {
        let queue = InboundQueue::new(BackpressurePolicy::Unbounded);

        queue.push(message(1)).await;
        queue.close();

        assert_eq!(queue.pop().await.unwrap().serial().get(), 1);
        assert!(queue.pop().await.is_none());
    }
}

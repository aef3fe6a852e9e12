//! The application-side handler pipeline.
//!
//! Handlers form an ordered chain between sentinel head and tail slots.
//! Membership changes take a lock and republish an immutable snapshot;
//! traversal only reads a snapshot, so a handler mutating the pipeline
//! mid-dispatch affects the next dispatch, not the running one.
//!
//! Every handler invocation happens on the application executor, never on
//! the connection's I/O thread.

use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::warn;

use crate::connection::{Connection, ConnectionEvent};
use crate::error::{Error, ErrorKind, Result};
use crate::message::{InboundMessage, Message};

/// A user-installed message handler.
///
/// The default implementations propagate everything unchanged; a handler
/// that does not call the matching `propagate_*` method terminates
/// propagation for that item.
///
/// Handlers run on the application executor and may block.
#[allow(unused_variables)]
pub trait Handler: Send + Sync + 'static {
    /// The handler was added to a pipeline.
    fn on_added(&self, ctx: &mut Context<'_>) {}

    /// The handler was removed from a pipeline.
    fn on_removed(&self, ctx: &mut Context<'_>) {}

    /// The connection became active, either initially or after a
    /// reconnect.
    fn channel_active(&self, ctx: &mut Context<'_>) {
        ctx.propagate_channel_active();
    }

    /// The connection went inactive.
    fn channel_inactive(&self, ctx: &mut Context<'_>) {
        ctx.propagate_channel_inactive();
    }

    /// An inbound message is traversing the pipeline, head to tail.
    fn on_inbound(&self, ctx: &mut Context<'_>, message: InboundMessage) {
        ctx.propagate_inbound(message);
    }

    /// An outbound message is traversing the pipeline, tail to head.
    fn on_outbound(&self, ctx: &mut Context<'_>, message: Message, promise: WritePromise) {
        ctx.propagate_outbound(message, promise);
    }

    /// A connection event is traversing the pipeline.
    fn on_event(&self, ctx: &mut Context<'_>, event: ConnectionEvent) {
        ctx.propagate_event(event);
    }

    /// An inbound failure is traversing the pipeline.
    fn on_failure(&self, ctx: &mut Context<'_>, error: Arc<Error>) {
        ctx.propagate_failure(error);
    }
}

/// Completion handle for an outbound write.
///
/// Dropping the promise without completing it fails the associated write
/// future as canceled.
pub struct WritePromise {
    tx: Option<oneshot::Sender<Result<()>>>,
}

impl WritePromise {
    pub(crate) fn new(tx: oneshot::Sender<Result<()>>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A promise nobody is waiting on.
    pub(crate) fn discard() -> Self {
        Self { tx: None }
    }

    /// Complete the promise.
    pub fn complete(mut self, result: Result<()>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(result);
        }
    }

    pub(crate) fn into_sender(mut self) -> Option<oneshot::Sender<Result<()>>> {
        self.tx.take()
    }
}

impl fmt::Debug for WritePromise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WritePromise").finish_non_exhaustive()
    }
}

/// Generation-stamped handle to a pipeline slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId {
    index: usize,
    generation: u64,
}

#[derive(Clone)]
struct Entry {
    id: HandlerId,
    name: Arc<str>,
    handler: Arc<dyn Handler>,
}

struct Slot {
    generation: u64,
    name: Option<Arc<str>>,
    handler: Option<Arc<dyn Handler>>,
    prev: usize,
    next: usize,
}

const HEAD: usize = 0;
const TAIL: usize = 1;

struct Slots {
    arena: Vec<Slot>,
    free: Vec<usize>,
    generation: u64,
}

impl Slots {
    fn new() -> Self {
        // Sentinels: the head links forward to the tail and carries no
        // handler.
        let arena = vec![
            Slot {
                generation: 0,
                name: None,
                handler: None,
                prev: HEAD,
                next: TAIL,
            },
            Slot {
                generation: 0,
                name: None,
                handler: None,
                prev: HEAD,
                next: TAIL,
            },
        ];

        Self {
            arena,
            free: Vec::new(),
            generation: 0,
        }
    }

    fn find(&self, name: &str) -> Option<usize> {
        let mut index = self.arena[HEAD].next;

        while index != TAIL {
            let slot = &self.arena[index];

            if slot.name.as_deref() == Some(name) {
                return Some(index);
            }

            index = slot.next;
        }

        None
    }

    fn insert_after(
        &mut self,
        anchor: usize,
        name: &str,
        handler: Arc<dyn Handler>,
    ) -> Result<HandlerId> {
        if self.find(name).is_some() {
            return Err(Error::new(ErrorKind::DuplicateHandler(name.into())));
        }

        self.generation += 1;

        let next = self.arena[anchor].next;

        let slot = Slot {
            generation: self.generation,
            name: Some(Arc::from(name)),
            handler: Some(handler),
            prev: anchor,
            next,
        };

        let index = match self.free.pop() {
            Some(index) => {
                self.arena[index] = slot;
                index
            }
            None => {
                self.arena.push(slot);
                self.arena.len() - 1
            }
        };

        self.arena[anchor].next = index;
        self.arena[next].prev = index;

        Ok(HandlerId {
            index,
            generation: self.generation,
        })
    }

    fn remove(&mut self, index: usize) -> Entry {
        let prev = self.arena[index].prev;
        let next = self.arena[index].next;
        self.arena[prev].next = next;
        self.arena[next].prev = prev;

        let slot = &mut self.arena[index];
        let entry = Entry {
            id: HandlerId {
                index,
                generation: slot.generation,
            },
            name: slot.name.take().unwrap_or_else(|| Arc::from("")),
            handler: slot.handler.take().expect("removing a sentinel"),
        };

        self.free.push(index);
        entry
    }

    fn snapshot(&self) -> Arc<[Entry]> {
        let mut entries = Vec::new();
        let mut index = self.arena[HEAD].next;

        while index != TAIL {
            let slot = &self.arena[index];

            if let (Some(name), Some(handler)) = (&slot.name, &slot.handler) {
                entries.push(Entry {
                    id: HandlerId {
                        index,
                        generation: slot.generation,
                    },
                    name: name.clone(),
                    handler: handler.clone(),
                });
            }

            index = slot.next;
        }

        entries.into()
    }
}

/// The ordered chain of user handlers attached to a connection.
///
/// The pipeline persists across reconnects; handlers observe
/// `channel_inactive` and `channel_active` around an outage.
#[derive(Clone)]
pub struct Pipeline {
    shared: Arc<Shared>,
}

struct Shared {
    slots: Mutex<Slots>,
    snapshot: Mutex<Arc<[Entry]>>,
}

impl Pipeline {
    pub(crate) fn new() -> Self {
        let slots = Slots::new();
        let snapshot = slots.snapshot();

        Self {
            shared: Arc::new(Shared {
                slots: Mutex::new(slots),
                snapshot: Mutex::new(snapshot),
            }),
        }
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut Slots) -> Result<T>) -> Result<T> {
        let mut slots = self.shared.slots.lock().expect("pipeline poisoned");
        let value = f(&mut slots)?;
        *self.shared.snapshot.lock().expect("pipeline poisoned") = slots.snapshot();
        Ok(value)
    }

    fn snapshot(&self) -> Arc<[Entry]> {
        self.shared.snapshot.lock().expect("pipeline poisoned").clone()
    }

    /// Add a handler in front of every other handler.
    pub fn add_first(&self, name: &str, handler: impl Handler) -> Result<HandlerId> {
        let id = self.mutate(|slots| slots.insert_after(HEAD, name, Arc::new(handler)))?;
        self.notify_added(id);
        Ok(id)
    }

    /// Add a handler behind every other handler.
    pub fn add_last(&self, name: &str, handler: impl Handler) -> Result<HandlerId> {
        let id = self.mutate(|slots| {
            let anchor = slots.arena[TAIL].prev;
            slots.insert_after(anchor, name, Arc::new(handler))
        })?;
        self.notify_added(id);
        Ok(id)
    }

    /// Add a handler right before the named one.
    pub fn add_before(&self, anchor: &str, name: &str, handler: impl Handler) -> Result<HandlerId> {
        let id = self.mutate(|slots| {
            let anchor = slots
                .find(anchor)
                .ok_or_else(|| Error::new(ErrorKind::HandlerNotFound(anchor.into())))?;
            let anchor = slots.arena[anchor].prev;
            slots.insert_after(anchor, name, Arc::new(handler))
        })?;
        self.notify_added(id);
        Ok(id)
    }

    /// Add a handler right after the named one.
    pub fn add_after(&self, anchor: &str, name: &str, handler: impl Handler) -> Result<HandlerId> {
        let id = self.mutate(|slots| {
            let anchor = slots
                .find(anchor)
                .ok_or_else(|| Error::new(ErrorKind::HandlerNotFound(anchor.into())))?;
            slots.insert_after(anchor, name, Arc::new(handler))
        })?;
        self.notify_added(id);
        Ok(id)
    }

    /// Remove the named handler.
    pub fn remove(&self, name: &str) -> Result<()> {
        let entry = self.mutate(|slots| {
            let index = slots
                .find(name)
                .ok_or_else(|| Error::new(ErrorKind::HandlerNotFound(name.into())))?;
            Ok(slots.remove(index))
        })?;

        let mut ctx = Context::new(self, None, &entry);
        entry.handler.on_removed(&mut ctx);
        Ok(())
    }

    /// The names of the handlers currently in the pipeline, head first.
    pub fn names(&self) -> Vec<String> {
        self.snapshot()
            .iter()
            .map(|entry| entry.name.to_string())
            .collect()
    }

    /// Invoke `on_added` for a freshly inserted handler.
    pub(crate) fn notify_added(&self, id: HandlerId) {
        let entries = self.snapshot();

        if let Some(entry) = entries.iter().find(|entry| entry.id == id) {
            let mut ctx = Context::new(self, None, entry);
            entry.handler.on_added(&mut ctx);
        }
    }

    /// Run an inbound message through the chain, head to tail.
    pub(crate) fn dispatch_inbound(&self, connection: Option<&Connection>, message: InboundMessage) {
        let entries = self.snapshot();
        let mut message = message;

        for entry in entries.iter() {
            let mut ctx = Context::new(self, connection, entry);
            entry.handler.on_inbound(&mut ctx, message);

            match ctx.outcome.inbound.take() {
                Some(next) => message = next,
                // The handler consumed the message.
                None => return,
            }
        }
    }

    /// Run an outbound message through the chain, tail to head; `sink`
    /// receives whatever makes it past the first handler.
    pub(crate) fn dispatch_outbound(
        &self,
        connection: Option<&Connection>,
        message: Message,
        promise: WritePromise,
        sink: impl FnOnce(Message, WritePromise),
    ) {
        let entries = self.snapshot();
        let mut item = (message, promise);

        for entry in entries.iter().rev() {
            let mut ctx = Context::new(self, connection, entry);
            entry.handler.on_outbound(&mut ctx, item.0, item.1);

            match ctx.outcome.outbound.take() {
                Some(next) => item = next,
                None => return,
            }
        }

        sink(item.0, item.1);
    }

    /// Run a connection event through the chain, head to tail.
    pub(crate) fn dispatch_event(&self, connection: Option<&Connection>, event: ConnectionEvent) {
        let entries = self.snapshot();
        let mut event = event;

        for entry in entries.iter() {
            let mut ctx = Context::new(self, connection, entry);
            entry.handler.on_event(&mut ctx, event);

            match ctx.outcome.event.take() {
                Some(next) => event = next,
                None => return,
            }
        }
    }

    /// Run an inbound failure through the chain, head to tail.
    pub(crate) fn dispatch_failure(&self, connection: Option<&Connection>, error: Arc<Error>) {
        let entries = self.snapshot();
        let mut error = error;

        for entry in entries.iter() {
            let mut ctx = Context::new(self, connection, entry);
            entry.handler.on_failure(&mut ctx, error);

            match ctx.outcome.failure.take() {
                Some(next) => error = next,
                None => return,
            }
        }

        warn!(%error, "inbound failure reached the pipeline tail");
    }

    /// Deliver a channel lifecycle edge, head to tail.
    pub(crate) fn dispatch_channel_active(&self, connection: Option<&Connection>, active: bool) {
        let entries = self.snapshot();

        for entry in entries.iter() {
            let mut ctx = Context::new(self, connection, entry);

            if active {
                entry.handler.channel_active(&mut ctx);
            } else {
                entry.handler.channel_inactive(&mut ctx);
            }

            if !ctx.outcome.lifecycle {
                return;
            }
        }
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("handlers", &self.names())
            .finish()
    }
}

#[derive(Default)]
struct Outcome {
    inbound: Option<InboundMessage>,
    outbound: Option<(Message, WritePromise)>,
    event: Option<ConnectionEvent>,
    failure: Option<Arc<Error>>,
    lifecycle: bool,
}

/// Per-invocation view handed to a [`Handler`].
pub struct Context<'a> {
    pipeline: &'a Pipeline,
    connection: Option<&'a Connection>,
    name: &'a str,
    outcome: Outcome,
}

impl<'a> Context<'a> {
    fn new(pipeline: &'a Pipeline, connection: Option<&'a Connection>, entry: &'a Entry) -> Self {
        Self {
            pipeline,
            connection,
            name: entry.name.as_ref(),
            outcome: Outcome::default(),
        }
    }

    /// The name this handler was registered under.
    #[inline]
    pub fn name(&self) -> &str {
        self.name
    }

    /// The pipeline the handler belongs to.
    #[inline]
    pub fn pipeline(&self) -> &Pipeline {
        self.pipeline
    }

    /// The connection the pipeline is attached to.
    ///
    /// `None` only during handler add/remove notifications that happen
    /// outside a connection dispatch.
    #[inline]
    pub fn connection(&self) -> Option<&Connection> {
        self.connection
    }

    /// Pass the inbound message on to the next handler.
    pub fn propagate_inbound(&mut self, message: InboundMessage) {
        self.outcome.inbound = Some(message);
    }

    /// Pass the outbound message on towards the transport.
    pub fn propagate_outbound(&mut self, message: Message, promise: WritePromise) {
        self.outcome.outbound = Some((message, promise));
    }

    /// Pass the event on to the next handler.
    pub fn propagate_event(&mut self, event: ConnectionEvent) {
        self.outcome.event = Some(event);
    }

    /// Pass the failure on to the next handler.
    pub fn propagate_failure(&mut self, error: Arc<Error>) {
        self.outcome.failure = Some(error);
    }

    /// Pass `channel_active` on to the next handler.
    pub fn propagate_channel_active(&mut self) {
        self.outcome.lifecycle = true;
    }

    /// Pass `channel_inactive` on to the next handler.
    pub fn propagate_channel_inactive(&mut self) {
        self.outcome.lifecycle = true;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        log: Arc<StdMutex<Vec<String>>>,
        tag: String,
        consume: bool,
    }

    impl Recorder {
        fn new(log: &Arc<StdMutex<Vec<String>>>, tag: &str) -> Self {
            Self {
                log: log.clone(),
                tag: tag.into(),
                consume: false,
            }
        }

        fn consuming(log: &Arc<StdMutex<Vec<String>>>, tag: &str) -> Self {
            Self {
                log: log.clone(),
                tag: tag.into(),
                consume: true,
            }
        }
    }

    impl Handler for Recorder {
        fn on_inbound(&self, ctx: &mut Context<'_>, message: InboundMessage) {
            self.log.lock().unwrap().push(self.tag.clone());

            if !self.consume {
                ctx.propagate_inbound(message);
            }
        }

        fn on_outbound(&self, ctx: &mut Context<'_>, message: Message, promise: WritePromise) {
            self.log.lock().unwrap().push(self.tag.clone());
            ctx.propagate_outbound(message, promise);
        }
    }

    fn inbound() -> InboundMessage {
        use std::num::NonZeroU32;

        use crate::message::MessageKind;
        use crate::object_path::ObjectPath;
        use crate::proto::Flags;

        InboundMessage {
            serial: NonZeroU32::new(1).unwrap(),
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
    fn insertion_order() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let pipeline = Pipeline::new();

        pipeline.add_last("b", Recorder::new(&log, "b")).unwrap();
        pipeline.add_first("a", Recorder::new(&log, "a")).unwrap();
        pipeline.add_last("d", Recorder::new(&log, "d")).unwrap();
        pipeline
            .add_before("d", "c", Recorder::new(&log, "c"))
            .unwrap();
        pipeline
            .add_after("a", "a2", Recorder::new(&log, "a2"))
            .unwrap();

        assert_eq!(pipeline.names(), ["a", "a2", "b", "c", "d"]);

        pipeline.dispatch_inbound(None, inbound());
        assert_eq!(*log.lock().unwrap(), ["a", "a2", "b", "c", "d"]);
    }

    #[test]
    fn outbound_traverses_in_reverse() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let pipeline = Pipeline::new();

        pipeline.add_last("a", Recorder::new(&log, "a")).unwrap();
        pipeline.add_last("b", Recorder::new(&log, "b")).unwrap();

        let message = Message::method_return(std::num::NonZeroU32::new(1).unwrap());
        let delivered = Arc::new(AtomicUsize::new(0));
        let sink_count = delivered.clone();

        pipeline.dispatch_outbound(None, message, WritePromise::discard(), move |_, _| {
            sink_count.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(*log.lock().unwrap(), ["b", "a"]);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn consuming_handler_stops_propagation() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let pipeline = Pipeline::new();

        pipeline.add_last("a", Recorder::new(&log, "a")).unwrap();
        pipeline
            .add_last("stop", Recorder::consuming(&log, "stop"))
            .unwrap();
        pipeline.add_last("c", Recorder::new(&log, "c")).unwrap();

        pipeline.dispatch_inbound(None, inbound());
        assert_eq!(*log.lock().unwrap(), ["a", "stop"]);
    }

    #[test]
    fn duplicate_and_missing_names() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let pipeline = Pipeline::new();

        pipeline.add_last("a", Recorder::new(&log, "a")).unwrap();

        assert!(matches!(
            pipeline
                .add_last("a", Recorder::new(&log, "dup"))
                .unwrap_err()
                .kind(),
            ErrorKind::DuplicateHandler(..)
        ));
        assert!(matches!(
            pipeline
                .add_before("nope", "x", Recorder::new(&log, "x"))
                .unwrap_err()
                .kind(),
            ErrorKind::HandlerNotFound(..)
        ));
        assert!(matches!(
            pipeline.remove("nope").unwrap_err().kind(),
            ErrorKind::HandlerNotFound(..)
        ));

        pipeline.remove("a").unwrap();
        assert!(pipeline.names().is_empty());
    }

    #[test]
    fn slot_reuse_bumps_generation() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let pipeline = Pipeline::new();

        let first = pipeline.add_last("a", Recorder::new(&log, "a")).unwrap();
        pipeline.remove("a").unwrap();
        let second = pipeline.add_last("b", Recorder::new(&log, "b")).unwrap();

        // The slot is reused, the stamp is not.
        assert_ne!(first, second);
    }

    #[test]
    fn traversal_uses_a_snapshot() {
        struct SelfRemover;

        impl Handler for SelfRemover {
            fn on_inbound(&self, ctx: &mut Context<'_>, message: InboundMessage) {
                ctx.pipeline().remove("remover").unwrap();
                ctx.propagate_inbound(message);
            }
        }

        let log = Arc::new(StdMutex::new(Vec::new()));
        let pipeline = Pipeline::new();

        pipeline.add_last("remover", SelfRemover).unwrap();
        pipeline.add_last("after", Recorder::new(&log, "after")).unwrap();

        // The running traversal still sees the full snapshot.
        pipeline.dispatch_inbound(None, inbound());
        assert_eq!(*log.lock().unwrap(), ["after"]);
        assert_eq!(pipeline.names(), ["after"]);
    }
}

//! The I/O-side pipeline: an ordered chain of stages between the
//! transport and the bridge.
//!
//! Inbound items flow head to tail (bytes, frames, then messages);
//! outbound items flow tail to head. Stages are synchronous state
//! machines invoked on the I/O executor, and never run user code.

pub(crate) use self::driver::{Driver, DriverExit};
mod driver;

pub(crate) use self::frame_stage::FrameStage;
mod frame_stage;

pub(crate) use self::hello_stage::HelloStage;
mod hello_stage;

pub(crate) use self::message_stage::MessageStage;
mod message_stage;

pub(crate) use self::sasl_stage::SaslStage;
mod sasl_stage;

use std::collections::VecDeque;
use std::num::NonZeroU32;

use tracing::trace;

use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::message::{InboundMessage, Message};

/// An item traversing the I/O pipeline.
#[derive(Debug)]
pub(crate) enum IoItem {
    /// Raw transport bytes.
    Bytes(Vec<u8>),
    /// A whole frame.
    Frame(Frame),
    /// A decoded inbound message.
    Message(InboundMessage),
    /// An outbound message with its assigned serial.
    Outbound {
        message: Message,
        serial: NonZeroU32,
    },
}

/// Events broadcast through the I/O pipeline.
#[derive(Debug, Clone)]
pub(crate) enum IoEvent {
    /// The initial NUL byte went out.
    SaslNulSent,
    /// Authentication concluded; the stream is now framed.
    SaslAuthComplete { guid: Box<str> },
    /// Authentication failed terminally.
    SaslAuthFailed,
    /// The bus assigned our unique name.
    MandatoryNameAcquired(Box<str>),
    /// The Hello exchange failed.
    MandatoryNameAcquisitionFailed,
    /// A reconnect attempt is starting; per-connection state was reset.
    ReconnectionStarting,
    /// Handshake stages were installed again for the new transport.
    ReconnectionHandlersReaddRequired,
}

/// Per-invocation action collector handed to a stage hook.
#[derive(Default)]
pub(crate) struct IoContext {
    inbound: Vec<IoItem>,
    outbound: Vec<IoItem>,
    events: Vec<IoEvent>,
    failures: Vec<Error>,
    remove_self: bool,
}

impl IoContext {
    /// Forward an item towards the tail (the bridge).
    pub(crate) fn forward_inbound(&mut self, item: IoItem) {
        self.inbound.push(item);
    }

    /// Forward an item towards the head (the transport).
    pub(crate) fn forward_outbound(&mut self, item: IoItem) {
        self.outbound.push(item);
    }

    /// Broadcast an event through the pipeline and to the driver.
    pub(crate) fn fire_event(&mut self, event: IoEvent) {
        self.events.push(event);
    }

    /// Report a non-fatal inbound failure.
    pub(crate) fn fail(&mut self, error: Error) {
        self.failures.push(error);
    }

    /// Ask for this stage to be removed once the current feed completes.
    pub(crate) fn remove_self(&mut self) {
        self.remove_self = true;
    }
}

/// A single stage of the I/O pipeline.
#[allow(unused_variables)]
pub(crate) trait IoStage: Send {
    fn name(&self) -> &'static str;

    /// The transport became active.
    fn on_active(&mut self, ctx: &mut IoContext) -> Result<()> {
        Ok(())
    }

    /// The transport went away.
    fn on_inactive(&mut self, ctx: &mut IoContext) -> Result<()> {
        Ok(())
    }

    /// An inbound item arrived from the previous stage.
    fn on_inbound(&mut self, ctx: &mut IoContext, item: IoItem) -> Result<()> {
        ctx.forward_inbound(item);
        Ok(())
    }

    /// An outbound item arrived from the next stage.
    fn on_outbound(&mut self, ctx: &mut IoContext, item: IoItem) -> Result<()> {
        ctx.forward_outbound(item);
        Ok(())
    }

    /// An event is being broadcast.
    fn on_event(&mut self, ctx: &mut IoContext, event: &IoEvent) -> Result<()> {
        Ok(())
    }

    /// The stage is being removed from the pipeline.
    fn on_removed(&mut self, ctx: &mut IoContext) -> Result<()> {
        Ok(())
    }
}

/// Everything a feed produced once the pipeline settled.
#[derive(Default)]
pub(crate) struct IoOutput {
    /// Messages that traversed past the tail.
    pub(crate) messages: Vec<InboundMessage>,
    /// Bytes that traversed past the head.
    pub(crate) write: Vec<u8>,
    /// Events, after every stage saw them.
    pub(crate) events: Vec<IoEvent>,
    /// Non-fatal inbound failures.
    pub(crate) failures: Vec<Error>,
}

impl IoOutput {
    fn merge_context(&mut self, index: usize, ctx: IoContext, queue: &mut VecDeque<Job>) {
        for item in ctx.inbound {
            queue.push_back(Job::Inbound {
                index: index + 1,
                item,
            });
        }

        for item in ctx.outbound {
            queue.push_back(Job::Outbound {
                index: index.checked_sub(1),
                item,
            });
        }

        for event in ctx.events {
            queue.push_back(Job::Event { event });
        }

        self.failures.extend(ctx.failures);
    }
}

enum Job {
    Inbound { index: usize, item: IoItem },
    /// `None` means past the head, towards the transport.
    Outbound { index: Option<usize>, item: IoItem },
    Event { event: IoEvent },
}

/// The ordered chain of I/O stages.
pub(crate) struct IoPipeline {
    stages: Vec<Box<dyn IoStage>>,
}

impl IoPipeline {
    pub(crate) fn new(stages: Vec<Box<dyn IoStage>>) -> Self {
        Self { stages }
    }

    /// Activate every stage, head to tail.
    pub(crate) fn activate(&mut self) -> Result<IoOutput> {
        let mut queue = VecDeque::new();
        let mut output = IoOutput::default();

        for index in 0..self.stages.len() {
            let mut ctx = IoContext::default();
            let result = self.stages[index].on_active(&mut ctx);
            let remove = ctx.remove_self;
            output.merge_context(index, ctx, &mut queue);
            result?;
            debug_assert!(!remove, "stage removed itself during activation");
        }

        self.run(queue, output)
    }

    /// Deactivate every stage, tail to head.
    pub(crate) fn deactivate(&mut self) -> Result<IoOutput> {
        let mut queue = VecDeque::new();
        let mut output = IoOutput::default();

        for index in (0..self.stages.len()).rev() {
            let mut ctx = IoContext::default();
            let result = self.stages[index].on_inactive(&mut ctx);
            output.merge_context(index, ctx, &mut queue);
            result?;
        }

        self.run(queue, output)
    }

    /// Feed transport bytes into the head of the pipeline.
    pub(crate) fn feed_inbound(&mut self, item: IoItem) -> Result<IoOutput> {
        let mut queue = VecDeque::new();
        queue.push_back(Job::Inbound { index: 0, item });
        self.run(queue, IoOutput::default())
    }

    /// Feed an outbound item into the tail of the pipeline.
    pub(crate) fn feed_outbound(&mut self, item: IoItem) -> Result<IoOutput> {
        let mut queue = VecDeque::new();
        queue.push_back(Job::Outbound {
            index: self.stages.len().checked_sub(1),
            item,
        });
        self.run(queue, IoOutput::default())
    }

    /// Broadcast an event into the pipeline.
    pub(crate) fn fire_event(&mut self, event: IoEvent) -> Result<IoOutput> {
        let mut queue = VecDeque::new();
        queue.push_back(Job::Event { event });
        self.run(queue, IoOutput::default())
    }

    fn run(&mut self, mut queue: VecDeque<Job>, mut output: IoOutput) -> Result<IoOutput> {
        let mut removals = Vec::new();

        while let Some(job) = queue.pop_front() {
            match job {
                Job::Inbound { index, item } => {
                    if index >= self.stages.len() {
                        match item {
                            IoItem::Message(message) => output.messages.push(message),
                            other => trace!(?other, "item dropped at pipeline tail"),
                        }

                        continue;
                    }

                    let mut ctx = IoContext::default();
                    let result = self.stages[index].on_inbound(&mut ctx, item);

                    if ctx.remove_self && !removals.contains(&index) {
                        removals.push(index);
                    }

                    output.merge_context(index, ctx, &mut queue);
                    result?;
                }
                Job::Outbound { index, item } => {
                    let Some(index) = index else {
                        match item {
                            IoItem::Bytes(bytes) => output.write.extend_from_slice(&bytes),
                            other => trace!(?other, "item dropped at pipeline head"),
                        }

                        continue;
                    };

                    let mut ctx = IoContext::default();
                    let result = self.stages[index].on_outbound(&mut ctx, item);

                    if ctx.remove_self && !removals.contains(&index) {
                        removals.push(index);
                    }

                    output.merge_context(index, ctx, &mut queue);
                    result?;
                }
                Job::Event { event } => {
                    for index in 0..self.stages.len() {
                        let mut ctx = IoContext::default();
                        let result = self.stages[index].on_event(&mut ctx, &event);

                        if ctx.remove_self && !removals.contains(&index) {
                            removals.push(index);
                        }

                        output.merge_context(index, ctx, &mut queue);
                        result?;
                    }

                    output.events.push(event);
                }
            }
        }

        // Apply removals only once the feed settled so queued jobs kept
        // their stage indices.
        removals.sort_unstable_by(|a, b| b.cmp(a));

        for index in removals {
            let mut stage = self.stages.remove(index);
            let mut ctx = IoContext::default();
            let _ = stage.on_removed(&mut ctx);
            output.events.extend(ctx.events);
            trace!(stage = stage.name(), "stage removed from i/o pipeline");
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Doubles every byte on the way in, halves on the way out.
    struct Doubler;

    impl IoStage for Doubler {
        fn name(&self) -> &'static str {
            "doubler"
        }

        fn on_inbound(&mut self, ctx: &mut IoContext, item: IoItem) -> Result<()> {
            if let IoItem::Bytes(bytes) = item {
                let doubled = bytes.iter().flat_map(|&b| [b, b]).collect();
                ctx.forward_inbound(IoItem::Bytes(doubled));
            }

            Ok(())
        }
    }

    struct TailRecorder {
        seen: Vec<Vec<u8>>,
    }

    impl IoStage for TailRecorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        fn on_inbound(&mut self, ctx: &mut IoContext, item: IoItem) -> Result<()> {
            if let IoItem::Bytes(bytes) = item {
                self.seen.push(bytes.clone());
                ctx.forward_inbound(IoItem::Bytes(bytes));
            }

            Ok(())
        }
    }

    struct RemoveOnFirstInbound;

    impl IoStage for RemoveOnFirstInbound {
        fn name(&self) -> &'static str {
            "once"
        }

        fn on_inbound(&mut self, ctx: &mut IoContext, item: IoItem) -> Result<()> {
            ctx.remove_self();
            ctx.forward_inbound(item);
            Ok(())
        }
    }

    #[test]
    fn inbound_transforms_through_stages() {
        let mut pipeline = IoPipeline::new(vec![
            Box::new(Doubler),
            Box::new(TailRecorder { seen: Vec::new() }),
        ]);

        let output = pipeline
            .feed_inbound(IoItem::Bytes(vec![1, 2]))
            .unwrap();

        // Non-message items are dropped at the tail.
        assert!(output.messages.is_empty());
    }

    #[test]
    fn outbound_bytes_reach_the_head() {
        let mut pipeline = IoPipeline::new(vec![Box::new(Doubler)]);

        let output = pipeline
            .feed_outbound(IoItem::Bytes(vec![9, 9]))
            .unwrap();

        // The doubler passes outbound items through by default.
        assert_eq!(output.write, vec![9, 9]);
    }

    #[test]
    fn stage_removal_applies_after_the_feed() {
        let mut pipeline = IoPipeline::new(vec![
            Box::new(RemoveOnFirstInbound),
            Box::new(Doubler),
        ]);

        pipeline.feed_inbound(IoItem::Bytes(vec![1])).unwrap();
        assert_eq!(pipeline.stages.len(), 1);
        assert_eq!(pipeline.stages[0].name(), "doubler");
    }

    #[test]
    fn events_reach_the_driver() {
        let mut pipeline = IoPipeline::new(vec![Box::new(Doubler)]);

        let output = pipeline.fire_event(IoEvent::SaslNulSent).unwrap();
        assert!(matches!(output.events[..], [IoEvent::SaslNulSent]));
    }
}

use tracing::warn;

use crate::error::Result;
use crate::frame::Frame;
use crate::io::{IoContext, IoItem, IoStage};
use crate::proto::Endianness;

/// Translates between frames and typed messages.
pub(crate) struct MessageStage {
    endianness: Endianness,
}

impl MessageStage {
    pub(crate) fn new() -> Self {
        Self {
            endianness: Endianness::NATIVE,
        }
    }
}

impl IoStage for MessageStage {
    fn name(&self) -> &'static str {
        "message-codec"
    }

    fn on_inbound(&mut self, ctx: &mut IoContext, item: IoItem) -> Result<()> {
        let IoItem::Frame(frame) = item else {
            ctx.forward_inbound(item);
            return Ok(());
        };

        match frame.into_message() {
            Ok(Some(message)) => ctx.forward_inbound(IoItem::Message(message)),
            // A frame of an unknown message type, ignored by protocol rule.
            Ok(None) => {}
            Err(error) if error.is_fatal() => return Err(error),
            Err(error) => {
                warn!(%error, "dropping undecodable message");
                ctx.fail(error);
            }
        }

        Ok(())
    }

    fn on_outbound(&mut self, ctx: &mut IoContext, item: IoItem) -> Result<()> {
        let IoItem::Outbound { message, serial } = item else {
            ctx.forward_outbound(item);
            return Ok(());
        };

        let frame = Frame::from_message(&message, serial, self.endianness)?;
        ctx.forward_outbound(IoItem::Frame(frame));
        Ok(())
    }
}

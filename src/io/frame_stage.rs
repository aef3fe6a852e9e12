use tracing::warn;

use crate::error::Result;
use crate::frame::Frame;
use crate::io::{IoContext, IoItem, IoStage};

/// Accumulates transport bytes into whole frames, and flattens outbound
/// frames back into bytes.
pub(crate) struct FrameStage {
    acc: Vec<u8>,
}

impl FrameStage {
    pub(crate) fn new() -> Self {
        Self { acc: Vec::new() }
    }
}

impl IoStage for FrameStage {
    fn name(&self) -> &'static str {
        "frame-codec"
    }

    fn on_inbound(&mut self, ctx: &mut IoContext, item: IoItem) -> Result<()> {
        let IoItem::Bytes(bytes) = item else {
            ctx.forward_inbound(item);
            return Ok(());
        };

        self.acc.extend_from_slice(&bytes);

        loop {
            // A framing error here is unrecoverable: without a trusted
            // length there is no way to resynchronize the stream.
            let Some(needed) = Frame::needed_len(&self.acc)? else {
                break;
            };

            if self.acc.len() < needed {
                break;
            }

            let rest = self.acc.split_off(needed);
            let raw = std::mem::replace(&mut self.acc, rest);

            match Frame::decode(&raw) {
                Ok(frame) => ctx.forward_inbound(IoItem::Frame(frame)),
                Err(error) if error.is_fatal() => return Err(error),
                Err(error) => {
                    // The frame boundary is known, so one bad frame can be
                    // skipped without losing the stream.
                    warn!(%error, "dropping undecodable frame");
                    ctx.fail(error);
                }
            }
        }

        Ok(())
    }

    fn on_outbound(&mut self, ctx: &mut IoContext, item: IoItem) -> Result<()> {
        let IoItem::Frame(frame) = item else {
            ctx.forward_outbound(item);
            return Ok(());
        };

        ctx.forward_outbound(IoItem::Bytes(frame.encode()?));
        Ok(())
    }
}

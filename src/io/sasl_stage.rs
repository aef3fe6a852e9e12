use tracing::debug;

use crate::error::Result;
use crate::io::{IoContext, IoEvent, IoItem, IoStage};
use crate::sasl::SaslClient;

/// Drives the SASL dialogue over the raw byte stream.
///
/// The stage consumes every inbound byte until authentication concludes,
/// then forwards whatever followed the final server line and removes
/// itself; from that point on the stream is pure framing.
pub(crate) struct SaslStage {
    client: SaslClient,
    buf: Vec<u8>,
    done: bool,
}

impl SaslStage {
    pub(crate) fn new(client: SaslClient) -> Self {
        Self {
            client,
            buf: Vec::new(),
            done: false,
        }
    }
}

impl IoStage for SaslStage {
    fn name(&self) -> &'static str {
        "sasl"
    }

    fn on_active(&mut self, ctx: &mut IoContext) -> Result<()> {
        ctx.forward_outbound(IoItem::Bytes(vec![0]));
        ctx.fire_event(IoEvent::SaslNulSent);

        let auth = self.client.auth_line()?;
        ctx.forward_outbound(IoItem::Bytes(auth));
        Ok(())
    }

    fn on_inbound(&mut self, ctx: &mut IoContext, item: IoItem) -> Result<()> {
        let IoItem::Bytes(bytes) = item else {
            ctx.forward_inbound(item);
            return Ok(());
        };

        if self.done {
            ctx.forward_inbound(IoItem::Bytes(bytes));
            return Ok(());
        }

        self.buf.extend_from_slice(&bytes);

        while let Some(end) = self.buf.iter().position(|&b| b == b'\n') {
            let rest = self.buf.split_off(end + 1);
            let line = std::mem::replace(&mut self.buf, rest);

            let output = match self.client.handle_line(&line) {
                Ok(output) => output,
                Err(error) => {
                    ctx.fire_event(IoEvent::SaslAuthFailed);
                    return Err(error);
                }
            };

            for line in output.send {
                ctx.forward_outbound(IoItem::Bytes(line));
            }

            if let Some(guid) = output.done {
                debug!(guid = guid.as_ref(), "sasl authentication complete");
                self.done = true;
                ctx.fire_event(IoEvent::SaslAuthComplete { guid });
                ctx.remove_self();

                // Anything already buffered past the final line is framed
                // data for the next stage.
                if !self.buf.is_empty() {
                    ctx.forward_inbound(IoItem::Bytes(std::mem::take(&mut self.buf)));
                }

                break;
            }
        }

        Ok(())
    }
}

use std::num::NonZeroU32;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::bridge::Serials;
use crate::error::{Error, ErrorKind, Result};
use crate::fdo;
use crate::io::{IoContext, IoEvent, IoItem, IoStage};
use crate::message::{Message, MessageKind};
use crate::object_path::ObjectPath;
use crate::value::Value;

/// Sends the mandatory `Hello` call once authentication completes and
/// watches for its reply, which carries the unique bus name.
///
/// The reply never reaches the bridge; everything else passes through.
pub(crate) struct HelloStage {
    serials: Arc<Serials>,
    serial: Option<NonZeroU32>,
}

impl HelloStage {
    pub(crate) fn new(serials: Arc<Serials>) -> Self {
        Self {
            serials,
            serial: None,
        }
    }

    fn hello(&self) -> Result<Message> {
        Ok(
            Message::method_call(ObjectPath::new_unchecked(fdo::PATH), fdo::HELLO)?
                .with_interface(fdo::INTERFACE)?
                .with_destination(fdo::DESTINATION)?,
        )
    }
}

impl IoStage for HelloStage {
    fn name(&self) -> &'static str {
        "hello"
    }

    fn on_event(&mut self, ctx: &mut IoContext, event: &IoEvent) -> Result<()> {
        if !matches!(event, IoEvent::SaslAuthComplete { .. }) {
            return Ok(());
        }

        let serial = self.serials.next();
        self.serial = Some(serial);
        debug!(serial = serial.get(), "sending Hello");

        ctx.forward_outbound(IoItem::Outbound {
            message: self.hello()?,
            serial,
        });

        Ok(())
    }

    fn on_inbound(&mut self, ctx: &mut IoContext, item: IoItem) -> Result<()> {
        let IoItem::Message(message) = item else {
            ctx.forward_inbound(item);
            return Ok(());
        };

        let Some(serial) = self.serial else {
            ctx.forward_inbound(IoItem::Message(message));
            return Ok(());
        };

        if message.reply_serial() != Some(serial) {
            ctx.forward_inbound(IoItem::Message(message));
            return Ok(());
        }

        match message.kind() {
            MessageKind::MethodReturn { .. } => match message.body().first() {
                Some(Value::String(name)) => {
                    debug!(name = name.as_str(), "unique bus name acquired");
                    self.serial = None;
                    ctx.fire_event(IoEvent::MandatoryNameAcquired(name.as_str().into()));
                    Ok(())
                }
                _ => {
                    ctx.fire_event(IoEvent::MandatoryNameAcquisitionFailed);
                    Err(Error::new(ErrorKind::InvalidMessageField("body")))
                }
            },
            MessageKind::Error { error_name, .. } => {
                warn!(error_name = error_name.as_str(), "Hello failed");
                ctx.fire_event(IoEvent::MandatoryNameAcquisitionFailed);
                Err(message.into_remote_error())
            }
            _ => {
                ctx.forward_inbound(IoItem::Message(message));
                Ok(())
            }
        }
    }
}

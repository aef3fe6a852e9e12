//! Typed D-Bus messages.
//!
//! [`Message`] is the outbound form constructed by callers; an
//! [`InboundMessage`] is what the connection hands back after parsing a
//! frame. Both share the closed [`MessageKind`] sum.

use std::num::NonZeroU32;
use std::time::Duration;

use crate::error::{Error, ErrorKind, Result};
use crate::object_path::ObjectPath;
use crate::proto::{Flags, MessageType};
use crate::signature::Signature;
use crate::value::Value;

/// The kind of a message, crossed with the kind-specific fields.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageKind {
    /// A method call addressed to a path and member.
    MethodCall {
        /// The object to send the call to.
        path: ObjectPath,
        /// The name of the method.
        member: String,
        /// The interface the method belongs to. Optional on calls.
        interface: Option<String>,
    },
    /// A reply carrying returned data.
    MethodReturn {
        /// Serial of the call this replies to.
        reply_serial: NonZeroU32,
    },
    /// An error reply.
    Error {
        /// The name of the error that occurred.
        error_name: String,
        /// Serial of the call this replies to.
        reply_serial: NonZeroU32,
    },
    /// A signal emission.
    Signal {
        /// The object the signal is emitted from.
        path: ObjectPath,
        /// The interface the signal belongs to. Required on signals.
        interface: String,
        /// The name of the signal.
        member: String,
    },
}

impl MessageKind {
    pub(crate) fn message_type(&self) -> MessageType {
        match self {
            MessageKind::MethodCall { .. } => MessageType::METHOD_CALL,
            MessageKind::MethodReturn { .. } => MessageType::METHOD_RETURN,
            MessageKind::Error { .. } => MessageType::ERROR,
            MessageKind::Signal { .. } => MessageType::SIGNAL,
        }
    }
}

pub(crate) fn validate_name(field: &'static str, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::new(ErrorKind::InvalidMessageField(field)));
    }

    Ok(())
}

/// An outbound D-Bus message.
///
/// The serial is assigned by the connection right before the message is
/// encoded; a caller-provided serial is kept as-is.
///
/// # Examples
///
/// ```
/// use pipebus::{Message, ObjectPath, Value};
///
/// let m = Message::method_call(ObjectPath::new("/com/example/Player")?, "Seek")?
///     .with_interface("com.example.Player")?
///     .with_destination("com.example.player")?
///     .with_body(vec![Value::Int64(5_000_000)]);
/// # Ok::<_, anyhow::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub(crate) serial: Option<NonZeroU32>,
    pub(crate) flags: Flags,
    pub(crate) kind: MessageKind,
    pub(crate) destination: Option<String>,
    pub(crate) body: Vec<Value>,
    pub(crate) timeout: Option<Duration>,
}

impl Message {
    fn new(kind: MessageKind) -> Self {
        Self {
            serial: None,
            flags: Flags::EMPTY,
            kind,
            destination: None,
            body: Vec::new(),
            timeout: None,
        }
    }

    /// Construct a method call.
    pub fn method_call(path: ObjectPath, member: impl Into<String>) -> Result<Self> {
        let member = member.into();
        validate_name("member", &member)?;

        Ok(Self::new(MessageKind::MethodCall {
            path,
            member,
            interface: None,
        }))
    }

    /// Construct a method return replying to `reply_serial`.
    pub fn method_return(reply_serial: NonZeroU32) -> Self {
        Self::new(MessageKind::MethodReturn { reply_serial })
    }

    /// Construct an error replying to `reply_serial`.
    pub fn error(error_name: impl Into<String>, reply_serial: NonZeroU32) -> Result<Self> {
        let error_name = error_name.into();
        validate_name("error_name", &error_name)?;

        Ok(Self::new(MessageKind::Error {
            error_name,
            reply_serial,
        }))
    }

    /// Construct a signal. The interface is required.
    pub fn signal(
        path: ObjectPath,
        interface: impl Into<String>,
        member: impl Into<String>,
    ) -> Result<Self> {
        let interface = interface.into();
        let member = member.into();
        validate_name("interface", &interface)?;
        validate_name("member", &member)?;

        Ok(Self::new(MessageKind::Signal {
            path,
            interface,
            member,
        }))
    }

    /// Set the interface of a method call.
    pub fn with_interface(mut self, interface: impl Into<String>) -> Result<Self> {
        let interface = interface.into();
        validate_name("interface", &interface)?;

        match &mut self.kind {
            MessageKind::MethodCall {
                interface: slot, ..
            } => {
                *slot = Some(interface);
                Ok(self)
            }
            _ => Err(Error::new(ErrorKind::InvalidMessageField("interface"))),
        }
    }

    /// Set the destination bus name.
    pub fn with_destination(mut self, destination: impl Into<String>) -> Result<Self> {
        let destination = destination.into();
        validate_name("destination", &destination)?;
        self.destination = Some(destination);
        Ok(self)
    }

    /// Replace the body of the message.
    #[must_use]
    pub fn with_body(mut self, body: Vec<Value>) -> Self {
        self.body = body;
        self
    }

    /// Replace the flags of the message.
    #[must_use]
    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    /// Mark the method call as not expecting a reply.
    #[must_use]
    pub fn with_no_reply(mut self) -> Self {
        self.flags = self.flags | Flags::NO_REPLY_EXPECTED;
        self
    }

    /// Override the reply deadline for this call only.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Pin the message serial instead of letting the connection assign one.
    #[must_use]
    pub fn with_serial(mut self, serial: NonZeroU32) -> Self {
        self.serial = Some(serial);
        self
    }

    /// The kind of the message.
    #[inline]
    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }

    /// The flags of the message.
    #[inline]
    pub fn flags(&self) -> Flags {
        self.flags
    }

    /// The destination of the message, if any.
    #[inline]
    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    /// The body values of the message.
    #[inline]
    pub fn body(&self) -> &[Value] {
        &self.body
    }

    /// Whether a reply is expected for this message.
    pub fn reply_expected(&self) -> bool {
        matches!(self.kind, MessageKind::MethodCall { .. })
            && !(self.flags & Flags::NO_REPLY_EXPECTED)
    }

    /// The per-call timeout override, if any.
    #[inline]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// A message received from the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub(crate) serial: NonZeroU32,
    pub(crate) flags: Flags,
    pub(crate) kind: MessageKind,
    pub(crate) sender: Option<String>,
    pub(crate) destination: Option<String>,
    pub(crate) signature: Option<Signature>,
    pub(crate) body: Vec<Value>,
}

impl InboundMessage {
    /// The serial of the message.
    #[inline]
    pub fn serial(&self) -> NonZeroU32 {
        self.serial
    }

    /// The flags of the message.
    #[inline]
    pub fn flags(&self) -> Flags {
        self.flags
    }

    /// The kind of the message.
    #[inline]
    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }

    /// The unique name of the sending connection, filled in by the bus.
    #[inline]
    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    /// The destination of the message, if any.
    #[inline]
    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    /// The signature describing the body, if a body is present.
    #[inline]
    pub fn signature(&self) -> Option<&Signature> {
        self.signature.as_ref()
    }

    /// The body values of the message.
    #[inline]
    pub fn body(&self) -> &[Value] {
        &self.body
    }

    /// The serial this message replies to, for returns and errors.
    pub fn reply_serial(&self) -> Option<NonZeroU32> {
        match self.kind {
            MessageKind::MethodReturn { reply_serial } => Some(reply_serial),
            MessageKind::Error { reply_serial, .. } => Some(reply_serial),
            _ => None,
        }
    }

    /// The member name, for calls and signals.
    pub fn member(&self) -> Option<&str> {
        match &self.kind {
            MessageKind::MethodCall { member, .. } => Some(member),
            MessageKind::Signal { member, .. } => Some(member),
            _ => None,
        }
    }

    /// The interface name, where present.
    pub fn interface(&self) -> Option<&str> {
        match &self.kind {
            MessageKind::MethodCall { interface, .. } => interface.as_deref(),
            MessageKind::Signal { interface, .. } => Some(interface),
            _ => None,
        }
    }

    /// The object path, for calls and signals.
    pub fn path(&self) -> Option<&ObjectPath> {
        match &self.kind {
            MessageKind::MethodCall { path, .. } => Some(path),
            MessageKind::Signal { path, .. } => Some(path),
            _ => None,
        }
    }

    /// Convert an error reply into the corresponding [`Error`].
    pub(crate) fn into_remote_error(self) -> Error {
        match self.kind {
            MessageKind::Error { error_name, .. } => Error::new(ErrorKind::RemoteError {
                name: error_name.into(),
                body: self.body,
            }),
            _ => Error::new(ErrorKind::InvalidMessageField("error_name")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path() -> ObjectPath {
        ObjectPath::new("/org/freedesktop/DBus").unwrap()
    }

    #[test]
    fn method_call_builder() {
        let m = Message::method_call(path(), "Hello")
            .unwrap()
            .with_interface("org.freedesktop.DBus")
            .unwrap()
            .with_destination("org.freedesktop.DBus")
            .unwrap();

        assert!(m.reply_expected());
        assert_eq!(m.destination(), Some("org.freedesktop.DBus"));

        let m = m.with_no_reply();
        assert!(!m.reply_expected());
    }

    #[test]
    fn blank_names_are_rejected() {
        assert!(Message::method_call(path(), "").is_err());
        assert!(Message::method_call(path(), "  ").is_err());
        assert!(Message::signal(path(), "", "S").is_err());
        assert!(Message::signal(path(), "i.f", " ").is_err());
        assert!(Message::error("", NonZeroU32::new(1).unwrap()).is_err());
        assert!(Message::method_call(path(), "M")
            .unwrap()
            .with_destination("")
            .is_err());
    }

    #[test]
    fn interface_only_applies_to_method_calls() {
        let m = Message::method_return(NonZeroU32::new(1).unwrap());
        assert!(m.with_interface("i.f").is_err());
    }

    #[test]
    fn returns_never_expect_replies() {
        let m = Message::method_return(NonZeroU32::new(1).unwrap());
        assert!(!m.reply_expected());
    }
}

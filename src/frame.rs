//! Framing between whole protocol messages and the byte stream.

use std::num::NonZeroU32;

use tracing::trace;

use crate::codec::{self, Decoder, Encoder};
use crate::error::{Error, ErrorKind, Result};
use crate::message::{InboundMessage, Message, MessageKind};
use crate::proto::{
    Endianness, Flags, HeaderField, MessageType, MAX_ARRAY_LENGTH, MAX_BODY_LENGTH,
    PROTOCOL_VERSION,
};
use crate::ty::DType;
use crate::value::{Array, Value};

/// Number of bytes in the fixed part of the header, before the header-field
/// array contents.
const FIXED_HEADER: usize = 16;

/// A parsed protocol frame: the fixed header, the header-field dictionary
/// and the raw body bytes.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Frame {
    pub(crate) endianness: Endianness,
    pub(crate) message_type: MessageType,
    pub(crate) flags: Flags,
    pub(crate) version: u8,
    pub(crate) body_length: u32,
    pub(crate) serial: u32,
    pub(crate) fields: Vec<(HeaderField, Value)>,
    pub(crate) body: Vec<u8>,
}

impl Frame {
    /// Peek at a byte accumulation and report how many bytes the frame at
    /// its front needs in total, or `None` when the fixed header is not
    /// complete yet.
    pub(crate) fn needed_len(buf: &[u8]) -> Result<Option<usize>> {
        if buf.len() < FIXED_HEADER {
            return Ok(None);
        }

        let endianness = Endianness::from_marker(buf[0])
            .ok_or_else(|| Error::new(ErrorKind::InvalidEndianness(buf[0])))?;

        let load = |bytes: [u8; 4]| match endianness {
            Endianness::BIG => u32::from_be_bytes(bytes),
            _ => u32::from_le_bytes(bytes),
        };

        let body_length = load([buf[4], buf[5], buf[6], buf[7]]);
        let fields_length = load([buf[12], buf[13], buf[14], buf[15]]);

        if body_length > MAX_BODY_LENGTH {
            return Err(Error::new(ErrorKind::SizeLimitExceeded {
                what: "body",
                size: u64::from(body_length),
                max: u64::from(MAX_BODY_LENGTH),
            }));
        }

        if fields_length > MAX_ARRAY_LENGTH {
            return Err(Error::new(ErrorKind::SizeLimitExceeded {
                what: "array",
                size: u64::from(fields_length),
                max: u64::from(MAX_ARRAY_LENGTH),
            }));
        }

        let fields_end = FIXED_HEADER + fields_length as usize;
        let padded = fields_end + (8 - fields_end % 8) % 8;
        Ok(Some(padded + body_length as usize))
    }

    /// Decode a complete frame from exactly the bytes reported by
    /// [`needed_len`].
    ///
    /// [`needed_len`]: Self::needed_len
    pub(crate) fn decode(buf: &[u8]) -> Result<Frame> {
        if buf.len() < FIXED_HEADER {
            return Err(Error::new(ErrorKind::UnexpectedEof));
        }

        let endianness = Endianness::from_marker(buf[0])
            .ok_or_else(|| Error::new(ErrorKind::InvalidEndianness(buf[0])))?;

        let mut decoder = Decoder::new(buf, 1, endianness);
        let message_type = MessageType(decoder.load_u8()?);
        let flags = Flags(decoder.load_u8()?);
        let version = decoder.load_u8()?;

        if version != PROTOCOL_VERSION {
            return Err(Error::new(ErrorKind::UnsupportedProtocolVersion(version)));
        }

        let body_length = decoder.load_u32()?;
        let serial = decoder.load_u32()?;

        if serial == 0 {
            return Err(Error::new(ErrorKind::ZeroSerial));
        }

        if body_length > MAX_BODY_LENGTH {
            return Err(Error::new(ErrorKind::SizeLimitExceeded {
                what: "body",
                size: u64::from(body_length),
                max: u64::from(MAX_BODY_LENGTH),
            }));
        }

        let fields_ty = DType::Array(Box::new(DType::Struct(vec![DType::Byte, DType::Variant])));
        let Value::Array(raw_fields) = decoder.decode_value(&fields_ty)? else {
            return Err(Error::new(ErrorKind::UnexpectedEof));
        };

        let mut fields = Vec::with_capacity(raw_fields.len());

        for entry in &raw_fields {
            let Value::Struct(entry) = entry else {
                continue;
            };

            let [Value::Byte(code), Value::Variant(value)] = &entry[..] else {
                continue;
            };

            fields.push((HeaderField(*code), (**value).clone()));
        }

        decoder.pad_to(8)?;
        let body = decoder.take(body_length as usize)?.to_vec();

        Ok(Frame {
            endianness,
            message_type,
            flags,
            version,
            body_length,
            serial,
            fields,
            body,
        })
    }

    /// Look up a header field by code.
    pub(crate) fn field(&self, code: HeaderField) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, v)| v)
    }

    /// Build a frame out of an outbound message and its assigned serial.
    pub(crate) fn from_message(
        message: &Message,
        serial: NonZeroU32,
        endianness: Endianness,
    ) -> Result<Frame> {
        let mut fields = Vec::new();

        match &message.kind {
            MessageKind::MethodCall {
                path,
                member,
                interface,
            } => {
                fields.push((HeaderField::PATH, Value::ObjectPath(path.clone())));

                if let Some(interface) = interface {
                    fields.push((HeaderField::INTERFACE, Value::String(interface.clone())));
                }

                fields.push((HeaderField::MEMBER, Value::String(member.clone())));
            }
            MessageKind::MethodReturn { reply_serial } => {
                fields.push((HeaderField::REPLY_SERIAL, Value::Uint32(reply_serial.get())));
            }
            MessageKind::Error {
                error_name,
                reply_serial,
            } => {
                fields.push((HeaderField::ERROR_NAME, Value::String(error_name.clone())));
                fields.push((HeaderField::REPLY_SERIAL, Value::Uint32(reply_serial.get())));
            }
            MessageKind::Signal {
                path,
                interface,
                member,
            } => {
                fields.push((HeaderField::PATH, Value::ObjectPath(path.clone())));
                fields.push((HeaderField::INTERFACE, Value::String(interface.clone())));
                fields.push((HeaderField::MEMBER, Value::String(member.clone())));
            }
        }

        if let Some(destination) = &message.destination {
            fields.push((HeaderField::DESTINATION, Value::String(destination.clone())));
        }

        let body = codec::encode_body(&message.body, endianness)?;

        if !message.body.is_empty() {
            let signature = codec::signature_of(&message.body)?;
            fields.push((HeaderField::SIGNATURE, Value::Signature(signature)));
        }

        if body.len() > MAX_BODY_LENGTH as usize {
            return Err(Error::new(ErrorKind::SizeLimitExceeded {
                what: "body",
                size: body.len() as u64,
                max: u64::from(MAX_BODY_LENGTH),
            }));
        }

        let mut flags = message.flags;

        if matches!(message.kind, MessageKind::MethodCall { .. }) && !message.reply_expected() {
            flags = flags | Flags::NO_REPLY_EXPECTED;
        }

        Ok(Frame {
            endianness,
            message_type: message.kind.message_type(),
            flags,
            version: PROTOCOL_VERSION,
            body_length: body.len() as u32,
            serial: serial.get(),
            fields,
            body,
        })
    }

    /// Encode the frame into wire bytes.
    pub(crate) fn encode(&self) -> Result<Vec<u8>> {
        let mut encoder = Encoder::new(0, self.endianness);

        encoder.store_u8(self.endianness.0);
        encoder.store_u8(self.message_type.0);
        encoder.store_u8(self.flags.0);
        encoder.store_u8(self.version);
        encoder.store_u32(self.body_length);
        encoder.store_u32(self.serial);

        let mut array = Array::new(DType::Struct(vec![DType::Byte, DType::Variant]));

        for (code, value) in &self.fields {
            array.push(Value::Struct(vec![
                Value::Byte(code.0),
                value.clone().into_variant(),
            ]))?;
        }

        encoder.encode_value(&Value::Array(array))?;
        encoder.pad_to(8);
        encoder.extend_raw(&self.body);

        Ok(encoder.into_vec())
    }

    /// Convert the frame into a typed inbound message.
    ///
    /// Returns `None` for message types this client does not know, which
    /// the protocol requires to be ignored.
    pub(crate) fn into_message(self) -> Result<Option<InboundMessage>> {
        let mut path = None;
        let mut interface = None;
        let mut member = None;
        let mut error_name = None;
        let mut reply_serial = None;
        let mut destination = None;
        let mut sender = None;
        let mut signature = None;

        for (code, value) in self.fields {
            match code {
                HeaderField::PATH => match value {
                    Value::ObjectPath(v) => path = Some(v),
                    _ => return Err(Error::new(ErrorKind::InvalidHeaderField(code))),
                },
                HeaderField::INTERFACE => interface = Some(header_str(code, value)?),
                HeaderField::MEMBER => member = Some(header_str(code, value)?),
                HeaderField::ERROR_NAME => error_name = Some(header_str(code, value)?),
                HeaderField::REPLY_SERIAL => match value {
                    Value::Uint32(v) => {
                        reply_serial =
                            Some(NonZeroU32::new(v).ok_or_else(|| {
                                Error::new(ErrorKind::ZeroSerial)
                            })?);
                    }
                    _ => return Err(Error::new(ErrorKind::InvalidHeaderField(code))),
                },
                HeaderField::DESTINATION => destination = Some(header_str(code, value)?),
                HeaderField::SENDER => sender = Some(header_str(code, value)?),
                HeaderField::SIGNATURE => match value {
                    Value::Signature(v) => signature = Some(v),
                    _ => return Err(Error::new(ErrorKind::InvalidHeaderField(code))),
                },
                HeaderField::UNIX_FDS => {}
                other => {
                    trace!(code = other.0, "ignoring unknown header field");
                }
            }
        }

        let kind = match self.message_type {
            MessageType::METHOD_CALL => MessageKind::MethodCall {
                path: required(path, HeaderField::PATH)?,
                member: required(member, HeaderField::MEMBER)?,
                interface,
            },
            MessageType::METHOD_RETURN => MessageKind::MethodReturn {
                reply_serial: required(reply_serial, HeaderField::REPLY_SERIAL)?,
            },
            MessageType::ERROR => MessageKind::Error {
                error_name: required(error_name, HeaderField::ERROR_NAME)?,
                reply_serial: required(reply_serial, HeaderField::REPLY_SERIAL)?,
            },
            MessageType::SIGNAL => MessageKind::Signal {
                path: required(path, HeaderField::PATH)?,
                interface: required(interface, HeaderField::INTERFACE)?,
                member: required(member, HeaderField::MEMBER)?,
            },
            other => {
                trace!(message_type = other.0, "ignoring unknown message type");
                return Ok(None);
            }
        };

        let signature = match signature {
            Some(signature) if signature.is_empty() => None,
            other => other,
        };

        let body = match &signature {
            Some(signature) => {
                if self.body.is_empty() {
                    return Err(Error::new(ErrorKind::BodySignatureMismatch));
                }

                codec::decode_body(&self.body, signature, self.endianness)?
            }
            None => {
                if !self.body.is_empty() {
                    return Err(Error::new(ErrorKind::BodySignatureMismatch));
                }

                Vec::new()
            }
        };

        if let Some(sender) = &sender {
            if sender.trim().is_empty() {
                return Err(Error::new(ErrorKind::InvalidMessageField("sender")));
            }
        }

        // The frame decoder already rejected a zero serial.
        let serial = NonZeroU32::new(self.serial).ok_or_else(|| {
            Error::new(ErrorKind::ZeroSerial)
        })?;

        Ok(Some(InboundMessage {
            serial,
            flags: self.flags,
            kind,
            sender,
            destination,
            signature,
            body,
        }))
    }
}

fn header_str(code: HeaderField, value: Value) -> Result<String> {
    match value {
        Value::String(v) => Ok(v),
        _ => Err(Error::new(ErrorKind::InvalidHeaderField(code))),
    }
}

fn required<T>(value: Option<T>, field: HeaderField) -> Result<T> {
    value.ok_or_else(|| Error::new(ErrorKind::MissingRequiredHeader(field)))
}

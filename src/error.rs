use std::error;
use std::fmt;
use std::io;
use std::str::Utf8Error;

use crate::address::AddressError;
use crate::connection::ConnectionState;
use crate::object_path::ObjectPathError;
use crate::proto::HeaderField;
use crate::signature::SignatureError;
use crate::ty::DType;
use crate::value::Value;

/// Result alias using an [`Error`] as the error type by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error raised by this crate.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
}

impl Error {
    #[inline]
    pub(crate) fn new(kind: ErrorKind) -> Error {
        Self { kind }
    }

    #[inline]
    pub(crate) fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Test if the error is a method-call timeout.
    #[inline]
    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::Timeout)
    }

    /// Test if the error indicates that the connection was lost.
    #[inline]
    pub fn is_disconnected(&self) -> bool {
        matches!(self.kind, ErrorKind::Disconnected)
    }

    /// Test if the error is a locally canceled call.
    #[inline]
    pub fn is_canceled(&self) -> bool {
        matches!(self.kind, ErrorKind::Canceled)
    }

    /// The name of the remote error, if this is an error reply from a peer.
    #[inline]
    pub fn remote_error_name(&self) -> Option<&str> {
        match &self.kind {
            ErrorKind::RemoteError { name, .. } => Some(name),
            _ => None,
        }
    }

    /// The body of the remote error reply, if this is one.
    #[inline]
    pub fn remote_error_body(&self) -> Option<&[Value]> {
        match &self.kind {
            ErrorKind::RemoteError { body, .. } => Some(body),
            _ => None,
        }
    }

    /// Errors which terminate the connection rather than a single inbound
    /// message.
    pub(crate) fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Io(..)
                | ErrorKind::Disconnected
                | ErrorKind::UnsupportedProtocolVersion(..)
                | ErrorKind::InvalidEndianness(..)
                | ErrorKind::SizeLimitExceeded { what: "body", .. }
        )
    }
}

impl From<SignatureError> for Error {
    #[inline]
    fn from(error: SignatureError) -> Self {
        Self::new(ErrorKind::Signature(error))
    }
}

impl From<ObjectPathError> for Error {
    #[inline]
    fn from(error: ObjectPathError) -> Self {
        Self::new(ErrorKind::ObjectPath(error))
    }
}

impl From<AddressError> for Error {
    #[inline]
    fn from(error: AddressError) -> Self {
        Self::new(ErrorKind::Address(error))
    }
}

impl From<io::Error> for Error {
    #[inline]
    fn from(error: io::Error) -> Self {
        Self::new(ErrorKind::Io(error))
    }
}

impl From<Utf8Error> for Error {
    #[inline]
    fn from(error: Utf8Error) -> Self {
        Self::new(ErrorKind::InvalidUtf8(error))
    }
}

impl From<ErrorKind> for Error {
    #[inline]
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.kind {
            ErrorKind::Signature(error) => error.fmt(f),
            ErrorKind::ObjectPath(error) => error.fmt(f),
            ErrorKind::Address(error) => error.fmt(f),
            ErrorKind::Io(error) => error.fmt(f),
            ErrorKind::InvalidUtf8(error) => error.fmt(f),
            ErrorKind::UnexpectedEof => write!(f, "Unexpected end of buffer"),
            ErrorKind::InvalidPadding { at } => {
                write!(f, "Non-zero padding byte at offset {at}")
            }
            ErrorKind::InvalidBoolean(value) => {
                write!(f, "Boolean must be 0 or 1, got {value}")
            }
            ErrorKind::SizeLimitExceeded { what, size, max } => {
                write!(f, "Encoded {what} of {size} bytes exceeds the limit of {max}")
            }
            ErrorKind::TypeMismatch { expected, found } => {
                write!(f, "Expected value of type `{expected}`, found `{found}`")
            }
            ErrorKind::NotNullTerminated => write!(f, "String is not nul-terminated"),
            ErrorKind::EmbeddedNul => write!(f, "String contains an embedded nul byte"),
            ErrorKind::UnsupportedProtocolVersion(version) => {
                write!(f, "Unsupported protocol version {version}")
            }
            ErrorKind::InvalidEndianness(marker) => {
                write!(f, "Invalid endianness marker 0x{marker:02x}")
            }
            ErrorKind::MissingRequiredHeader(field) => {
                write!(f, "Missing required {field:?} header field")
            }
            ErrorKind::InvalidHeaderField(field) => {
                write!(f, "Header field {field:?} has an unexpected value type")
            }
            ErrorKind::BodySignatureMismatch => {
                write!(f, "Body length and signature header disagree")
            }
            ErrorKind::ZeroSerial => write!(f, "Zero in header serial"),
            ErrorKind::Disconnected => write!(f, "Connection lost"),
            ErrorKind::AuthRejected => write!(f, "All authentication mechanisms rejected"),
            ErrorKind::SaslProtocol(message) => write!(f, "SASL protocol error: {message}"),
            ErrorKind::NoMechanismAvailable => {
                write!(f, "No usable authentication mechanism")
            }
            ErrorKind::CookieUnavailable(reason) => {
                write!(f, "DBUS_COOKIE_SHA1 keyring unavailable: {reason}")
            }
            ErrorKind::InvalidMessageField(field) => {
                write!(f, "Invalid message field: {field}")
            }
            ErrorKind::Timeout => write!(f, "Method call timed out"),
            ErrorKind::Canceled => write!(f, "Method call canceled"),
            ErrorKind::RemoteError { name, body } => {
                if let Some(Value::String(message)) = body.first() {
                    write!(f, "{name}: {message}")
                } else {
                    write!(f, "{name}")
                }
            }
            ErrorKind::UnsupportedTransport(transport) => {
                write!(f, "Unsupported transport `{transport}`")
            }
            ErrorKind::InvalidState(state) => {
                write!(f, "Invalid connection state `{state:?}`")
            }
            ErrorKind::DuplicateHandler(name) => {
                write!(f, "A handler named `{name}` is already installed")
            }
            ErrorKind::HandlerNotFound(name) => {
                write!(f, "No handler named `{name}`")
            }
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.kind {
            ErrorKind::Signature(error) => Some(error),
            ErrorKind::ObjectPath(error) => Some(error),
            ErrorKind::Address(error) => Some(error),
            ErrorKind::Io(error) => Some(error),
            ErrorKind::InvalidUtf8(error) => Some(error),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub(crate) enum ErrorKind {
    Signature(SignatureError),
    ObjectPath(ObjectPathError),
    Address(AddressError),
    Io(io::Error),
    InvalidUtf8(Utf8Error),
    UnexpectedEof,
    InvalidPadding {
        at: usize,
    },
    InvalidBoolean(u32),
    SizeLimitExceeded {
        what: &'static str,
        size: u64,
        max: u64,
    },
    TypeMismatch {
        expected: DType,
        found: DType,
    },
    NotNullTerminated,
    EmbeddedNul,
    UnsupportedProtocolVersion(u8),
    InvalidEndianness(u8),
    MissingRequiredHeader(HeaderField),
    InvalidHeaderField(HeaderField),
    BodySignatureMismatch,
    ZeroSerial,
    Disconnected,
    AuthRejected,
    SaslProtocol(Box<str>),
    NoMechanismAvailable,
    CookieUnavailable(Box<str>),
    InvalidMessageField(&'static str),
    Timeout,
    Canceled,
    RemoteError {
        name: Box<str>,
        body: Vec<Value>,
    },
    UnsupportedTransport(Box<str>),
    InvalidState(ConnectionState),
    DuplicateHandler(Box<str>),
    HandlerNotFound(Box<str>),
}

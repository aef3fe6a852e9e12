//! Pure Rust asynchronous D-Bus client for Tokio.
//!
//! The crate connects to a message bus over a Unix or TCP stream,
//! authenticates through SASL, performs the mandatory `Hello` exchange
//! and then exchanges typed messages with the broker and its peers.
//!
//! Dispatch runs on two pipelines: an I/O pipeline on a dedicated
//! single-threaded executor which never runs user code, and an
//! application pipeline whose handlers run on a worker pool. A bridge
//! between them performs request/response correlation with timeouts, and
//! the connection manager reconnects with backoff when the transport is
//! lost.
//!
//! ```no_run
//! use pipebus::{Connection, Message, ObjectPath};
//!
//! # #[tokio::main] async fn main() -> pipebus::Result<()> {
//! let connection = Connection::session_bus().await?;
//!
//! let call = Message::method_call(
//!     ObjectPath::new("/org/freedesktop/DBus")?,
//!     "ListNames",
//! )?
//! .with_interface("org.freedesktop.DBus")?
//! .with_destination("org.freedesktop.DBus")?;
//!
//! let reply = connection.send_request(call).await?;
//! println!("{:?}", reply.body());
//! # Ok(()) }
//! ```

#[doc(inline)]
pub use self::address::{AddressError, AddressFamily, BusAddress};
mod address;

pub use self::bridge::BackpressurePolicy;
mod bridge;

pub mod codec;

#[doc(inline)]
pub use self::connection::{
    AuthMechanism, Connection, ConnectionBuilder, ConnectionEvent, ConnectionState, PendingReply,
    ReconnectPolicy, WriteAck,
};
mod connection;

#[doc(inline)]
pub use self::error::{Error, Result};
mod error;

mod executor;

pub mod fdo;

mod frame;

mod io;

#[doc(inline)]
pub use self::message::{InboundMessage, Message, MessageKind};
mod message;

#[doc(inline)]
pub use self::object_path::{ObjectPath, ObjectPathError};
mod object_path;

#[doc(inline)]
pub use self::pipeline::{Context, Handler, HandlerId, Pipeline, WritePromise};
mod pipeline;

#[doc(inline)]
pub use self::proto::{Endianness, Flags};
mod proto;

mod sasl;

#[doc(inline)]
pub use self::signature::{Signature, SignatureError};
mod signature;

mod transport;

#[doc(inline)]
pub use self::ty::DType;
mod ty;

#[doc(inline)]
pub use self::value::{Array, Value};
mod value;

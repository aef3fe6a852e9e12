//! The connection manager and public client surface.

pub use self::builder::{AuthMechanism, ConnectionBuilder, ReconnectPolicy};
pub(crate) use self::builder::Config;
mod builder;

mod manager;

#[cfg(test)]
mod tests;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::Poll;

use tokio::sync::{mpsc, oneshot};
use tracing::info;

use crate::bridge::{Command, InboundQueue, Notice, Serials};
use crate::error::{Error, ErrorKind, Result};
use crate::executor::Executors;
use crate::fdo::{self, NameFlag, NameReply, ReleaseReply};
use crate::message::{InboundMessage, Message};
use crate::object_path::ObjectPath;
use crate::pipeline::{Pipeline, WritePromise};
use crate::value::Value;

/// The lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not yet connected.
    Idle,
    /// Opening the transport.
    Connecting,
    /// SASL in progress.
    Authenticating,
    /// Waiting for the `Hello` reply.
    AcquiringName,
    /// Fully connected and named.
    Connected,
    /// Lost the transport, reconnect attempts scheduled.
    Reconnecting,
    /// Closed on request.
    Closed,
    /// Gave up; no further reconnect attempts.
    Failed,
}

/// Events delivered to connection-event listeners and the application
/// pipeline.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionEvent {
    /// The connection state changed.
    StateChanged(ConnectionState),
    /// The transport was lost and reconnect attempts are starting.
    ReconnectionStarting,
    /// A reconnect attempt succeeded.
    ReconnectionSuccess,
    /// Reconnect attempts are exhausted.
    ReconnectionFailure,
    /// A health probe went unanswered.
    HealthCheckFailure,
}

type Listener = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

pub(crate) enum Control {
    Close(oneshot::Sender<()>),
    ForceReconnect,
}

pub(crate) struct Inner {
    pub(crate) config: Config,
    state: Mutex<ConnectionState>,
    pub(crate) closing: AtomicBool,
    pub(crate) bus_name: Mutex<Option<Box<str>>>,
    pub(crate) serials: Arc<Serials>,
    pub(crate) pipeline: Pipeline,
    pub(crate) queue: Arc<InboundQueue>,
    pub(crate) cmd_tx: Mutex<mpsc::UnboundedSender<Command>>,
    pub(crate) control_tx: mpsc::UnboundedSender<Control>,
    pub(crate) notices_tx: mpsc::UnboundedSender<Notice>,
    listeners: Mutex<Vec<Listener>>,
    pub(crate) executors: Executors,
    dispatcher_done: Mutex<Option<oneshot::Receiver<()>>>,
}

impl Inner {
    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.lock().expect("state poisoned")
    }

    pub(crate) fn set_state(&self, state: ConnectionState) -> ConnectionState {
        std::mem::replace(&mut *self.state.lock().expect("state poisoned"), state)
    }

    pub(crate) fn send_command(&self, command: Command) -> Result<(), Command> {
        self.cmd_tx
            .lock()
            .expect("cmd_tx poisoned")
            .send(command)
            .map_err(|error| error.0)
    }

    /// Fan an event out to listeners (event executor) and the application
    /// pipeline (application executor).
    pub(crate) fn fire(self: &Arc<Self>, event: ConnectionEvent) {
        let listeners = self.listeners.lock().expect("listeners poisoned").clone();

        for listener in listeners {
            let event = event.clone();

            // One task per listener: a panicking listener only takes its
            // own task down.
            self.executors.event.spawn(async move {
                listener(&event);
            });
        }

        let weak = Arc::downgrade(self);

        self.executors.app.spawn(async move {
            if let Some(inner) = weak.upgrade() {
                let connection = Connection { inner };
                let pipeline = connection.inner.pipeline.clone();
                pipeline.dispatch_event(Some(&connection), event);
            }
        });
    }

    /// Deliver `channel_active`/`channel_inactive` to the application
    /// pipeline.
    pub(crate) fn channel_edge(self: &Arc<Self>, active: bool) {
        let weak = Arc::downgrade(self);

        self.executors.app.spawn(async move {
            if let Some(inner) = weak.upgrade() {
                let connection = Connection { inner };
                let pipeline = connection.inner.pipeline.clone();
                pipeline.dispatch_channel_active(Some(&connection), active);
            }
        });
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.queue.close();
        // Executors shut themselves down on drop.
    }
}

/// An asynchronous connection to a D-Bus message bus.
///
/// Cloning is cheap and every clone refers to the same connection.
///
/// # Examples
///
/// ```no_run
/// use pipebus::{Connection, Message, ObjectPath, Value};
///
/// # #[tokio::main] async fn main() -> pipebus::Result<()> {
/// let connection = Connection::session_bus().await?;
///
/// let call = Message::method_call(
///     ObjectPath::new("/org/freedesktop/DBus")?,
///     "GetId",
/// )?
/// .with_interface("org.freedesktop.DBus")?
/// .with_destination("org.freedesktop.DBus")?;
///
/// let reply = connection.send_request(call).await?;
/// println!("bus id: {:?}", reply.body().first());
/// # Ok(()) }
/// ```
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<Inner>,
}

impl Connection {
    /// Connect to the session bus with the default configuration.
    pub async fn session_bus() -> Result<Self> {
        ConnectionBuilder::new().session_bus().connect().await
    }

    /// Connect to the system bus with the default configuration.
    pub async fn system_bus() -> Result<Self> {
        ConnectionBuilder::new().system_bus().connect().await
    }

    /// Connect to an explicit address with the default configuration.
    pub async fn connect(address: &str) -> Result<Self> {
        ConnectionBuilder::new().address(address).connect().await
    }

    pub(crate) async fn establish(config: Config, workers: usize) -> Result<Self> {
        let executors = Executors::new(workers)?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let queue = Arc::new(InboundQueue::new(config.backpressure));

        let inner = Arc::new(Inner {
            config,
            state: Mutex::new(ConnectionState::Idle),
            closing: AtomicBool::new(false),
            bus_name: Mutex::new(None),
            serials: Arc::new(Serials::default()),
            pipeline: Pipeline::new(),
            queue,
            cmd_tx: Mutex::new(cmd_tx),
            control_tx,
            notices_tx,
            listeners: Mutex::new(Vec::new()),
            executors,
            dispatcher_done: Mutex::new(None),
        });

        // The dispatcher pulls inbound messages off the bridge queue and
        // runs the application pipeline, in order, on the application
        // executor.
        {
            let weak = Arc::downgrade(&inner);
            let queue = inner.queue.clone();
            let (done_tx, done_rx) = oneshot::channel();
            *inner
                .dispatcher_done
                .lock()
                .expect("dispatcher poisoned") = Some(done_rx);

            inner.executors.app.spawn(async move {
                while let Some(message) = queue.pop().await {
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };

                    let connection = Connection { inner };
                    let pipeline = connection.inner.pipeline.clone();
                    pipeline.dispatch_inbound(Some(&connection), message);
                }

                let _ = done_tx.send(());
            });
        }

        inner.set_state(ConnectionState::Connecting);

        let join = match manager::attempt_connect(&inner, cmd_rx, false).await {
            Ok(join) => join,
            Err((error, _)) => {
                inner.set_state(ConnectionState::Failed);
                return Err(error);
            }
        };

        inner.set_state(ConnectionState::Connected);
        inner.fire(ConnectionEvent::StateChanged(ConnectionState::Connected));
        inner.channel_edge(true);
        info!(
            bus_name = inner.bus_name.lock().expect("bus_name poisoned").as_deref(),
            "connected"
        );

        let weak = Arc::downgrade(&inner);
        inner
            .executors
            .event
            .spawn(manager::run(weak, join, control_rx, notices_rx));

        manager::spawn_health_probe(&inner);

        Ok(Self { inner })
    }

    /// The current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// The unique bus name assigned by the broker, such as `:1.42`.
    ///
    /// `None` until the `Hello` exchange completes, and reset during
    /// reconnects.
    pub fn bus_name(&self) -> Option<String> {
        self.inner
            .bus_name
            .lock()
            .expect("bus_name poisoned")
            .as_deref()
            .map(str::to_owned)
    }

    /// The application pipeline attached to this connection.
    pub fn pipeline(&self) -> Pipeline {
        self.inner.pipeline.clone()
    }

    /// Register a callback for connection events.
    ///
    /// Listeners run on a dedicated event executor; a slow or panicking
    /// listener does not affect message delivery or other listeners.
    pub fn add_connection_event_listener(
        &self,
        listener: impl Fn(&ConnectionEvent) + Send + Sync + 'static,
    ) {
        self.inner
            .listeners
            .lock()
            .expect("listeners poisoned")
            .push(Arc::new(listener));
    }

    fn gate(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Closed | ConnectionState::Failed | ConnectionState::Idle => {
                Err(Error::new(ErrorKind::Disconnected))
            }
            _ => Ok(()),
        }
    }

    /// Queue a message for sending.
    ///
    /// The returned future resolves once the message left through the
    /// transport. The message first traverses the application pipeline
    /// tail to head, so outbound handlers observe it.
    pub fn send(&self, message: Message) -> WriteAck {
        let (tx, rx) = oneshot::channel();

        if let Err(error) = self.gate() {
            let _ = tx.send(Err(error));
            return WriteAck { rx };
        }

        let connection = self.clone();

        self.inner.executors.app.spawn(async move {
            let pipeline = connection.inner.pipeline.clone();
            let inner = connection.inner.clone();

            pipeline.dispatch_outbound(
                Some(&connection),
                message,
                WritePromise::new(tx),
                move |message, promise| {
                    let ack = promise.into_sender();

                    if let Err(Command::Send { ack: Some(ack), .. }) =
                        inner.send_command(Command::Send { message, ack })
                    {
                        let _ = ack.send(Err(Error::new(ErrorKind::Disconnected)));
                    }
                },
            );
        });

        WriteAck { rx }
    }

    /// Send a method call and await its reply.
    ///
    /// The returned future fails with a timeout, a remote error reply,
    /// a disconnect, or cancellation when dropped.
    pub fn send_request(&self, message: Message) -> PendingReply {
        let (tx, rx) = oneshot::channel();

        if let Err(error) = self.gate() {
            let _ = tx.send(Err(error));
            return PendingReply { rx };
        }

        let connection = self.clone();

        self.inner.executors.app.spawn(async move {
            let pipeline = connection.inner.pipeline.clone();
            let inner = connection.inner.clone();

            pipeline.dispatch_outbound(
                Some(&connection),
                message,
                WritePromise::discard(),
                move |message, _| {
                    if let Err(Command::Call { reply, .. }) =
                        inner.send_command(Command::Call { message, reply: tx })
                    {
                        let _ = reply.send(Err(Error::new(ErrorKind::Disconnected)));
                    }
                },
            );
        });

        PendingReply { rx }
    }

    /// Ask the bus for ownership of a well-known name.
    pub async fn request_name(&self, name: &str, flags: NameFlag) -> Result<NameReply> {
        let call = self
            .bus_call("RequestName")?
            .with_body(vec![Value::String(name.into()), Value::Uint32(flags.bits())]);

        let reply = self.send_request(call).await?;

        match reply.body().first() {
            Some(Value::Uint32(value)) => Ok(NameReply::from(*value)),
            _ => Err(Error::new(ErrorKind::InvalidMessageField("body"))),
        }
    }

    /// Release a well-known name previously requested.
    pub async fn release_name(&self, name: &str) -> Result<ReleaseReply> {
        let call = self
            .bus_call("ReleaseName")?
            .with_body(vec![Value::String(name.into())]);

        let reply = self.send_request(call).await?;

        match reply.body().first() {
            Some(Value::Uint32(value)) => Ok(ReleaseReply::from(*value)),
            _ => Err(Error::new(ErrorKind::InvalidMessageField("body"))),
        }
    }

    /// Subscribe to messages matching a match rule, such as
    /// `type='signal',interface='com.example.Player'`.
    pub async fn add_match(&self, rule: &str) -> Result<()> {
        let call = self
            .bus_call("AddMatch")?
            .with_body(vec![Value::String(rule.into())]);

        self.send_request(call).await?;
        Ok(())
    }

    fn bus_call(&self, member: &str) -> Result<Message> {
        Message::method_call(ObjectPath::new_unchecked(fdo::PATH), member)?
            .with_interface(fdo::INTERFACE)?
            .with_destination(fdo::DESTINATION)
    }

    /// Close the connection.
    ///
    /// Drains queued writes, fails pending calls, delivers
    /// `channel_inactive`, and shuts the executors down after a bounded
    /// grace period.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let (tx, rx) = oneshot::channel();

        if self.inner.control_tx.send(Control::Close(tx)).is_ok() {
            let _ = rx.await;
        }

        self.inner.queue.close();

        let done = self
            .inner
            .dispatcher_done
            .lock()
            .expect("dispatcher poisoned")
            .take();

        if let Some(done) = done {
            let _ = tokio::time::timeout(self.inner.config.close_grace, done).await;
        }

        self.inner.executors.shutdown();
        Ok(())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("bus_name", &self.bus_name())
            .finish_non_exhaustive()
    }
}

/// Future of a completed outbound write.
pub struct WriteAck {
    rx: oneshot::Receiver<Result<()>>,
}

impl Future for WriteAck {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(..)) => Poll::Ready(Err(Error::new(ErrorKind::Canceled))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Future of a method-call reply.
///
/// Dropping it cancels the call locally: the pending record is discarded
/// and a late reply is silently dropped.
pub struct PendingReply {
    rx: oneshot::Receiver<Result<InboundMessage>>,
}

impl Future for PendingReply {
    type Output = Result<InboundMessage>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(..)) => Poll::Ready(Err(Error::new(ErrorKind::Canceled))),
            Poll::Pending => Poll::Pending,
        }
    }
}

//! The connection lifecycle: handshakes, reconnection, health probing.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bridge::{Bridge, Command, Notice};
use crate::connection::{Connection, ConnectionEvent, ConnectionState, Control, Inner};
use crate::error::{Error, ErrorKind};
use crate::fdo;
use crate::io::{
    Driver, DriverExit, FrameStage, HelloStage, IoEvent, IoPipeline, MessageStage, SaslStage,
};
use crate::message::Message;
use crate::object_path::ObjectPath;
use crate::transport::Transport;

type Commands = mpsc::UnboundedReceiver<Command>;

/// Open a transport, install a fresh I/O pipeline and drive the handshake
/// through to the unique bus name.
///
/// On failure the command channel is handed back for the next attempt
/// when it could be recovered.
pub(crate) async fn attempt_connect(
    inner: &Arc<Inner>,
    commands: Commands,
    reconnect: bool,
) -> Result<JoinHandle<DriverExit>, (Error, Option<Commands>)> {
    let config = &inner.config;

    let transport = match tokio::time::timeout(
        config.connect_timeout,
        Transport::connect(&config.address),
    )
    .await
    {
        Ok(Ok(transport)) => transport,
        Ok(Err(error)) => return Err((error, Some(commands))),
        Err(..) => return Err((Error::new(ErrorKind::Timeout), Some(commands))),
    };

    inner.set_state(ConnectionState::Authenticating);
    inner.fire(ConnectionEvent::StateChanged(ConnectionState::Authenticating));

    // Fresh per-connection state for the new transport.
    inner.serials.reset();
    *inner.bus_name.lock().expect("bus_name poisoned") = None;

    let mut pipeline = IoPipeline::new(vec![
        Box::new(SaslStage::new(config.sasl_client())),
        Box::new(FrameStage::new()),
        Box::new(MessageStage::new()),
        Box::new(HelloStage::new(inner.serials.clone())),
    ]);

    if reconnect {
        let _ = pipeline.fire_event(IoEvent::ReconnectionStarting);
        let _ = pipeline.fire_event(IoEvent::ReconnectionHandlersReaddRequired);
    }

    let (connected_tx, connected_rx) = oneshot::channel();

    let bridge = Bridge {
        queue: inner.queue.clone(),
        serials: inner.serials.clone(),
        app: inner.executors.app.handle(),
        notices: inner.notices_tx.clone(),
        default_timeout: config.method_call_timeout,
    };

    let driver = Driver::new(transport, pipeline, commands, bridge, connected_tx);
    let join = inner.executors.io.spawn(driver.run());

    match tokio::time::timeout(config.connect_timeout, connected_rx).await {
        Ok(Ok(name)) => {
            *inner.bus_name.lock().expect("bus_name poisoned") = Some(name);
            Ok(join)
        }
        Ok(Err(..)) => {
            // The driver died before the handshake finished.
            match join.await {
                Ok(exit) => Err((
                    exit.error
                        .unwrap_or_else(|| Error::new(ErrorKind::Disconnected)),
                    Some(exit.commands),
                )),
                Err(..) => Err((Error::new(ErrorKind::Disconnected), None)),
            }
        }
        Err(..) => {
            let _ = inner.send_command(Command::Shutdown { restart: true });

            match join.await {
                Ok(exit) => Err((Error::new(ErrorKind::Timeout), Some(exit.commands))),
                Err(..) => Err((Error::new(ErrorKind::Timeout), None)),
            }
        }
    }
}

/// The long-lived manager task: watches the driver, applies notices,
/// serves close requests and runs the reconnect policy.
pub(crate) async fn run(
    weak: Weak<Inner>,
    mut join: JoinHandle<DriverExit>,
    mut control: mpsc::UnboundedReceiver<Control>,
    mut notices: mpsc::UnboundedReceiver<Notice>,
) {
    loop {
        tokio::select! {
            exit = &mut join => {
                let Some(inner) = weak.upgrade() else {
                    return;
                };

                let exit = match exit {
                    Ok(exit) => exit,
                    Err(error) => {
                        // The driver task itself died; rebuild the command
                        // channel so callers keep a live endpoint.
                        warn!(%error, "i/o driver task failed");
                        let (tx, rx) = mpsc::unbounded_channel();
                        *inner.cmd_tx.lock().expect("cmd_tx poisoned") = tx;
                        DriverExit {
                            error: Some(Error::new(ErrorKind::Disconnected)),
                            commands: rx,
                        }
                    }
                };

                match handle_exit(&inner, exit, &mut control).await {
                    Some(next) => join = next,
                    None => return,
                }
            }

            notice = notices.recv() => {
                let Some(notice) = notice else {
                    return;
                };

                let Some(inner) = weak.upgrade() else {
                    return;
                };

                apply_notice(&inner, notice);
            }

            request = control.recv() => {
                let Some(inner) = weak.upgrade() else {
                    return;
                };

                match request {
                    Some(Control::Close(ack)) => {
                        close_driver(&inner, &mut join).await;
                        let _ = ack.send(());
                        return;
                    }
                    Some(Control::ForceReconnect) => {
                        debug!("forcing reconnect");
                        let _ = inner.send_command(Command::Shutdown { restart: true });
                    }
                    // Every connection handle is gone; stop the driver and
                    // bow out.
                    None => {
                        let _ = inner.send_command(Command::Shutdown { restart: false });
                        let _ = (&mut join).await;
                        return;
                    }
                }
            }
        }
    }
}

fn apply_notice(inner: &Arc<Inner>, notice: Notice) {
    match notice {
        Notice::AcquiringName => {
            if inner.state() == ConnectionState::Authenticating {
                inner.set_state(ConnectionState::AcquiringName);
                inner.fire(ConnectionEvent::StateChanged(ConnectionState::AcquiringName));
            }
        }
        Notice::InboundFailure(error) => {
            let weak = Arc::downgrade(inner);
            let error = Arc::new(error);

            inner.executors.app.spawn(async move {
                if let Some(inner) = weak.upgrade() {
                    let connection = Connection { inner };
                    let pipeline = connection.inner.pipeline.clone();
                    pipeline.dispatch_failure(Some(&connection), error);
                }
            });
        }
    }
}

async fn close_driver(inner: &Arc<Inner>, join: &mut JoinHandle<DriverExit>) {
    let _ = inner.send_command(Command::Shutdown { restart: false });
    let _ = join.await;

    inner.channel_edge(false);
    inner.set_state(ConnectionState::Closed);
    inner.fire(ConnectionEvent::StateChanged(ConnectionState::Closed));
    info!("connection closed");
}

/// The driver stopped. Either finish up or run the reconnect policy and
/// return the next driver handle.
async fn handle_exit(
    inner: &Arc<Inner>,
    exit: DriverExit,
    control: &mut mpsc::UnboundedReceiver<Control>,
) -> Option<JoinHandle<DriverExit>> {
    let DriverExit { error, commands } = exit;

    inner.channel_edge(false);

    let closing = inner.closing.load(Ordering::SeqCst);

    let Some(error) = error else {
        // Orderly stop without a close request, e.g. every handle
        // dropped.
        inner.set_state(ConnectionState::Closed);
        inner.fire(ConnectionEvent::StateChanged(ConnectionState::Closed));
        drain_commands(inner, commands);
        return None;
    };

    if closing {
        inner.set_state(ConnectionState::Closed);
        inner.fire(ConnectionEvent::StateChanged(ConnectionState::Closed));
        drain_commands(inner, commands);
        return None;
    }

    if !inner.config.auto_reconnect {
        warn!(%error, "connection lost");
        inner.set_state(ConnectionState::Failed);
        inner.fire(ConnectionEvent::StateChanged(ConnectionState::Failed));
        drain_commands(inner, commands);
        return None;
    }

    info!(%error, "connection lost, scheduling reconnect");
    inner.set_state(ConnectionState::Reconnecting);
    inner.fire(ConnectionEvent::StateChanged(ConnectionState::Reconnecting));
    inner.fire(ConnectionEvent::ReconnectionStarting);

    let policy = inner.config.reconnect;
    let mut commands = commands;
    let mut delay = policy.initial_delay;

    for attempt in 1..=policy.max_attempts {
        let wait = jittered(delay, policy.jitter);
        debug!(attempt, ?wait, "reconnect attempt scheduled");

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}

            request = control.recv() => {
                match request {
                    Some(Control::Close(ack)) => {
                        inner.set_state(ConnectionState::Closed);
                        inner.fire(ConnectionEvent::StateChanged(ConnectionState::Closed));
                        drain_commands(inner, commands);
                        let _ = ack.send(());
                        return None;
                    }
                    Some(Control::ForceReconnect) => {}
                    None => {
                        drain_commands(inner, commands);
                        return None;
                    }
                }
            }
        }

        match attempt_connect(inner, commands, true).await {
            Ok(join) => {
                inner.set_state(ConnectionState::Connected);
                inner.fire(ConnectionEvent::StateChanged(ConnectionState::Connected));
                inner.fire(ConnectionEvent::ReconnectionSuccess);
                inner.channel_edge(true);
                info!(
                    bus_name = inner
                        .bus_name
                        .lock()
                        .expect("bus_name poisoned")
                        .as_deref(),
                    "reconnected"
                );
                return Some(join);
            }
            Err((error, recovered)) => {
                warn!(attempt, %error, "reconnect attempt failed");

                commands = match recovered {
                    Some(commands) => commands,
                    None => {
                        let (tx, rx) = mpsc::unbounded_channel();
                        *inner.cmd_tx.lock().expect("cmd_tx poisoned") = tx;
                        rx
                    }
                };

                delay = next_delay(delay, &policy);
            }
        }
    }

    warn!("reconnect attempts exhausted");
    inner.set_state(ConnectionState::Failed);
    inner.fire(ConnectionEvent::StateChanged(ConnectionState::Failed));
    inner.fire(ConnectionEvent::ReconnectionFailure);
    drain_commands(inner, commands);
    None
}

/// Fail whatever queued up while no driver was around.
fn drain_commands(inner: &Arc<Inner>, mut commands: Commands) {
    commands.close();

    let mut acks = Vec::new();

    while let Ok(command) = commands.try_recv() {
        match command {
            Command::Send { ack: Some(ack), .. } => acks.push(AckOrReply::Ack(ack)),
            Command::Call { reply, .. } => acks.push(AckOrReply::Reply(reply)),
            _ => {}
        }
    }

    if acks.is_empty() {
        return;
    }

    inner.executors.app.spawn(async move {
        for pending in acks {
            match pending {
                AckOrReply::Ack(ack) => {
                    let _ = ack.send(Err(Error::new(ErrorKind::Disconnected)));
                }
                AckOrReply::Reply(reply) => {
                    let _ = reply.send(Err(Error::new(ErrorKind::Disconnected)));
                }
            }
        }
    });
}

enum AckOrReply {
    Ack(oneshot::Sender<crate::error::Result<()>>),
    Reply(oneshot::Sender<crate::error::Result<crate::message::InboundMessage>>),
}

fn jittered(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return delay;
    }

    let spread = jitter.clamp(0.0, 1.0);
    let factor = 1.0 + spread * (rand::thread_rng().gen::<f64>() * 2.0 - 1.0);
    delay.mul_f64(factor.max(0.0))
}

fn next_delay(delay: Duration, policy: &crate::connection::ReconnectPolicy) -> Duration {
    delay.mul_f64(policy.multiplier.max(1.0)).min(policy.max_delay)
}

/// Periodically call `org.freedesktop.DBus.Peer.Ping` on the bus and
/// force a reconnect after too many consecutive failures.
pub(crate) fn spawn_health_probe(inner: &Arc<Inner>) {
    let Some(interval) = inner.config.health_interval else {
        return;
    };

    let grace = inner.config.health_grace;
    let weak = Arc::downgrade(inner);
    let control = inner.control_tx.clone();

    inner.executors.event.spawn(async move {
        let mut strikes = 0u32;

        loop {
            tokio::time::sleep(interval).await;

            let Some(inner) = weak.upgrade() else {
                return;
            };

            if inner.closing.load(Ordering::SeqCst) {
                return;
            }

            if inner.state() != ConnectionState::Connected {
                strikes = 0;
                continue;
            }

            let connection = Connection { inner };

            let Ok(ping) = ping_call() else {
                return;
            };

            match connection.send_request(ping).await {
                Ok(..) => {
                    strikes = 0;
                }
                Err(error) => {
                    strikes += 1;
                    warn!(%error, strikes, "health check failed");
                    connection.inner.fire(ConnectionEvent::HealthCheckFailure);

                    if strikes > grace {
                        let _ = control.send(Control::ForceReconnect);
                        strikes = 0;
                    }
                }
            }
        }
    });
}

fn ping_call() -> crate::error::Result<Message> {
    Message::method_call(ObjectPath::new_unchecked(fdo::PATH), fdo::PING)?
        .with_interface(fdo::PEER_INTERFACE)?
        .with_destination(fdo::DESTINATION)
}

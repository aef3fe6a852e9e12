use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use tokio::io::Interest;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::bridge::{Bridge, Command, Notice, PendingCall, PendingTable};
use crate::error::{Error, ErrorKind, Result};
use crate::io::{IoEvent, IoItem, IoOutput, IoPipeline};
use crate::message::{InboundMessage, Message, MessageKind};
use crate::transport::Transport;

const READ_CHUNK: usize = 8192;

/// What a driver leaves behind when it exits.
pub(crate) struct DriverExit {
    /// The failure that ended the connection, `None` on an orderly close.
    pub(crate) error: Option<Error>,
    /// The command channel, handed back for the next transport.
    pub(crate) commands: mpsc::UnboundedReceiver<Command>,
}

/// The single-threaded event loop owning one transport.
///
/// The driver runs on the I/O executor and owns the I/O pipeline, the
/// write queue, the pending-call table and its deadlines, and the serial
/// counter (through the bridge). It never runs user code; everything
/// user-visible is handed across the bridge.
pub(crate) struct Driver {
    transport: Transport,
    pipeline: IoPipeline,
    commands: mpsc::UnboundedReceiver<Command>,
    bridge: Bridge,
    pending: PendingTable,
    /// Commands that arrived before the Hello exchange finished.
    backlog: VecDeque<Command>,
    out: Vec<u8>,
    out_pos: usize,
    queued_total: u64,
    written_total: u64,
    acks: VecDeque<(u64, oneshot::Sender<Result<()>>)>,
    connected: Option<oneshot::Sender<Box<str>>>,
    ready: bool,
}

impl Driver {
    pub(crate) fn new(
        transport: Transport,
        pipeline: IoPipeline,
        commands: mpsc::UnboundedReceiver<Command>,
        bridge: Bridge,
        connected: oneshot::Sender<Box<str>>,
    ) -> Self {
        Self {
            transport,
            pipeline,
            commands,
            bridge,
            pending: PendingTable::default(),
            backlog: VecDeque::new(),
            out: Vec::new(),
            out_pos: 0,
            queued_total: 0,
            written_total: 0,
            acks: VecDeque::new(),
            connected: Some(connected),
            ready: false,
        }
    }

    pub(crate) async fn run(mut self) -> DriverExit {
        let error = match self.run_inner().await {
            Ok(()) => None,
            Err(error) => Some(error),
        };

        self.teardown();

        DriverExit {
            error,
            commands: self.commands,
        }
    }

    async fn run_inner(&mut self) -> Result<()> {
        let output = self.pipeline.activate()?;
        self.apply(output).await?;

        loop {
            let deadline = self.pending.next_deadline();

            let mut interest = Interest::READABLE;

            if self.has_queued_writes() {
                interest = interest | Interest::WRITABLE;
            }

            tokio::select! {
                biased;

                command = self.commands.recv() => {
                    match command {
                        Some(command) => {
                            if !self.handle_command(command).await? {
                                return Ok(());
                            }
                        }
                        // Every connection handle is gone.
                        None => return Ok(()),
                    }
                }

                _ = tokio::time::sleep_until(deadline.unwrap_or_else(far_future)),
                    if deadline.is_some() =>
                {
                    self.expire_calls();
                }

                ready = self.transport.ready(interest) => {
                    let ready = ready?;

                    if ready.is_readable() {
                        self.read().await?;
                    }

                    if ready.is_writable() {
                        self.flush()?;
                    }
                }
            }
        }
    }

    /// Returns `false` when the driver should stop cleanly.
    async fn handle_command(&mut self, command: Command) -> Result<bool> {
        match command {
            Command::Shutdown { restart: true } => {
                Err(Error::new(ErrorKind::Disconnected))
            }
            Command::Shutdown { restart: false } => {
                self.drain_writes().await?;
                Ok(false)
            }
            command if !self.ready => {
                // Not past Hello yet; hold messages back so nothing hits
                // the wire before the handshake concludes.
                self.backlog.push_back(command);
                Ok(true)
            }
            Command::Send { message, ack } => {
                self.submit_send(message, ack)?;
                Ok(true)
            }
            Command::Call { message, reply } => {
                self.submit_call(message, reply)?;
                Ok(true)
            }
        }
    }

    fn submit_send(
        &mut self,
        message: Message,
        ack: Option<oneshot::Sender<Result<()>>>,
    ) -> Result<()> {
        if let Err(error) = check_sendable(&message) {
            if let Some(ack) = ack {
                self.bridge.complete_ack(ack, Err(error));
            }

            return Ok(());
        }

        let serial = message
            .serial
            .unwrap_or_else(|| self.bridge.serials.next());

        match self.pipeline.feed_outbound(IoItem::Outbound { message, serial }) {
            Ok(output) => {
                self.apply_sync(output)?;

                if let Some(ack) = ack {
                    if self.has_queued_writes() {
                        self.acks.push_back((self.queued_total, ack));
                    } else {
                        self.bridge.complete_ack(ack, Ok(()));
                    }
                }

                Ok(())
            }
            Err(error) if error.is_fatal() => {
                if let Some(ack) = ack {
                    self.bridge
                        .complete_ack(ack, Err(Error::new(ErrorKind::Disconnected)));
                }

                Err(error)
            }
            Err(error) => {
                if let Some(ack) = ack {
                    self.bridge.complete_ack(ack, Err(error));
                }

                Ok(())
            }
        }
    }

    fn submit_call(
        &mut self,
        message: Message,
        reply: oneshot::Sender<Result<InboundMessage>>,
    ) -> Result<()> {
        if !message.reply_expected() {
            self.bridge.complete_reply(
                reply,
                Err(Error::new(ErrorKind::InvalidMessageField("reply_expected"))),
            );
            return Ok(());
        }

        if let Err(error) = check_sendable(&message) {
            self.bridge.complete_reply(reply, Err(error));
            return Ok(());
        }

        let serial = message
            .serial
            .unwrap_or_else(|| self.bridge.serials.next());

        let timeout = message.timeout.unwrap_or(self.bridge.default_timeout);

        // The pending record exists before the write goes out, so a fast
        // reply can never miss it.
        self.pending.insert(
            serial,
            PendingCall {
                reply,
                deadline: Instant::now() + timeout,
            },
        );

        match self.pipeline.feed_outbound(IoItem::Outbound { message, serial }) {
            Ok(output) => {
                self.apply_sync(output)?;
                Ok(())
            }
            Err(error) if error.is_fatal() => {
                if let Some(call) = self.pending.remove(serial) {
                    self.bridge
                        .complete_reply(call.reply, Err(Error::new(ErrorKind::Disconnected)));
                }

                Err(error)
            }
            Err(error) => {
                if let Some(call) = self.pending.remove(serial) {
                    self.bridge.complete_reply(call.reply, Err(error));
                }

                Ok(())
            }
        }
    }

    async fn read(&mut self) -> Result<()> {
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            match self.transport.try_read(&mut chunk) {
                Ok(0) => return Err(Error::new(ErrorKind::Disconnected)),
                Ok(n) => {
                    let output = self.pipeline.feed_inbound(IoItem::Bytes(chunk[..n].to_vec()))?;
                    self.apply(output).await?;
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(error) => return Err(error.into()),
            }
        }
    }

    async fn apply(&mut self, output: IoOutput) -> Result<()> {
        let IoOutput {
            messages,
            write,
            events,
            failures,
        } = output;

        self.apply_parts(write, events, failures)?;

        for message in messages {
            self.route(message).await;
        }

        Ok(())
    }

    fn apply_sync(&mut self, output: IoOutput) -> Result<()> {
        debug_assert!(output.messages.is_empty());
        self.apply_parts(output.write, output.events, output.failures)
    }

    fn apply_parts(
        &mut self,
        write: Vec<u8>,
        events: Vec<IoEvent>,
        failures: Vec<Error>,
    ) -> Result<()> {
        if !write.is_empty() {
            self.enqueue_write(write);
        }

        for event in events {
            self.handle_event(event)?;
        }

        for failure in failures {
            self.bridge.inbound_failure(failure);
        }

        self.flush()
    }

    fn handle_event(&mut self, event: IoEvent) -> Result<()> {
        match event {
            IoEvent::SaslNulSent => trace!("sasl NUL sent"),
            IoEvent::SaslAuthComplete { .. } => {
                let _ = self.bridge.notices.send(Notice::AcquiringName);
            }
            IoEvent::SaslAuthFailed => debug!("sasl authentication failed"),
            IoEvent::MandatoryNameAcquired(name) => {
                self.ready = true;

                if let Some(connected) = self.connected.take() {
                    let _ = connected.send(name);
                }

                while let Some(command) = self.backlog.pop_front() {
                    match command {
                        Command::Send { message, ack } => self.submit_send(message, ack)?,
                        Command::Call { message, reply } => self.submit_call(message, reply)?,
                        Command::Shutdown { .. } => {}
                    }
                }
            }
            IoEvent::MandatoryNameAcquisitionFailed => {
                debug!("mandatory name acquisition failed");
            }
            IoEvent::ReconnectionStarting | IoEvent::ReconnectionHandlersReaddRequired => {}
        }

        Ok(())
    }

    async fn route(&mut self, message: InboundMessage) {
        if let Some(reply_serial) = message.reply_serial() {
            let Some(call) = self.pending.remove(reply_serial) else {
                // A reply after its timeout, or one we never asked for.
                trace!(
                    reply_serial = reply_serial.get(),
                    "dropping uncorrelated reply"
                );
                return;
            };

            let result = match &message.kind {
                MessageKind::Error { .. } => Err(message.into_remote_error()),
                _ => Ok(message),
            };

            self.bridge.complete_reply(call.reply, result);
            return;
        }

        // Signals and method calls go to the application pipeline. This
        // may suspend under the block-writer backpressure policy.
        self.bridge.queue.push(message).await;
    }

    fn expire_calls(&mut self) {
        let now = Instant::now();

        for call in self.pending.expire(now) {
            // A dropped caller (cancellation) is detected here as well;
            // completing a closed channel is a no-op.
            self.bridge
                .complete_reply(call.reply, Err(Error::new(ErrorKind::Timeout)));
        }
    }

    fn has_queued_writes(&self) -> bool {
        self.out_pos < self.out.len()
    }

    fn enqueue_write(&mut self, bytes: Vec<u8>) {
        if !self.has_queued_writes() {
            self.out.clear();
            self.out_pos = 0;
        }

        self.queued_total += bytes.len() as u64;
        self.out.extend_from_slice(&bytes);
    }

    fn flush(&mut self) -> Result<()> {
        while self.has_queued_writes() {
            match self.transport.try_write(&self.out[self.out_pos..]) {
                Ok(0) => return Err(Error::new(ErrorKind::Disconnected)),
                Ok(n) => {
                    self.out_pos += n;
                    self.written_total += n as u64;
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) => return Err(error.into()),
            }
        }

        if !self.has_queued_writes() {
            self.out.clear();
            self.out_pos = 0;
        }

        while let Some((target, _)) = self.acks.front() {
            if *target > self.written_total {
                break;
            }

            if let Some((_, ack)) = self.acks.pop_front() {
                self.bridge.complete_ack(ack, Ok(()));
            }
        }

        Ok(())
    }

    async fn drain_writes(&mut self) -> Result<()> {
        while self.has_queued_writes() {
            self.transport.ready(Interest::WRITABLE).await?;
            self.flush()?;
        }

        Ok(())
    }

    fn teardown(&mut self) {
        let _ = self.pipeline.deactivate();

        // Pending calls fail in insertion order, exactly once each.
        self.bridge.fail_all_pending(&mut self.pending);

        let acks: Vec<_> = self.acks.drain(..).map(|(_, ack)| ack).collect();

        if !acks.is_empty() {
            self.bridge.app.spawn(async move {
                for ack in acks {
                    let _ = ack.send(Err(Error::new(ErrorKind::Disconnected)));
                }
            });
        }

        // Dropping the connected signal tells the manager the handshake
        // never finished.
        self.connected = None;
        debug!("i/o driver stopped");
    }
}

fn check_sendable(message: &Message) -> Result<()> {
    // UNIX_FD passing is not negotiated by this client.
    if message.body.iter().any(|value| value.contains_fd()) {
        return Err(Error::new(ErrorKind::InvalidMessageField("unix_fd")));
    }

    Ok(())
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400)
}

use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

use super::*;
use crate::frame::Frame;
use crate::message::MessageKind;
use crate::pipeline::{Context, Handler, WritePromise};
use crate::proto::{Endianness, HeaderField};

/// A scripted broker listening on a Unix socket in a fresh directory.
struct TestBus {
    _dir: tempfile::TempDir,
    listener: UnixListener,
    address: String,
}

impl TestBus {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bus");
        let listener = UnixListener::bind(&path).unwrap();
        let address = format!("unix:path={}", path.display());

        Self {
            _dir: dir,
            listener,
            address,
        }
    }

    async fn accept(&self) -> Broker {
        let (stream, _) = self.listener.accept().await.unwrap();
        Broker::new(stream)
    }
}

/// One accepted client connection, with line and frame codecs on top of
/// a shared read buffer.
struct Broker {
    stream: UnixStream,
    buf: Vec<u8>,
    serials: u32,
}

impl Broker {
    fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            buf: Vec::new(),
            serials: 0,
        }
    }

    async fn fill(&mut self) {
        let mut chunk = [0u8; 4096];
        let n = self.stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "client closed the connection");
        self.buf.extend_from_slice(&chunk[..n]);
    }

    async fn expect_nul(&mut self) {
        while self.buf.is_empty() {
            self.fill().await;
        }

        assert_eq!(self.buf.remove(0), 0);
    }

    async fn read_line(&mut self) -> String {
        loop {
            if let Some(end) = self.buf.iter().position(|&b| b == b'\n') {
                let rest = self.buf.split_off(end + 1);
                let line = std::mem::replace(&mut self.buf, rest);
                return String::from_utf8(line).unwrap().trim_end().to_owned();
            }

            self.fill().await;
        }
    }

    async fn read_frame(&mut self) -> InboundMessage {
        loop {
            if let Some(needed) = Frame::needed_len(&self.buf).unwrap() {
                if self.buf.len() >= needed {
                    let rest = self.buf.split_off(needed);
                    let raw = std::mem::replace(&mut self.buf, rest);
                    let frame = Frame::decode(&raw).unwrap();
                    return frame.into_message().unwrap().unwrap();
                }
            }

            self.fill().await;
        }
    }

    async fn write(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    async fn send(&mut self, message: Message, sender: &str) {
        self.serials += 1;
        let serial = NonZeroU32::new(self.serials).unwrap();

        let mut frame = Frame::from_message(&message, serial, Endianness::LITTLE).unwrap();
        frame
            .fields
            .push((HeaderField::SENDER, Value::String(sender.into())));

        let bytes = frame.encode().unwrap();
        self.write(&bytes).await;
    }

    /// NUL, EXTERNAL auth, BEGIN, Hello; leaves the stream in message
    /// mode.
    async fn handshake(&mut self, bus_name: &str) {
        self.expect_nul().await;

        let auth = self.read_line().await;
        assert!(auth.starts_with("AUTH EXTERNAL "), "unexpected: {auth}");

        self.write(b"OK 1234deadbeefcafe\r\n").await;

        let begin = self.read_line().await;
        assert_eq!(begin, "BEGIN");

        let hello = self.read_frame().await;
        assert_eq!(hello.member(), Some("Hello"));
        assert_eq!(hello.destination(), Some("org.freedesktop.DBus"));

        let reply = Message::method_return(hello.serial())
            .with_body(vec![Value::String(bus_name.into())]);
        self.send(reply, "org.freedesktop.DBus").await;
    }
}

#[tokio::test]
async fn hello_success() {
    let bus = TestBus::new();
    let address = bus.address.clone();

    let server = tokio::spawn(async move {
        let mut broker = bus.accept().await;
        broker.handshake(":1.5").await;
        broker
    });

    let connection = ConnectionBuilder::new()
        .address(&address)
        .auth_mechanisms(&[AuthMechanism::External])
        .connect()
        .await
        .unwrap();

    assert_eq!(connection.state(), ConnectionState::Connected);
    assert_eq!(connection.bus_name().as_deref(), Some(":1.5"));

    connection.close().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn method_call_roundtrip_and_remote_error() {
    let bus = TestBus::new();
    let address = bus.address.clone();

    let server = tokio::spawn(async move {
        let mut broker = bus.accept().await;
        broker.handshake(":1.9").await;

        // First call succeeds.
        let call = broker.read_frame().await;
        assert_eq!(call.member(), Some("Echo"));
        assert_eq!(call.body(), &[Value::String("ping".into())]);

        let reply = Message::method_return(call.serial())
            .with_body(vec![Value::String("pong".into())]);
        broker.send(reply, ":1.2").await;

        // Second call fails remotely.
        let call = broker.read_frame().await;
        let reply = Message::error("org.example.Nope", call.serial())
            .unwrap()
            .with_body(vec![Value::String("not today".into())]);
        broker.send(reply, ":1.2").await;
    });

    let connection = builder_for(&address).connect().await.unwrap();

    let call = Message::method_call(ObjectPath::new("/org/example").unwrap(), "Echo")
        .unwrap()
        .with_destination("org.example.Service")
        .unwrap()
        .with_body(vec![Value::String("ping".into())]);

    let reply = connection.send_request(call).await.unwrap();
    assert!(matches!(reply.kind(), MessageKind::MethodReturn { .. }));
    assert_eq!(reply.body(), &[Value::String("pong".into())]);
    assert_eq!(reply.sender(), Some(":1.2"));

    let call = Message::method_call(ObjectPath::new("/org/example").unwrap(), "Echo")
        .unwrap()
        .with_destination("org.example.Service")
        .unwrap();

    let error = connection.send_request(call).await.unwrap_err();
    assert_eq!(error.remote_error_name(), Some("org.example.Nope"));

    connection.close().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn method_call_times_out_and_late_reply_is_dropped() {
    let bus = TestBus::new();
    let address = bus.address.clone();

    let server = tokio::spawn(async move {
        let mut broker = bus.accept().await;
        broker.handshake(":1.3").await;

        // Hold the first reply until well past the deadline.
        let first = broker.read_frame().await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        let reply = Message::method_return(first.serial());
        broker.send(reply, ":1.2").await;

        // The follow-up call is answered promptly.
        let second = broker.read_frame().await;
        let reply = Message::method_return(second.serial())
            .with_body(vec![Value::Uint32(7)]);
        broker.send(reply, ":1.2").await;
    });

    let connection = builder_for(&address)
        .method_call_timeout(Duration::from_millis(200))
        .connect()
        .await
        .unwrap();

    let call = || {
        Message::method_call(ObjectPath::new("/x").unwrap(), "Slow")
            .unwrap()
            .with_destination("org.example.Service")
            .unwrap()
    };

    let started = Instant::now();
    let error = connection.send_request(call()).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(error.is_timeout(), "unexpected error: {error}");
    assert!(elapsed >= Duration::from_millis(200), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(450), "{elapsed:?}");

    // The late reply must not disturb the next call.
    let reply = connection.send_request(call()).await.unwrap();
    assert_eq!(reply.body(), &[Value::Uint32(7)]);

    connection.close().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn per_call_timeout_overrides_default() {
    let bus = TestBus::new();
    let address = bus.address.clone();

    let server = tokio::spawn(async move {
        let mut broker = bus.accept().await;
        broker.handshake(":1.3").await;
        let _ = broker.read_frame().await;
        // Never reply; keep the connection alive until the client closes.
        tokio::time::sleep(Duration::from_secs(2)).await;
    });

    let connection = builder_for(&address)
        .method_call_timeout(Duration::from_secs(30))
        .connect()
        .await
        .unwrap();

    let call = Message::method_call(ObjectPath::new("/x").unwrap(), "Slow")
        .unwrap()
        .with_destination("org.example.Service")
        .unwrap()
        .with_timeout(Duration::from_millis(100));

    let started = Instant::now();
    let error = connection.send_request(call).await.unwrap_err();

    assert!(error.is_timeout());
    assert!(started.elapsed() < Duration::from_secs(2));

    connection.close().await.unwrap();
    server.abort();
}

#[tokio::test]
async fn disconnect_fails_every_pending_call() {
    let bus = TestBus::new();
    let address = bus.address.clone();

    let server = tokio::spawn(async move {
        let mut broker = bus.accept().await;
        broker.handshake(":1.4").await;

        // Swallow three calls, then vanish.
        for _ in 0..3 {
            let _ = broker.read_frame().await;
        }
    });

    let connection = builder_for(&address)
        .auto_reconnect(false)
        .method_call_timeout(Duration::from_secs(30))
        .connect()
        .await
        .unwrap();

    let call = |member: &str| {
        Message::method_call(ObjectPath::new("/x").unwrap(), member)
            .unwrap()
            .with_destination("org.example.Service")
            .unwrap()
    };

    let first = connection.send_request(call("A"));
    let second = connection.send_request(call("B"));
    let third = connection.send_request(call("C"));

    server.await.unwrap();

    assert!(first.await.unwrap_err().is_disconnected());
    assert!(second.await.unwrap_err().is_disconnected());
    assert!(third.await.unwrap_err().is_disconnected());

    // With reconnection disabled the connection ends up failed, and new
    // requests fail fast.
    tokio::time::timeout(Duration::from_secs(2), async {
        while connection.state() != ConnectionState::Failed {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let error = connection.send_request(call("D")).await.unwrap_err();
    assert!(error.is_disconnected());
}

#[tokio::test]
async fn reconnects_with_fresh_bus_name() {
    let bus = TestBus::new();
    let address = bus.address.clone();

    let events = Arc::new(Mutex::new(Vec::new()));

    let server = tokio::spawn(async move {
        let mut broker = bus.accept().await;
        broker.handshake(":1.5").await;
        drop(broker);

        let mut broker = bus.accept().await;
        broker.handshake(":1.6").await;

        // Stay alive until the client is done.
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let connection = builder_for(&address)
        .reconnect_policy(ReconnectPolicy {
            initial_delay: Duration::from_millis(50),
            multiplier: 2.0,
            max_delay: Duration::from_secs(1),
            jitter: 0.0,
            max_attempts: 5,
        })
        .connect()
        .await
        .unwrap();

    {
        let events = events.clone();
        connection.add_connection_event_listener(move |event| {
            events.lock().unwrap().push(format!("{event:?}"));
        });
    }

    assert_eq!(connection.bus_name().as_deref(), Some(":1.5"));

    tokio::time::timeout(Duration::from_secs(5), async {
        while connection.bus_name().as_deref() != Some(":1.6") {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("reconnect never completed");

    assert_eq!(connection.state(), ConnectionState::Connected);

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            {
                let events = events.lock().unwrap();

                if events.iter().any(|e| e.contains("ReconnectionSuccess")) {
                    break;
                }
            }

            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("no ReconnectionSuccess event");

    connection.close().await.unwrap();
    server.abort();
}

struct SignalProbe {
    tx: mpsc::UnboundedSender<(String, String, Vec<Value>)>,
    propagate: bool,
}

impl Handler for SignalProbe {
    fn on_inbound(&self, ctx: &mut Context<'_>, message: InboundMessage) {
        let thread = std::thread::current()
            .name()
            .unwrap_or_default()
            .to_owned();

        let _ = self.tx.send((
            thread,
            message.sender().unwrap_or_default().to_owned(),
            message.body().to_vec(),
        ));

        if self.propagate {
            ctx.propagate_inbound(message);
        }
    }
}

#[tokio::test]
async fn signals_reach_handlers_on_the_app_executor() {
    let bus = TestBus::new();
    let address = bus.address.clone();

    let server = tokio::spawn(async move {
        let mut broker = bus.accept().await;
        broker.handshake(":1.8").await;

        // Wait for the client to announce its handlers are in place.
        let ready = broker.read_frame().await;
        assert_eq!(ready.member(), Some("Ready"));

        let signal = Message::signal(
            ObjectPath::new("/x").unwrap(),
            "i.f",
            "S",
        )
        .unwrap()
        .with_body(vec![Value::String("hi".into())]);
        broker.send(signal, ":1.7").await;

        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let connection = builder_for(&address).connect().await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();

    connection
        .pipeline()
        .add_last(
            "probe-1",
            SignalProbe {
                tx: tx.clone(),
                propagate: true,
            },
        )
        .unwrap();
    connection
        .pipeline()
        .add_last(
            "probe-2",
            SignalProbe {
                tx,
                propagate: false,
            },
        )
        .unwrap();

    let ready = Message::signal(ObjectPath::new("/x").unwrap(), "i.f", "Ready").unwrap();
    connection.send(ready).await.unwrap();

    for expected_probe in 0..2 {
        let (thread, sender, body) =
            tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("signal never delivered")
                .unwrap();

        assert!(
            thread.starts_with("pipebus-app"),
            "handler {expected_probe} ran on `{thread}`"
        );
        assert_eq!(sender, ":1.7");
        assert_eq!(body, vec![Value::String("hi".into())]);
    }

    // The second handler consumed the signal; nothing else arrives.
    assert!(rx.try_recv().is_err());

    connection.close().await.unwrap();
    server.abort();
}

#[tokio::test]
async fn send_acknowledges_completed_writes() {
    let bus = TestBus::new();
    let address = bus.address.clone();

    let server = tokio::spawn(async move {
        let mut broker = bus.accept().await;
        broker.handshake(":1.2").await;

        let signal = broker.read_frame().await;
        assert_eq!(signal.member(), Some("Changed"));
        assert!(matches!(signal.kind(), MessageKind::Signal { .. }));
    });

    let connection = builder_for(&address).connect().await.unwrap();

    let signal = Message::signal(ObjectPath::new("/x").unwrap(), "i.f", "Changed").unwrap();
    connection.send(signal).await.unwrap();

    server.await.unwrap();
    connection.close().await.unwrap();
}

struct OutboundStamp;

impl Handler for OutboundStamp {
    fn on_outbound(&self, ctx: &mut Context<'_>, message: Message, promise: WritePromise) {
        // Stamp every outbound call with a destination when missing.
        let message = match message.destination() {
            Some(..) => message,
            None => message.with_destination("org.example.Default").unwrap(),
        };

        ctx.propagate_outbound(message, promise);
    }
}

#[tokio::test]
async fn outbound_handlers_can_rewrite_messages() {
    let bus = TestBus::new();
    let address = bus.address.clone();

    let server = tokio::spawn(async move {
        let mut broker = bus.accept().await;
        broker.handshake(":1.2").await;

        let call = broker.read_frame().await;
        assert_eq!(call.destination(), Some("org.example.Default"));

        let reply = Message::method_return(call.serial());
        broker.send(reply, ":1.2").await;
    });

    let connection = builder_for(&address).connect().await.unwrap();
    connection
        .pipeline()
        .add_last("stamp", OutboundStamp)
        .unwrap();

    let call = Message::method_call(ObjectPath::new("/x").unwrap(), "M").unwrap();
    connection.send_request(call).await.unwrap();

    server.await.unwrap();
    connection.close().await.unwrap();
}

#[tokio::test]
async fn health_probe_pings_the_bus() {
    let bus = TestBus::new();
    let address = bus.address.clone();

    let (ping_tx, mut ping_rx) = mpsc::unbounded_channel();

    let server = tokio::spawn(async move {
        let mut broker = bus.accept().await;
        broker.handshake(":1.2").await;

        loop {
            let call = broker.read_frame().await;
            assert_eq!(call.member(), Some("Ping"));
            assert_eq!(call.interface(), Some("org.freedesktop.DBus.Peer"));
            let _ = ping_tx.send(());

            let reply = Message::method_return(call.serial());
            broker.send(reply, "org.freedesktop.DBus").await;
        }
    });

    let connection = builder_for(&address)
        .health_check_interval(Duration::from_millis(100))
        .connect()
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), ping_rx.recv())
        .await
        .expect("no ping observed")
        .unwrap();

    assert_eq!(connection.state(), ConnectionState::Connected);

    connection.close().await.unwrap();
    server.abort();
}

fn builder_for(address: &str) -> ConnectionBuilder {
    ConnectionBuilder::new()
        .address(address)
        .auth_mechanisms(&[AuthMechanism::External])
        .connect_timeout(Duration::from_secs(5))
}

use std::time::Duration;

use crate::address::BusAddress;
use crate::bridge::BackpressurePolicy;
use crate::connection::Connection;
use crate::error::Result;
use crate::executor::Executors;
use crate::sasl::{Anonymous, CookieSha1, External, Mechanism, SaslClient};

/// An authentication mechanism the connection may offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum AuthMechanism {
    /// `EXTERNAL`: transport-level credentials, the default on Unix
    /// sockets.
    External,
    /// `DBUS_COOKIE_SHA1`: prove access to the user's cookie keyring.
    CookieSha1,
    /// `ANONYMOUS`: no identity at all.
    Anonymous,
}

/// The exponential backoff applied between reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first attempt.
    pub initial_delay: Duration,
    /// Factor applied to the delay after every failed attempt.
    pub multiplier: f64,
    /// Upper bound on the delay.
    pub max_delay: Duration,
    /// Fraction of the delay randomized away, `0.0..=1.0`.
    pub jitter: f64,
    /// Give up after this many failed attempts.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: 0.1,
            max_attempts: 10,
        }
    }
}

enum Target {
    Session,
    System,
    Address(String),
}

pub(crate) struct Config {
    pub(crate) address: BusAddress,
    pub(crate) auth: Vec<AuthMechanism>,
    pub(crate) connect_timeout: Duration,
    pub(crate) method_call_timeout: Duration,
    pub(crate) health_interval: Option<Duration>,
    pub(crate) health_grace: u32,
    pub(crate) auto_reconnect: bool,
    pub(crate) reconnect: ReconnectPolicy,
    pub(crate) backpressure: BackpressurePolicy,
    pub(crate) close_grace: Duration,
}

impl Config {
    pub(crate) fn sasl_client(&self) -> SaslClient {
        let mechanisms = self
            .auth
            .iter()
            .map(|mechanism| -> Box<dyn Mechanism> {
                match mechanism {
                    AuthMechanism::External => Box::new(External::new()),
                    AuthMechanism::CookieSha1 => Box::new(CookieSha1::new()),
                    AuthMechanism::Anonymous => Box::new(Anonymous::new()),
                }
            })
            .collect();

        SaslClient::new(mechanisms)
    }
}

/// Builder of a [`Connection`].
///
/// # Examples
///
/// ```no_run
/// use pipebus::ConnectionBuilder;
///
/// # #[tokio::main] async fn main() -> pipebus::Result<()> {
/// let connection = ConnectionBuilder::new()
///     .session_bus()
///     .connect()
///     .await?;
/// # Ok(()) }
/// ```
pub struct ConnectionBuilder {
    target: Target,
    auth: Vec<AuthMechanism>,
    connect_timeout: Duration,
    method_call_timeout: Duration,
    health_interval: Option<Duration>,
    health_grace: u32,
    auto_reconnect: bool,
    reconnect: ReconnectPolicy,
    backpressure: BackpressurePolicy,
    app_workers: Option<usize>,
    close_grace: Duration,
}

impl ConnectionBuilder {
    /// Construct a new builder targeting the session bus.
    pub fn new() -> Self {
        Self {
            target: Target::Session,
            auth: vec![AuthMechanism::External, AuthMechanism::CookieSha1],
            connect_timeout: Duration::from_secs(10),
            method_call_timeout: Duration::from_secs(25),
            health_interval: None,
            health_grace: 3,
            auto_reconnect: true,
            reconnect: ReconnectPolicy::default(),
            backpressure: BackpressurePolicy::Unbounded,
            app_workers: None,
            close_grace: Duration::from_secs(5),
        }
    }

    /// Connect to the session bus (default).
    pub fn session_bus(mut self) -> Self {
        self.target = Target::Session;
        self
    }

    /// Connect to the system bus.
    pub fn system_bus(mut self) -> Self {
        self.target = Target::System;
        self
    }

    /// Connect to an explicit address such as `unix:path=/tmp/bus` or
    /// `tcp:host=localhost,port=8087`.
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.target = Target::Address(address.into());
        self
    }

    /// The authentication mechanisms to offer, in order.
    pub fn auth_mechanisms(mut self, mechanisms: &[AuthMechanism]) -> Self {
        self.auth = mechanisms.to_vec();
        self
    }

    /// Deadline for the whole connect sequence, transport open through
    /// `Hello`.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Default deadline for method-call replies. Individual calls may
    /// override it via [`Message::with_timeout`].
    ///
    /// [`Message::with_timeout`]: crate::Message::with_timeout
    pub fn method_call_timeout(mut self, timeout: Duration) -> Self {
        self.method_call_timeout = timeout;
        self
    }

    /// Probe the bus with `org.freedesktop.DBus.Peer.Ping` at this
    /// interval. Disabled by default.
    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.health_interval = Some(interval);
        self
    }

    /// How many consecutive probe failures to tolerate before forcing a
    /// reconnect.
    pub fn health_check_grace(mut self, grace: u32) -> Self {
        self.health_grace = grace;
        self
    }

    /// Enable or disable automatic reconnection. Enabled by default.
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// The backoff policy applied between reconnect attempts.
    pub fn reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// What to do when inbound dispatch falls behind.
    pub fn backpressure(mut self, policy: BackpressurePolicy) -> Self {
        self.backpressure = policy;
        self
    }

    /// Number of application executor workers. Defaults to half the
    /// available cores, at least one.
    pub fn app_workers(mut self, workers: usize) -> Self {
        self.app_workers = Some(workers.max(1));
        self
    }

    /// How long `close` waits for in-flight dispatch to settle.
    pub fn close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }

    /// Open the transport, authenticate, perform the `Hello` exchange and
    /// return the live connection.
    pub async fn connect(self) -> Result<Connection> {
        let address = match &self.target {
            Target::Session => BusAddress::session()?,
            Target::System => BusAddress::system()?,
            Target::Address(address) => BusAddress::parse(address)?,
        };

        let config = Config {
            address,
            auth: self.auth,
            connect_timeout: self.connect_timeout,
            method_call_timeout: self.method_call_timeout,
            health_interval: self.health_interval,
            health_grace: self.health_grace,
            auto_reconnect: self.auto_reconnect,
            reconnect: self.reconnect,
            backpressure: self.backpressure,
            close_grace: self.close_grace,
        };

        let workers = self
            .app_workers
            .unwrap_or_else(Executors::default_app_workers);

        Connection::establish(config, workers).await
    }
}

impl Default for ConnectionBuilder {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

//! Stream transports underneath a connection.

use std::io;

use tokio::io::{Interest, Ready};
use tokio::net::{TcpStream, UnixStream};
use tracing::debug;

use crate::address::{AddressFamily, BusAddress};
use crate::error::{Error, ErrorKind, Result};

/// A connected stream transport.
///
/// All I/O goes through readiness plus `try_read`/`try_write`, so the
/// driver stays in control of buffering and never parks a thread.
pub(crate) enum Transport {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Transport {
    /// Open a transport for the given address.
    pub(crate) async fn connect(address: &BusAddress) -> Result<Self> {
        match address {
            BusAddress::Unix { path } => {
                debug!(path = %path.display(), "connecting unix transport");
                Ok(Transport::Unix(UnixStream::connect(path).await?))
            }
            BusAddress::UnixAbstract { name } => Self::connect_abstract(name).await,
            BusAddress::Tcp { host, port, family } => {
                debug!(host = host.as_str(), port, "connecting tcp transport");

                let addrs = tokio::net::lookup_host((host.as_str(), *port)).await?;

                let mut last_err = None;

                for addr in addrs {
                    let matches_family = match family {
                        Some(AddressFamily::Ipv4) => addr.is_ipv4(),
                        Some(AddressFamily::Ipv6) => addr.is_ipv6(),
                        None => true,
                    };

                    if !matches_family {
                        continue;
                    }

                    match TcpStream::connect(addr).await {
                        Ok(stream) => return Ok(Transport::Tcp(stream)),
                        Err(error) => last_err = Some(error),
                    }
                }

                Err(match last_err {
                    Some(error) => error.into(),
                    None => Error::new(ErrorKind::UnsupportedTransport(
                        "tcp: no address matched the requested family".into(),
                    )),
                })
            }
        }
    }

    #[cfg(target_os = "linux")]
    async fn connect_abstract(name: &str) -> Result<Self> {
        use std::os::linux::net::SocketAddrExt;
        use std::os::unix::net::{SocketAddr, UnixStream as StdUnixStream};

        debug!(name, "connecting abstract unix transport");

        let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
        let stream = StdUnixStream::connect_addr(&addr)?;
        stream.set_nonblocking(true)?;
        Ok(Transport::Unix(UnixStream::from_std(stream)?))
    }

    #[cfg(not(target_os = "linux"))]
    async fn connect_abstract(_: &str) -> Result<Self> {
        Err(Error::new(ErrorKind::UnsupportedTransport(
            "unix:abstract is only available on Linux".into(),
        )))
    }

    /// Wait until the transport is ready for any of the given interests.
    pub(crate) async fn ready(&self, interest: Interest) -> io::Result<Ready> {
        match self {
            Transport::Unix(stream) => stream.ready(interest).await,
            Transport::Tcp(stream) => stream.ready(interest).await,
        }
    }

    /// Try to read into `buf`, returning `WouldBlock` when not readable.
    pub(crate) fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Unix(stream) => stream.try_read(buf),
            Transport::Tcp(stream) => stream.try_read(buf),
        }
    }

    /// Try to write `buf`, returning `WouldBlock` when not writable.
    pub(crate) fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Unix(stream) => stream.try_write(buf),
            Transport::Tcp(stream) => stream.try_write(buf),
        }
    }
}

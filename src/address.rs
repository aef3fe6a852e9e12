//! Bus address parsing and discovery.

use std::env;
use std::path::PathBuf;

use thiserror::Error;

const ENV_SESSION_BUS: &str = "DBUS_SESSION_BUS_ADDRESS";
const ENV_SYSTEM_BUS: &str = "DBUS_SYSTEM_BUS_ADDRESS";
const DEFAULT_SYSTEM_BUS: &str = "unix:path=/var/run/dbus/system_bus_socket";

/// Errors raised when parsing or discovering a bus address.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum AddressError {
    #[error("invalid d-bus address `{0}`")]
    Invalid(Box<str>),
    #[error("unsupported transport `{0}`")]
    UnsupportedTransport(Box<str>),
    #[error("invalid port in address `{0}`")]
    InvalidPort(Box<str>),
    #[error("no session bus address configured")]
    MissingSessionBus,
}

/// The socket family requested in a TCP address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    /// IPv4 only.
    Ipv4,
    /// IPv6 only.
    Ipv6,
}

/// A parsed client bus address.
///
/// # Examples
///
/// ```
/// use pipebus::BusAddress;
///
/// let address = BusAddress::parse("unix:path=/var/run/dbus/system_bus_socket")?;
/// assert!(matches!(address, BusAddress::Unix { .. }));
///
/// let address = BusAddress::parse("tcp:host=localhost,port=8087,family=ipv4")?;
/// assert!(matches!(address, BusAddress::Tcp { port: 8087, .. }));
/// # Ok::<_, pipebus::AddressError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusAddress {
    /// A Unix-domain stream socket bound to a filesystem path.
    Unix {
        /// Path of the socket file.
        path: PathBuf,
    },
    /// A Unix-domain socket in the abstract namespace.
    UnixAbstract {
        /// The abstract name, without the leading nul.
        name: String,
    },
    /// A TCP stream socket.
    Tcp {
        /// DNS name or IP address of the server.
        host: String,
        /// The TCP port.
        port: u16,
        /// Optional socket family restriction.
        family: Option<AddressFamily>,
    },
}

impl BusAddress {
    /// Parse a client address of the form `transport:key=value,...`.
    pub fn parse(address: &str) -> Result<Self, AddressError> {
        let invalid = || AddressError::Invalid(address.into());

        let (transport, rest) = address.split_once(':').ok_or_else(invalid)?;

        let mut pairs = Vec::new();

        if !rest.is_empty() {
            for pair in rest.split(',') {
                pairs.push(pair.split_once('=').ok_or_else(invalid)?);
            }
        }

        let get = |key: &str| pairs.iter().find(|(k, _)| *k == key).map(|(_, v)| *v);

        match transport {
            "unix" => {
                if let Some(path) = get("path") {
                    return Ok(BusAddress::Unix {
                        path: PathBuf::from(path),
                    });
                }

                if let Some(name) = get("abstract") {
                    return Ok(BusAddress::UnixAbstract { name: name.into() });
                }

                Err(invalid())
            }
            "tcp" => {
                let host = get("host").ok_or_else(invalid)?;
                let port = get("port")
                    .and_then(|p| p.parse().ok())
                    .ok_or_else(|| AddressError::InvalidPort(address.into()))?;

                let family = match get("family") {
                    Some("ipv4") => Some(AddressFamily::Ipv4),
                    Some("ipv6") => Some(AddressFamily::Ipv6),
                    Some(..) => return Err(invalid()),
                    None => None,
                };

                Ok(BusAddress::Tcp {
                    host: host.into(),
                    port,
                    family,
                })
            }
            other => Err(AddressError::UnsupportedTransport(other.into())),
        }
    }

    /// The session bus address, from `DBUS_SESSION_BUS_ADDRESS`.
    pub fn session() -> Result<Self, AddressError> {
        match env::var(ENV_SESSION_BUS) {
            Ok(address) => Self::parse(&address),
            Err(..) => Err(AddressError::MissingSessionBus),
        }
    }

    /// The system bus address, from `DBUS_SYSTEM_BUS_ADDRESS` with a
    /// fallback to the well-known default.
    pub fn system() -> Result<Self, AddressError> {
        match env::var(ENV_SYSTEM_BUS) {
            Ok(address) => Self::parse(&address),
            Err(..) => Self::parse(DEFAULT_SYSTEM_BUS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unix_path() {
        let address = BusAddress::parse("unix:path=/tmp/dbus-test").unwrap();
        assert_eq!(
            address,
            BusAddress::Unix {
                path: PathBuf::from("/tmp/dbus-test"),
            }
        );
    }

    #[test]
    fn parses_unix_abstract() {
        let address = BusAddress::parse("unix:abstract=/tmp/dbus-ABCDEF").unwrap();
        assert_eq!(
            address,
            BusAddress::UnixAbstract {
                name: "/tmp/dbus-ABCDEF".into(),
            }
        );
    }

    #[test]
    fn parses_tcp() {
        let address = BusAddress::parse("tcp:host=127.0.0.1,port=12345").unwrap();
        assert_eq!(
            address,
            BusAddress::Tcp {
                host: "127.0.0.1".into(),
                port: 12345,
                family: None,
            }
        );

        let address = BusAddress::parse("tcp:host=::1,port=1,family=ipv6").unwrap();
        assert_eq!(
            address,
            BusAddress::Tcp {
                host: "::1".into(),
                port: 1,
                family: Some(AddressFamily::Ipv6),
            }
        );
    }

    #[test]
    fn rejects_bad_addresses() {
        assert!(matches!(
            BusAddress::parse("unix"),
            Err(AddressError::Invalid(..))
        ));
        assert!(matches!(
            BusAddress::parse("unix:dir=/tmp"),
            Err(AddressError::Invalid(..))
        ));
        assert!(matches!(
            BusAddress::parse("tcp:host=x,port=notaport"),
            Err(AddressError::InvalidPort(..))
        ));
        assert!(matches!(
            BusAddress::parse("tcp:host=x,port=1,family=ipx"),
            Err(AddressError::Invalid(..))
        ));
        assert!(matches!(
            BusAddress::parse("launchd:env=DBUS"),
            Err(AddressError::UnsupportedTransport(..))
        ));
    }

    #[test]
    fn system_bus_default() {
        // Only exercise the fallback when the variable is absent, to avoid
        // mutating the test environment.
        if env::var(ENV_SYSTEM_BUS).is_err() {
            let address = BusAddress::system().unwrap();
            assert_eq!(
                address,
                BusAddress::Unix {
                    path: PathBuf::from("/var/run/dbus/system_bus_socket"),
                }
            );
        }
    }
}

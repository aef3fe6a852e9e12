//! Names and types of the `org.freedesktop.DBus` surface.

use std::fmt;

/// Well known destination name of the message bus.
pub const DESTINATION: &str = "org.freedesktop.DBus";

/// Interface implemented by the message bus.
pub const INTERFACE: &str = "org.freedesktop.DBus";

/// Object path of the message bus.
pub const PATH: &str = "/org/freedesktop/DBus";

/// Interface implemented by every peer, including the bus itself.
pub const PEER_INTERFACE: &str = "org.freedesktop.DBus.Peer";

/// The mandatory first call on every connection.
pub(crate) const HELLO: &str = "Hello";

/// The liveness probe member on [`PEER_INTERFACE`].
pub(crate) const PING: &str = "Ping";

macro_rules! u32_flags {
    (
        $(#[doc = $doc:literal])*
        $vis:vis enum $name:ident {
            $(
                $(#[$($variant_meta:meta)*])*
                $variant:ident = $value:expr
            ),* $(,)?
        }
    ) => {
        $(#[doc = $doc])*
        #[derive(Default, Clone, Copy, PartialEq, Eq)]
        #[repr(transparent)]
        $vis struct $name(pub(crate) u32);

        impl $name {
            $(
                $(#[$($variant_meta)*])*
                $vis const $variant: Self = Self($value);
            )*

            /// The raw flag bits.
            #[inline]
            $vis fn bits(self) -> u32 {
                self.0
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;

            #[inline]
            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#b})", stringify!($name), self.0)
            }
        }
    }
}

u32_flags! {
    /// Flags to a `RequestName` call.
    pub enum NameFlag {
        /// Allow another application to take the name over later.
        ALLOW_REPLACEMENT = 1,
        /// Replace the current owner if there is one and it allows
        /// replacement.
        REPLACE_EXISTING = 2,
        /// Fail instead of queueing when the name is taken.
        DO_NOT_QUEUE = 4,
    }
}

/// The reply to a `RequestName` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum NameReply {
    /// The caller is now the primary owner of the name.
    PrimaryOwner,
    /// The name is taken; the caller was placed in the wait queue.
    InQueue,
    /// The name is taken and `DO_NOT_QUEUE` was given.
    Exists,
    /// The caller already owns the name.
    AlreadyOwner,
    /// A reply value this client does not know.
    Other(u32),
}

impl From<u32> for NameReply {
    fn from(value: u32) -> Self {
        match value {
            1 => NameReply::PrimaryOwner,
            2 => NameReply::InQueue,
            3 => NameReply::Exists,
            4 => NameReply::AlreadyOwner,
            other => NameReply::Other(other),
        }
    }
}

/// The reply to a `ReleaseName` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ReleaseReply {
    /// The name was released.
    Released,
    /// The name does not exist on the bus.
    NonExistent,
    /// The caller is not the owner of the name.
    NotOwner,
    /// A reply value this client does not know.
    Other(u32),
}

impl From<u32> for ReleaseReply {
    fn from(value: u32) -> Self {
        match value {
            1 => ReleaseReply::Released,
            2 => ReleaseReply::NonExistent,
            3 => ReleaseReply::NotOwner,
            other => ReleaseReply::Other(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_flags_combine() {
        let flags = NameFlag::ALLOW_REPLACEMENT | NameFlag::DO_NOT_QUEUE;
        assert_eq!(flags.bits(), 5);
    }

    #[test]
    fn replies_decode() {
        assert_eq!(NameReply::from(1), NameReply::PrimaryOwner);
        assert_eq!(NameReply::from(9), NameReply::Other(9));
        assert_eq!(ReleaseReply::from(3), ReleaseReply::NotOwner);
    }
}

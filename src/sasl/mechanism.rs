use std::env;
use std::path::PathBuf;

use rand::RngCore;
use sha1::{Digest, Sha1};

use crate::error::{Error, ErrorKind, Result};
use crate::sasl::cookie;

/// A single SASL authentication mechanism.
///
/// Responses and challenges are raw bytes; the engine applies the hex
/// encoding the protocol wraps them in.
pub(crate) trait Mechanism: Send {
    /// The mechanism name as it appears on the `AUTH` line.
    fn name(&self) -> &'static str;

    /// The initial response sent along with `AUTH`, if any.
    fn initial_response(&mut self) -> Result<Option<Vec<u8>>>;

    /// Answer a `DATA` challenge from the server.
    fn step(&mut self, challenge: &[u8]) -> Result<Vec<u8>>;
}

fn uid_string() -> String {
    // SAFETY: getuid cannot fail.
    let uid = unsafe { libc::getuid() };
    uid.to_string()
}

/// EXTERNAL: the transport already proves our identity, the initial
/// response is the numeric uid.
pub(crate) struct External {
    id: String,
}

impl External {
    pub(crate) fn new() -> Self {
        Self { id: uid_string() }
    }

    #[cfg(test)]
    pub(crate) fn with_id(id: &str) -> Self {
        Self { id: id.into() }
    }
}

impl Mechanism for External {
    fn name(&self) -> &'static str {
        "EXTERNAL"
    }

    fn initial_response(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(Some(self.id.clone().into_bytes()))
    }

    fn step(&mut self, _: &[u8]) -> Result<Vec<u8>> {
        Err(Error::new(ErrorKind::SaslProtocol(
            "unexpected challenge for EXTERNAL".into(),
        )))
    }
}

/// DBUS_COOKIE_SHA1: prove access to a cookie file in the user's keyring
/// directory.
pub(crate) struct CookieSha1 {
    username: String,
    keyring_dir: PathBuf,
    fixed_challenge: Option<String>,
}

impl CookieSha1 {
    pub(crate) fn new() -> Self {
        let username = env::var("USER").unwrap_or_else(|_| uid_string());

        let keyring_dir = env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_default()
            .join(".dbus-keyrings");

        Self {
            username,
            keyring_dir,
            fixed_challenge: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_keyring_dir(mut self, dir: PathBuf) -> Self {
        self.keyring_dir = dir;
        self
    }

    #[cfg(test)]
    pub(crate) fn with_fixed_challenge(mut self, challenge: &str) -> Self {
        self.fixed_challenge = Some(challenge.into());
        self
    }

    fn client_challenge(&self) -> String {
        if let Some(fixed) = &self.fixed_challenge {
            return fixed.clone();
        }

        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    }
}

impl Mechanism for CookieSha1 {
    fn name(&self) -> &'static str {
        "DBUS_COOKIE_SHA1"
    }

    fn initial_response(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(Some(self.username.clone().into_bytes()))
    }

    fn step(&mut self, challenge: &[u8]) -> Result<Vec<u8>> {
        let challenge = std::str::from_utf8(challenge)
            .map_err(|_| Error::new(ErrorKind::SaslProtocol("challenge is not UTF-8".into())))?;

        let mut parts = challenge.split_ascii_whitespace();

        let (Some(context), Some(cookie_id), Some(server_challenge), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::new(ErrorKind::SaslProtocol(
                "malformed DBUS_COOKIE_SHA1 challenge".into(),
            )));
        };

        let cookie = cookie::lookup(&self.keyring_dir, context, cookie_id)?;
        let client_challenge = self.client_challenge();

        let mut hasher = Sha1::new();
        hasher.update(server_challenge.as_bytes());
        hasher.update(b":");
        hasher.update(client_challenge.as_bytes());
        hasher.update(b":");
        hasher.update(cookie.as_bytes());
        let digest = hex::encode(hasher.finalize());

        Ok(format!("{client_challenge} {digest}").into_bytes())
    }
}

/// ANONYMOUS: no identity at all, the initial response is a free-form
/// trace string.
pub(crate) struct Anonymous {
    trace: String,
}

impl Anonymous {
    pub(crate) fn new() -> Self {
        Self {
            trace: String::new(),
        }
    }
}

impl Mechanism for Anonymous {
    fn name(&self) -> &'static str {
        "ANONYMOUS"
    }

    fn initial_response(&mut self) -> Result<Option<Vec<u8>>> {
        if self.trace.is_empty() {
            return Ok(None);
        }

        Ok(Some(self.trace.clone().into_bytes()))
    }

    fn step(&mut self, _: &[u8]) -> Result<Vec<u8>> {
        Err(Error::new(ErrorKind::SaslProtocol(
            "unexpected challenge for ANONYMOUS".into(),
        )))
    }
}

//! SASL authentication, the textual dialogue D-Bus performs before any
//! frame is exchanged.
//!
//! The client sends a single NUL byte, then CR-LF terminated command lines.
//! Payloads inside lines are lowercase hex.

pub(crate) use self::mechanism::{Anonymous, CookieSha1, External, Mechanism};
mod mechanism;

mod cookie;

use tracing::{debug, trace};

use crate::error::{Error, ErrorKind, Result};

/// What the engine wants done after consuming one server line.
#[derive(Debug)]
pub(crate) struct SaslOutput {
    /// Complete lines to write back, including terminators.
    pub(crate) send: Vec<Vec<u8>>,
    /// Set when authentication concluded; carries the server GUID.
    pub(crate) done: Option<Box<str>>,
}

impl SaslOutput {
    fn send(line: Vec<u8>) -> Self {
        Self {
            send: vec![line],
            done: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitOkOrData,
    WaitRejected,
    Done,
}

/// The client side of the SASL dialogue.
///
/// The engine is transport-agnostic: it consumes single lines (without
/// terminators) and produces lines to send.
pub(crate) struct SaslClient {
    mechanisms: Vec<Box<dyn Mechanism>>,
    current: usize,
    state: State,
    last_error: Option<Error>,
}

impl SaslClient {
    pub(crate) fn new(mechanisms: Vec<Box<dyn Mechanism>>) -> Self {
        Self {
            mechanisms,
            current: 0,
            state: State::WaitOkOrData,
            last_error: None,
        }
    }

    /// The `AUTH` line for the current mechanism.
    pub(crate) fn auth_line(&mut self) -> Result<Vec<u8>> {
        let Some(mechanism) = self.mechanisms.get_mut(self.current) else {
            return Err(Error::new(ErrorKind::NoMechanismAvailable));
        };

        let mut line = Vec::new();
        line.extend_from_slice(b"AUTH ");
        line.extend_from_slice(mechanism.name().as_bytes());

        if let Some(initial) = mechanism.initial_response()? {
            line.push(b' ');
            line.extend_from_slice(hex::encode(initial).as_bytes());
        }

        line.extend_from_slice(b"\r\n");
        self.state = State::WaitOkOrData;
        Ok(line)
    }

    /// Consume one server line, without its CR-LF terminator.
    pub(crate) fn handle_line(&mut self, line: &[u8]) -> Result<SaslOutput> {
        let line = trim_line(line);
        trace!(line = %String::from_utf8_lossy(line), "sasl server line");

        let (command, rest) = match line.iter().position(|&b| b == b' ') {
            Some(n) => (&line[..n], &line[n + 1..]),
            None => (line, &[][..]),
        };

        match (self.state, command) {
            (State::WaitOkOrData, b"OK") => {
                let guid = std::str::from_utf8(rest)
                    .map_err(|_| protocol_error("GUID is not UTF-8"))?;

                debug!(mechanism = self.mechanism_name(), "authentication accepted");
                self.state = State::Done;

                Ok(SaslOutput {
                    send: vec![b"BEGIN\r\n".to_vec()],
                    done: Some(guid.into()),
                })
            }
            (State::WaitOkOrData, b"DATA") => {
                let challenge = hex::decode(rest)
                    .map_err(|_| protocol_error("DATA payload is not valid hex"))?;

                match self.step(&challenge) {
                    Ok(response) => {
                        let mut line = Vec::new();
                        line.extend_from_slice(b"DATA ");
                        line.extend_from_slice(hex::encode(response).as_bytes());
                        line.extend_from_slice(b"\r\n");
                        Ok(SaslOutput::send(line))
                    }
                    Err(error) => {
                        debug!(
                            mechanism = self.mechanism_name(),
                            %error,
                            "mechanism failed, canceling"
                        );
                        self.last_error = Some(error);
                        self.state = State::WaitRejected;
                        Ok(SaslOutput::send(b"CANCEL\r\n".to_vec()))
                    }
                }
            }
            (State::WaitOkOrData, b"ERROR") => {
                self.state = State::WaitRejected;
                Ok(SaslOutput::send(b"CANCEL\r\n".to_vec()))
            }
            (State::WaitOkOrData | State::WaitRejected, b"REJECTED") => self.next_mechanism(),
            (_, b"AGREE_UNIX_FD") => {
                // Never requested, see the connection documentation.
                Err(protocol_error("unsolicited AGREE_UNIX_FD"))
            }
            (state, command) => Err(protocol_error(format!(
                "unexpected `{}` in state {state:?}",
                String::from_utf8_lossy(command)
            ))),
        }
    }

    fn mechanism_name(&self) -> &'static str {
        self.mechanisms
            .get(self.current)
            .map(|m| m.name())
            .unwrap_or("<none>")
    }

    fn step(&mut self, challenge: &[u8]) -> Result<Vec<u8>> {
        let Some(mechanism) = self.mechanisms.get_mut(self.current) else {
            return Err(Error::new(ErrorKind::NoMechanismAvailable));
        };

        mechanism.step(challenge)
    }

    fn next_mechanism(&mut self) -> Result<SaslOutput> {
        self.current += 1;

        if self.current >= self.mechanisms.len() {
            return Err(self
                .last_error
                .take()
                .unwrap_or_else(|| Error::new(ErrorKind::AuthRejected)));
        }

        debug!(mechanism = self.mechanism_name(), "trying next mechanism");
        Ok(SaslOutput::send(self.auth_line()?))
    }
}

fn protocol_error(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::SaslProtocol(message.into().into_boxed_str()))
}

fn trim_line(mut line: &[u8]) -> &[u8] {
    while let [rest @ .., b'\r' | b'\n'] = line {
        line = rest;
    }

    line
}

#[cfg(test)]
mod tests {
    use sha1::{Digest, Sha1};

    use super::*;

    fn client(mechanisms: Vec<Box<dyn Mechanism>>) -> SaslClient {
        SaslClient::new(mechanisms)
    }

    #[test]
    fn external_dialogue() {
        let mut sasl = client(vec![Box::new(External::with_id("1000"))]);

        assert_eq!(sasl.auth_line().unwrap(), b"AUTH EXTERNAL 31303030\r\n");

        let out = sasl.handle_line(b"OK 1234deadbeef\r\n").unwrap();
        assert_eq!(out.send, vec![b"BEGIN\r\n".to_vec()]);
        assert_eq!(out.done.as_deref(), Some("1234deadbeef"));
    }

    #[test]
    fn external_rejects_challenges() {
        let mut sasl = client(vec![Box::new(External::with_id("1000"))]);
        sasl.auth_line().unwrap();

        // The mechanism cannot answer, so the engine cancels and the final
        // REJECTED surfaces the failure.
        let out = sasl.handle_line(b"DATA 6162").unwrap();
        assert_eq!(out.send, vec![b"CANCEL\r\n".to_vec()]);

        let err = sasl.handle_line(b"REJECTED EXTERNAL").unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::SaslProtocol(..)));
    }

    #[cfg(unix)]
    #[test]
    fn cookie_dialogue_matches_reference() {
        use std::fs;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let keyring = dir.path().join("org_freedesktop_general");
        fs::write(&keyring, "42 1700000000 deadbeef\n").unwrap();
        fs::set_permissions(&keyring, fs::Permissions::from_mode(0o600)).unwrap();

        let client_challenge = "0123456789abcdef0123456789abcdef";
        let mechanism = CookieSha1::new()
            .with_keyring_dir(dir.path().to_path_buf())
            .with_fixed_challenge(client_challenge);

        let mut sasl = client(vec![Box::new(mechanism)]);
        sasl.auth_line().unwrap();

        let challenge = hex::encode("org_freedesktop_general 42 abc123");
        let out = sasl
            .handle_line(format!("DATA {challenge}").as_bytes())
            .unwrap();

        let mut hasher = Sha1::new();
        hasher.update(format!("abc123:{client_challenge}:deadbeef").as_bytes());
        let expected = format!("{client_challenge} {}", hex::encode(hasher.finalize()));

        let expected_line = format!("DATA {}\r\n", hex::encode(expected));
        assert_eq!(out.send, vec![expected_line.into_bytes()]);

        let out = sasl.handle_line(b"OK 00112233").unwrap();
        assert_eq!(out.done.as_deref(), Some("00112233"));
    }

    #[test]
    fn rejected_advances_to_next_mechanism() {
        let mut sasl = client(vec![
            Box::new(External::with_id("0")),
            Box::new(Anonymous::new()),
        ]);

        assert_eq!(sasl.auth_line().unwrap(), b"AUTH EXTERNAL 30\r\n");

        let out = sasl
            .handle_line(b"REJECTED DBUS_COOKIE_SHA1 ANONYMOUS")
            .unwrap();
        assert_eq!(out.send, vec![b"AUTH ANONYMOUS\r\n".to_vec()]);

        let err = sasl.handle_line(b"REJECTED ANONYMOUS").unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::AuthRejected));
    }

    #[test]
    fn error_line_cancels() {
        let mut sasl = client(vec![
            Box::new(External::with_id("0")),
            Box::new(External::with_id("1")),
        ]);
        sasl.auth_line().unwrap();

        let out = sasl.handle_line(b"ERROR unable to parse").unwrap();
        assert_eq!(out.send, vec![b"CANCEL\r\n".to_vec()]);

        let out = sasl.handle_line(b"REJECTED EXTERNAL").unwrap();
        assert_eq!(out.send, vec![b"AUTH EXTERNAL 31\r\n".to_vec()]);
    }

    #[test]
    fn unexpected_commands_fail() {
        let mut sasl = client(vec![Box::new(External::with_id("0"))]);
        sasl.auth_line().unwrap();

        assert!(sasl.handle_line(b"AGREE_UNIX_FD").is_err());
        assert!(sasl.handle_line(b"WAT").is_err());
    }
}

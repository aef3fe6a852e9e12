//! The DBUS_COOKIE_SHA1 keyring.

use std::fs;
use std::path::Path;

use crate::error::{Error, ErrorKind, Result};

fn unavailable(reason: impl Into<Box<str>>) -> Error {
    Error::new(ErrorKind::CookieUnavailable(reason.into()))
}

/// Look up a cookie value in `<dir>/<context>`.
///
/// Each keyring line is `<id> <creation-time> <cookie-value>`. The context
/// is server-controlled, so it must not be able to escape the keyring
/// directory, and the file itself must not be readable by anyone else.
pub(crate) fn lookup(dir: &Path, context: &str, cookie_id: &str) -> Result<String> {
    if context.is_empty() || context.contains('/') || context.contains("..") {
        return Err(unavailable(format!("invalid cookie context `{context}`")));
    }

    let path = dir.join(context);

    let metadata = fs::metadata(&path)
        .map_err(|error| unavailable(format!("{}: {error}", path.display())))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;

        if metadata.mode() & 0o077 != 0 {
            return Err(unavailable(format!(
                "{} is readable by other users",
                path.display()
            )));
        }
    }

    let contents = fs::read_to_string(&path)
        .map_err(|error| unavailable(format!("{}: {error}", path.display())))?;

    for line in contents.lines() {
        let mut parts = line.split_ascii_whitespace();

        let (Some(id), Some(_creation), Some(value)) =
            (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };

        if id == cookie_id {
            return Ok(value.into());
        }
    }

    Err(unavailable(format!(
        "cookie {cookie_id} not found in {}",
        path.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    fn write_keyring(dir: &Path, name: &str, contents: &str, mode: u32) {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn finds_cookie_by_id() {
        let dir = tempfile::tempdir().unwrap();
        write_keyring(
            dir.path(),
            "org_freedesktop_general",
            "41 1699999999 cafebabe\n42 1700000000 deadbeef\n",
            0o600,
        );

        let value = lookup(dir.path(), "org_freedesktop_general", "42").unwrap();
        assert_eq!(value, "deadbeef");

        assert!(lookup(dir.path(), "org_freedesktop_general", "43").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn rejects_lax_permissions() {
        let dir = tempfile::tempdir().unwrap();
        write_keyring(dir.path(), "ctx", "1 1 aa\n", 0o644);

        let err = lookup(dir.path(), "ctx", "1").unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::CookieUnavailable(..)));
    }

    #[test]
    fn rejects_escaping_contexts() {
        let dir = std::env::temp_dir();

        for context in ["", "../etc", "a/b", "a/../b"] {
            let err = lookup(&dir, context, "1").unwrap_err();
            assert!(matches!(err.kind(), ErrorKind::CookieUnavailable(..)));
        }
    }
}

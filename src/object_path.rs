//! Object-path validation.
//!
//! The following rules define a valid object path (transcribed from the
//! D-Bus specification, same wording `tokio-dbus` documents on its
//! `OwnedObjectPath`):
//!
//! * The path may be of any length.
//! * The path must begin with an ASCII `/` character, and consist of
//!   elements separated by `/` characters.
//! * Each element must only contain the ASCII characters `[A-Za-z0-9_]`.
//! * No element may be the empty string.
//! * Multiple `/` characters cannot occur in sequence.
//! * A trailing `/` is not allowed unless the path is the root path (a
//!   single `/`).

use std::fmt;

use crate::error::{Error, ErrorKind, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectPath(String);

impl ObjectPath {
    pub fn new(s: impl Into<String>) -> Result<Self> {
        let s = s.into();
        validate(&s)?;
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.trim_start_matches('/').split('/').filter(|s| !s.is_empty())
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for ObjectPath {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        ObjectPath::new(value)
    }
}

impl TryFrom<String> for ObjectPath {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        ObjectPath::new(value)
    }
}

impl AsRef<str> for ObjectPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn validate(s: &str) -> Result<()> {
    let bytes = s.as_bytes();

    if bytes.first() != Some(&b'/') {
        return Err(Error::new(ErrorKind::InvalidObjectPath));
    }

    if bytes.len() == 1 {
        return Ok(());
    }

    if bytes.last() == Some(&b'/') {
        return Err(Error::new(ErrorKind::InvalidObjectPath));
    }

    for element in s[1..].split('/') {
        if element.is_empty() {
            return Err(Error::new(ErrorKind::InvalidObjectPath));
        }

        if !element
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
        {
            return Err(Error::new(ErrorKind::InvalidObjectPath));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_root() {
        ObjectPath::new("/").unwrap();
    }

    #[test]
    fn accepts_nested() {
        ObjectPath::new("/org/freedesktop/DBus").unwrap();
        ObjectPath::new("/bar/foo").unwrap();
    }

    #[test]
    fn rejects_missing_leading_slash() {
        assert!(ObjectPath::new("org/freedesktop").is_err());
    }

    #[test]
    fn rejects_trailing_slash() {
        assert!(ObjectPath::new("/org/freedesktop/").is_err());
    }

    #[test]
    fn rejects_double_slash() {
        assert!(ObjectPath::new("/org//freedesktop").is_err());
    }

    #[test]
    fn rejects_invalid_characters() {
        assert!(ObjectPath::new("/org/free-desktop").is_err());
    }
}

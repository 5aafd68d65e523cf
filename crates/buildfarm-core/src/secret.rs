//! Secret values that never print in cleartext.
//!
//! `Secret` has no `Serialize` impl and its `Debug`/`Display` impls print a
//! redaction marker, so a secret can only reach the wire through an explicit
//! call to [`Secret::expose`].

use std::fmt;

/// Marker printed in place of secret values.
pub const REDACTED: &str = "<redacted>";

/// A secret string (password, token, credential-bearing URL).
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Cleartext value, for the wire only.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret({})", REDACTED)
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

/// HTTP basic credentials for fetching files from a private archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: Secret,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Secret::new(password),
        }
    }
}

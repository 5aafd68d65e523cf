//! Resource identifiers and build cookies.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A unique identifier for any resource in the system.
/// Uses UUIDv7 for time-ordered, sortable IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct ResourceId(Uuid);

impl ResourceId {
    /// Create a new unique ResourceId using UUIDv7.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ResourceId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ResourceId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<ResourceId> for Uuid {
    fn from(id: ResourceId) -> Self {
        id.0
    }
}

impl std::str::FromStr for ResourceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Opaque correlation id tying one dispatch attempt to exactly one job.
///
/// Cookies are `<kind>-<job id>` and are safe to use as a path component:
/// only ASCII letters, digits, `-`, `_` and `.` are accepted, and never `.`
/// or `..` alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(try_from = "String", into = "String")]
#[display("{_0}")]
pub struct BuildCookie(String);

impl BuildCookie {
    pub fn for_job(kind: &str, id: &ResourceId) -> Self {
        Self(format!("{}-{}", kind, id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for BuildCookie {
    type Error = crate::Error;

    fn try_from(s: String) -> crate::Result<Self> {
        let valid_char = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.');
        if s.is_empty() || s == "." || s == ".." || !s.chars().all(valid_char) {
            return Err(crate::Error::InvalidCookie(s));
        }
        Ok(Self(s))
    }
}

impl std::str::FromStr for BuildCookie {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::try_from(s.to_string())
    }
}

impl From<BuildCookie> for String {
    fn from(cookie: BuildCookie) -> Self {
        cookie.0
    }
}

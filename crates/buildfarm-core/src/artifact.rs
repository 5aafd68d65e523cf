//! Content store abstraction.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;

/// Reference to stored content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRef {
    /// File name the content was stored under.
    pub name: String,
    /// Storage location (backend-specific).
    pub location: String,
    /// SHA-256 of the content, hex-encoded.
    pub sha256: String,
    /// Size in bytes.
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// Trait for content storage backends (build logs and other blobs).
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Store content under a file name.
    async fn put(&self, name: &str, data: Bytes) -> Result<ContentRef>;

    /// Retrieve stored content.
    async fn get(&self, reference: &ContentRef) -> Result<Bytes>;
}

//! Filesystem content store and log compression.

use async_trait::async_trait;
use buildfarm_core::artifact::{ContentRef, ContentStore};
use buildfarm_core::{Error, Result};
use buildfarm_worker::sha256_hex;
use bytes::Bytes;
use chrono::Utc;
use flate2::Compression;
use flate2::write::GzEncoder;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Stores content under `<dir>/<first two digest chars>/<digest>/<name>`.
pub struct FsContentStore {
    dir: PathBuf,
}

impl FsContentStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl ContentStore for FsContentStore {
    async fn put(&self, name: &str, data: Bytes) -> Result<ContentRef> {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(Error::Internal(format!("Invalid content name: {:?}", name)));
        }
        let sha256 = sha256_hex(&data);
        let parent = self.dir.join(&sha256[..2]).join(&sha256);
        tokio::fs::create_dir_all(&parent).await?;
        let path = parent.join(name);
        tokio::fs::write(&path, &data).await?;
        debug!(name = %name, sha256 = %sha256, size = data.len(), "Stored content");

        Ok(ContentRef {
            name: name.to_string(),
            location: path.to_string_lossy().into_owned(),
            sha256,
            size: data.len() as u64,
            created_at: Utc::now(),
        })
    }

    async fn get(&self, reference: &ContentRef) -> Result<Bytes> {
        match tokio::fs::read(&reference.location).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("content {}", reference.name)))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Gzip-compress `data`.
pub fn gzip(data: &[u8]) -> Result<Bytes> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(Bytes::from(encoder.finish()?))
}

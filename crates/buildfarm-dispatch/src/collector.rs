//! Collection of build outputs into the upload intake area.
//!
//! Outputs are downloaded into `<root>/grabbing/<leaf>/<archive>/<distro>`
//! and verified there. The staged leaf is renamed into `<root>/incoming/<leaf>`
//! only when the caller publishes it, which happens after the job's terminal
//! status is recorded. A failed or discarded collection leaves nothing
//! behind in either directory.

use buildfarm_core::filemap::FileMap;
use buildfarm_core::worker::WorkerProxy;
use buildfarm_core::{BuildJob, Error, Result};
use buildfarm_worker::sha256_hex;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, error, info, warn};

pub struct ResultCollector {
    root: PathBuf,
}

/// Outputs downloaded and verified under `grabbing/`, not yet published.
#[derive(Debug)]
#[must_use = "a staged upload must be published or discarded"]
pub struct StagedUpload {
    leaf: String,
    dir: PathBuf,
    files: usize,
}

impl StagedUpload {
    pub fn leaf(&self) -> &str {
        &self.leaf
    }
}

impl ResultCollector {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn grabbing_dir(&self) -> PathBuf {
        self.root.join("grabbing")
    }

    pub fn incoming_dir(&self) -> PathBuf {
        self.root.join("incoming")
    }

    /// Intake directory name for a job's upload.
    pub fn upload_leaf(job: &BuildJob, now: DateTime<Utc>) -> String {
        format!("{}-{}", now.format("%Y%m%d-%H%M%S"), job.cookie)
    }

    /// Download and verify the files in `filemap` into a staging leaf.
    ///
    /// Every filename is checked before anything is downloaded, and the
    /// intake directory must be able to take the leaf. On error the staging
    /// leaf is removed.
    pub async fn stage(
        &self,
        job: &BuildJob,
        worker: &dyn WorkerProxy,
        filemap: &FileMap,
    ) -> Result<StagedUpload> {
        let leaf = Self::upload_leaf(job, Utc::now());
        let grab_dir = self.grabbing_dir().join(&leaf);
        let staging = normalize(
            &grab_dir
                .join(job.target.archive_id.to_string())
                .join(&job.target.distribution),
        );

        let targets = filemap
            .iter()
            .map(|(name, digest)| {
                Ok(OutputFile {
                    name: name.to_string(),
                    digest: digest.to_string(),
                    path: resolve_output_path(&staging, name)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        check_conflicts(&targets)?;

        let fetched = match self.prepare_intake(&leaf).await {
            Ok(()) => fetch_outputs(worker, &staging, &targets).await,
            Err(e) => Err(e),
        };
        if let Err(e) = fetched {
            remove_staging(&grab_dir).await;
            return Err(e);
        }

        debug!(cookie = %job.cookie, leaf = %leaf, files = targets.len(), "Staged build output");
        Ok(StagedUpload {
            leaf,
            dir: grab_dir,
            files: targets.len(),
        })
    }

    /// Move a staged leaf into the intake directory.
    ///
    /// If the rename fails the staged files are kept under `grabbing/` so a
    /// recorded upload can still be recovered by hand.
    pub async fn publish(&self, staged: StagedUpload) -> Result<String> {
        let target = self.incoming_dir().join(&staged.leaf);
        if let Err(e) = tokio::fs::rename(&staged.dir, &target).await {
            error!(
                leaf = %staged.leaf,
                dir = %staged.dir.display(),
                error = %e,
                "Failed to publish staged upload, leaving it in place"
            );
            return Err(e.into());
        }
        info!(leaf = %staged.leaf, files = staged.files, "Published build output");
        Ok(staged.leaf)
    }

    /// Throw a staged leaf away without publishing it.
    pub async fn discard(&self, staged: StagedUpload) {
        debug!(leaf = %staged.leaf, "Discarding staged upload");
        remove_staging(&staged.dir).await;
    }

    /// Make sure `incoming/` exists and does not already hold `leaf`.
    async fn prepare_intake(&self, leaf: &str) -> Result<()> {
        let incoming = self.incoming_dir();
        tokio::fs::create_dir_all(&incoming).await?;
        if tokio::fs::try_exists(incoming.join(leaf)).await? {
            return Err(Error::Io(std::io::Error::new(
                ErrorKind::AlreadyExists,
                format!("upload {} is already in the intake directory", leaf),
            )));
        }
        Ok(())
    }
}

async fn remove_staging(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Failed to remove staging directory");
        }
    }
}

struct OutputFile {
    name: String,
    digest: String,
    path: PathBuf,
}

/// Reject file maps where two names land on the same path, or where one
/// name's path is a directory of another's.
fn check_conflicts(targets: &[OutputFile]) -> Result<()> {
    let mut paths: HashSet<&Path> = HashSet::new();
    for target in targets {
        if !paths.insert(&target.path) {
            return Err(Error::ConflictingOutput(target.name.clone()));
        }
    }
    for target in targets {
        if target.path.ancestors().skip(1).any(|dir| paths.contains(dir)) {
            return Err(Error::ConflictingOutput(target.name.clone()));
        }
    }
    Ok(())
}

async fn fetch_outputs(worker: &dyn WorkerProxy, staging: &Path, targets: &[OutputFile]) -> Result<()> {
    tokio::fs::create_dir_all(staging).await?;
    for target in targets {
        if let Some(parent) = target.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let files: Vec<(String, PathBuf)> = targets
        .iter()
        .map(|t| (t.digest.clone(), t.path.clone()))
        .collect();
    worker.get_files(&files).await?;

    for target in targets {
        let data = tokio::fs::read(&target.path).await?;
        let actual = sha256_hex(&data);
        if !actual.eq_ignore_ascii_case(&target.digest) {
            return Err(Error::ChecksumMismatch {
                file: target.name.clone(),
                expected: target.digest.clone(),
                actual,
            });
        }
        debug!(file = %target.name, "Verified output");
    }
    Ok(())
}

/// Resolve `path` lexically: drop `.` and apply `..` without touching the
/// filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match normalized.components().next_back() {
                Some(Component::Normal(_)) => {
                    normalized.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => normalized.push(".."),
            },
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

/// Destination of a worker-named output file. Must lie strictly inside
/// `staging`.
pub fn resolve_output_path(staging: &Path, filename: &str) -> Result<PathBuf> {
    let escape = || Error::PathEscape(filename.to_string());
    if filename.is_empty() || filename.contains('\0') {
        return Err(escape());
    }

    let resolved = normalize(&staging.join(filename));
    if resolved == staging || !resolved.starts_with(staging) {
        return Err(escape());
    }
    Ok(resolved)
}

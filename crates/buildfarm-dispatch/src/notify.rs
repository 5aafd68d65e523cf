//! Notifiers and source catalogs.

use async_trait::async_trait;
use buildfarm_core::notify::Notifier;
use buildfarm_core::source::SourceCatalog;
use buildfarm_core::{BuildJob, ResourceId, Result};
use std::collections::HashSet;
use tokio::sync::RwLock;
use tracing::info;

/// Notifier that emits a log event per notification.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, job: &BuildJob) -> Result<()> {
        info!(
            cookie = %job.cookie,
            title = %job.kind.title(),
            status = %job.status(),
            target = %job.target,
            worker = job.worker_name.as_deref().unwrap_or("-"),
            "Build notification"
        );
        Ok(())
    }
}

/// Source catalog holding an explicit set of superseded builds. Everything
/// else is current.
#[derive(Debug, Default)]
pub struct StaticSourceCatalog {
    superseded: RwLock<HashSet<ResourceId>>,
}

impl StaticSourceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the source `job` was built from has been replaced.
    pub async fn mark_superseded(&self, job: ResourceId) {
        self.superseded.write().await.insert(job);
    }
}

#[async_trait]
impl SourceCatalog for StaticSourceCatalog {
    async fn is_current(&self, job: &BuildJob) -> Result<bool> {
        Ok(!self.superseded.read().await.contains(&job.id))
    }
}

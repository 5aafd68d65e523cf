//! Source publication lookups.

use async_trait::async_trait;

use crate::job::BuildJob;
use crate::Result;

/// Answers whether the source a job was built from is still current.
#[async_trait]
pub trait SourceCatalog: Send + Sync {
    async fn is_current(&self, job: &BuildJob) -> Result<bool>;
}

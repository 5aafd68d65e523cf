//! Build notifications.

use async_trait::async_trait;

use crate::job::BuildJob;
use crate::Result;

/// Sends a notification about a finished build (e.g. a failure email).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, job: &BuildJob) -> Result<()>;
}

//! Job store abstraction: the build queue plus build records.

use async_trait::async_trait;

use crate::job::{BuildJob, BuildStatus};
use crate::{ResourceId, Result};

/// Persistent home of build jobs and their queue entries.
///
/// Every status write is a compare-and-swap against the status the writer
/// last saw; a mismatch fails with `Error::StaleStatus` and writes nothing.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Add a NEEDSBUILD job to the queue, assigning its queue entry.
    async fn enqueue(&self, job: BuildJob) -> Result<BuildJob>;

    /// Claim the oldest unclaimed NEEDSBUILD job the worker can take.
    ///
    /// A non-virtualized worker never gets a job that requires
    /// virtualization.
    async fn claim(&self, worker: &str, virtualized: bool) -> Result<Option<BuildJob>> {
        self.claim_excluding(worker, virtualized, &[]).await
    }

    /// Like `claim`, but never hands out a job listed in `skip`.
    async fn claim_excluding(
        &self,
        worker: &str,
        virtualized: bool,
        skip: &[ResourceId],
    ) -> Result<Option<BuildJob>>;

    /// Give up a claim without touching the job, so another worker can
    /// take it.
    async fn release(&self, id: ResourceId) -> Result<()>;

    /// Load a job. `queue_entry` reflects queue membership at the moment of
    /// the read.
    async fn load(&self, id: ResourceId) -> Result<BuildJob>;

    /// Persist a non-terminal transition of `job` (e.g. to BUILDING).
    async fn commit(&self, job: &BuildJob, expected: BuildStatus) -> Result<()>;

    /// Persist a terminal status and remove the job's queue entry as one
    /// atomic unit. No reader sees one without the other.
    async fn commit_terminal(&self, job: &BuildJob, expected: BuildStatus) -> Result<()>;

    /// Whether the job still has a queue entry.
    async fn is_queued(&self, id: ResourceId) -> Result<bool>;

    /// Request cancellation. BUILDING jobs move to CANCELLING and wait for
    /// the worker to abort; NEEDSBUILD jobs are cancelled and dequeued at
    /// once. Returns the new status.
    async fn request_cancel(&self, id: ResourceId) -> Result<BuildStatus>;

    /// Reset a job to NEEDSBUILD and queue it again.
    async fn retry(&self, id: ResourceId) -> Result<BuildJob>;
}

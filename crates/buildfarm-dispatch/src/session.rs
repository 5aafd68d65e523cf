//! Live binding of a job to a worker.

use buildfarm_core::worker::WorkerProxy;
use buildfarm_core::{BuildCookie, BuildJob};
use std::sync::Arc;

/// One job bound to one worker connection.
///
/// Never persisted. Consumed once the job's terminal status is recorded.
pub struct BuilderSession {
    job: BuildJob,
    worker: Arc<dyn WorkerProxy>,
    logtail: Option<String>,
    abort_requested: bool,
}

impl BuilderSession {
    pub fn new(job: BuildJob, worker: Arc<dyn WorkerProxy>) -> Self {
        Self {
            job,
            worker,
            logtail: None,
            abort_requested: false,
        }
    }

    pub fn job(&self) -> &BuildJob {
        &self.job
    }

    pub(crate) fn job_mut(&mut self) -> &mut BuildJob {
        &mut self.job
    }

    pub fn worker(&self) -> &Arc<dyn WorkerProxy> {
        &self.worker
    }

    pub fn cookie(&self) -> &BuildCookie {
        &self.job.cookie
    }

    /// Last log lines the worker reported while building.
    pub fn logtail(&self) -> Option<&str> {
        self.logtail.as_deref()
    }

    pub(crate) fn set_logtail(&mut self, logtail: Option<String>) {
        if logtail.is_some() {
            self.logtail = logtail;
        }
    }

    pub(crate) fn abort_requested(&self) -> bool {
        self.abort_requested
    }

    pub(crate) fn mark_abort_requested(&mut self) {
        self.abort_requested = true;
    }

    pub(crate) fn into_parts(self) -> (BuildJob, Arc<dyn WorkerProxy>) {
        (self.job, self.worker)
    }
}

impl std::fmt::Debug for BuilderSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuilderSession")
            .field("cookie", &self.job.cookie)
            .field("status", &self.job.status())
            .field("worker", &self.worker.info().name)
            .finish()
    }
}

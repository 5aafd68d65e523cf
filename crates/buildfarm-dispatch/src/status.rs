//! Handling of worker status reports.
//!
//! A finished worker report moves the job into exactly one terminal status.
//! The build log is stored first, then outputs are staged (successful builds
//! only), then the terminal status and the dequeue are committed together.
//! Staged outputs reach the intake directory only after that commit, and
//! notifications go out only after it succeeds.

use buildfarm_config::farm::DEFAULT_NOTIFY_ON;
use buildfarm_core::artifact::ContentStore;
use buildfarm_core::kind::SuccessCheck;
use buildfarm_core::notify::Notifier;
use buildfarm_core::source::SourceCatalog;
use buildfarm_core::store::JobStore;
use buildfarm_core::worker::{BUILD_LOG, WorkerBuildStatus, WorkerProxy, WorkerReport, WorkerStatus};
use buildfarm_core::{BuildJob, BuildStatus, Error, Result};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::collector::ResultCollector;
use crate::content::gzip;
use crate::session::BuilderSession;

pub struct StatusHandler {
    store: Arc<dyn JobStore>,
    content: Arc<dyn ContentStore>,
    notifier: Arc<dyn Notifier>,
    sources: Arc<dyn SourceCatalog>,
    collector: ResultCollector,
    notify_on: Vec<BuildStatus>,
}

impl StatusHandler {
    pub fn new(
        store: Arc<dyn JobStore>,
        content: Arc<dyn ContentStore>,
        notifier: Arc<dyn Notifier>,
        sources: Arc<dyn SourceCatalog>,
        collector: ResultCollector,
    ) -> Self {
        Self {
            store,
            content,
            notifier,
            sources,
            collector,
            notify_on: DEFAULT_NOTIFY_ON.to_vec(),
        }
    }

    /// Terminal statuses that trigger a notification.
    pub fn with_notify_on(mut self, statuses: impl IntoIterator<Item = BuildStatus>) -> Self {
        self.notify_on = statuses.into_iter().collect();
        self
    }

    /// Ask the worker how the session's build is going.
    ///
    /// Returns the report once the worker has finished. A worker that has
    /// gone idle has lost the build and is reported as a transport error.
    pub async fn poll(&self, session: &mut BuilderSession) -> Result<Option<WorkerReport>> {
        match session.worker().get_status(session.cookie()).await? {
            WorkerStatus::Building { logtail } => {
                session.set_logtail(logtail);
                Ok(None)
            }
            WorkerStatus::Aborting => Ok(None),
            WorkerStatus::Waiting(report) => Ok(Some(report)),
            WorkerStatus::Idle => Err(Error::Transport(format!(
                "worker {} is idle while {} is in flight",
                session.worker().info().name,
                session.cookie()
            ))),
        }
    }

    /// Apply a finished worker report and end the session.
    ///
    /// Returns the job as committed. A report that breaks the worker
    /// protocol fails the job and is returned as an error.
    pub async fn handle_status(&self, session: BuilderSession, report: WorkerReport) -> Result<BuildJob> {
        let (mut job, worker) = session.into_parts();

        let stored = self.store.load(job.id).await?.status();
        if stored.is_terminal() {
            return Err(Error::StaleStatus {
                job: job.cookie.to_string(),
                expected: job.status(),
                found: stored,
            });
        }
        job.observe(stored)?;
        let prior = job.status();

        let code = WorkerBuildStatus::parse(&report.build_status);
        info!(
            cookie = %job.cookie,
            worker = %worker.info().name,
            build_status = %code,
            status = %prior,
            "Handling worker status"
        );

        let next = match code {
            WorkerBuildStatus::Ok => None,
            WorkerBuildStatus::PackageFail => Some(BuildStatus::FailedToBuild),
            WorkerBuildStatus::DepFail => Some(BuildStatus::ManualDepWait),
            WorkerBuildStatus::ChrootFail => Some(BuildStatus::ChrootWait),
            WorkerBuildStatus::Aborted if prior == BuildStatus::Cancelling => {
                Some(BuildStatus::Cancelled)
            }
            other => {
                let violation = Error::UnexpectedWorkerStatus(other.to_string());
                return self.fail(job, prior, violation).await;
            }
        };

        self.store_log(&mut job, worker.as_ref()).await?;

        let mut staged = None;
        match next {
            Some(status) => {
                if status == BuildStatus::ManualDepWait {
                    job.dependencies = report.dependencies.clone();
                }
                job.transition_to(status)?;
            }
            None if !self.source_is_current(&job).await? => {
                info!(cookie = %job.cookie, "Source superseded, discarding build output");
                job.transition_to(BuildStatus::Superseded)?;
            }
            None => match self.collector.stage(&job, worker.as_ref(), &report.filemap).await {
                Ok(upload) => {
                    job.upload_leaf = Some(upload.leaf().to_string());
                    job.transition_to(BuildStatus::Uploading)?;
                    staged = Some(upload);
                }
                Err(e) if e.is_protocol_violation() => return self.fail(job, prior, e).await,
                Err(e) => return Err(e),
            },
        }

        if let Err(e) = self.commit(&job, prior).await {
            if let Some(upload) = staged {
                self.collector.discard(upload).await;
            }
            return Err(e);
        }
        info!(cookie = %job.cookie, status = %job.status(), "Build finished");
        if let Some(upload) = staged {
            self.collector.publish(upload).await?;
        }
        self.finish(job, worker.as_ref()).await
    }

    async fn source_is_current(&self, job: &BuildJob) -> Result<bool> {
        match job.kind.verify_success() {
            SuccessCheck::Always => Ok(true),
            SuccessCheck::SourceCurrent => self.sources.is_current(job).await,
        }
    }

    /// Fetch the build log from the worker and store it gzipped.
    async fn store_log(&self, job: &mut BuildJob, worker: &dyn WorkerProxy) -> Result<()> {
        let scratch_dir = self.collector.grabbing_dir();
        tokio::fs::create_dir_all(&scratch_dir).await?;
        let scratch = scratch_dir.join(format!("{}.{}", job.cookie, BUILD_LOG));

        let fetched = match worker.get_file(BUILD_LOG, &scratch).await {
            Ok(()) => tokio::fs::read(&scratch).await.map_err(Error::from),
            Err(e) => Err(e),
        };
        if let Err(e) = tokio::fs::remove_file(&scratch).await {
            debug!(path = %scratch.display(), error = %e, "Failed to remove scratch log");
        }

        let compressed = gzip(&fetched?)?;
        let reference = self.content.put(&job.log_file_name(), compressed).await?;
        debug!(cookie = %job.cookie, log = %reference.location, "Stored build log");
        job.log = Some(reference);
        Ok(())
    }

    /// Commit the job's terminal status against `prior`.
    ///
    /// A cancellation requested while the report was being handled does not
    /// change the outcome the worker reported: the commit is retried against
    /// CANCELLING once.
    async fn commit(&self, job: &BuildJob, prior: BuildStatus) -> Result<()> {
        match self.store.commit_terminal(job, prior).await {
            Err(Error::StaleStatus {
                found: BuildStatus::Cancelling,
                ..
            }) if prior == BuildStatus::Building => {
                info!(cookie = %job.cookie, status = %job.status(), "Build finished before cancellation took effect");
                self.store.commit_terminal(job, BuildStatus::Cancelling).await
            }
            result => result,
        }
    }

    /// Tidy up the worker and notify once the terminal status is recorded.
    async fn finish(&self, job: BuildJob, worker: &dyn WorkerProxy) -> Result<BuildJob> {
        if let Err(e) = worker.clean(&job.cookie).await {
            warn!(cookie = %job.cookie, worker = %worker.info().name, error = %e, "Failed to clean worker");
        }

        if self.notify_on.contains(&job.status()) {
            if let Err(e) = self.notifier.notify(&job).await {
                warn!(cookie = %job.cookie, error = %e, "Failed to send notification");
            }
        }
        Ok(job)
    }

    /// Fail the job for a worker protocol violation.
    ///
    /// Returns `violation` as the error once the failure is recorded, or the
    /// store's error if it could not be. No notification is sent.
    async fn fail(&self, mut job: BuildJob, prior: BuildStatus, violation: Error) -> Result<BuildJob> {
        error!(cookie = %job.cookie, error = %violation, "Worker protocol violation, failing build");
        job.failure_reason = Some(violation.to_string());
        job.transition_to(BuildStatus::FailedToBuild)?;
        if let Err(e) = self.commit(&job, prior).await {
            error!(cookie = %job.cookie, error = %e, "Failed to record build failure");
            return Err(e);
        }
        Err(violation)
    }
}

//! Dispatch of queued jobs to workers.

use buildfarm_core::store::JobStore;
use buildfarm_core::worker::{BuildRequest, StartBuildResponse, WorkerInfo};
use buildfarm_core::{BuildJob, BuildStatus, Error, Result};
use futures::future::try_join_all;
use std::sync::Arc;
use tracing::{debug, info};

use crate::context::BuildContextProvider;
use crate::files::FileResolver;
use crate::session::BuilderSession;

/// Turns a claimed job into a running build on a worker.
///
/// Performs no retries: transport errors go back to the caller with the
/// job left BUILDING.
pub struct Dispatcher {
    context: BuildContextProvider,
    files: Arc<dyn FileResolver>,
    store: Arc<dyn JobStore>,
}

impl Dispatcher {
    pub fn new(
        context: BuildContextProvider,
        files: Arc<dyn FileResolver>,
        store: Arc<dyn JobStore>,
    ) -> Self {
        Self {
            context,
            files,
            store,
        }
    }

    /// Build the request a worker needs to run `job`. Makes no RPCs.
    pub fn compose_build_request(&self, job: &BuildJob, worker: &WorkerInfo) -> Result<BuildRequest> {
        let context = self.context.resolve(job, worker)?;
        let files = self
            .files
            .resolve(job, context.image_type, self.context.credentials(job))?;

        Ok(BuildRequest {
            cookie: job.cookie.clone(),
            kind: job.kind.name(),
            image_type: context.image_type,
            base_image: files.base_image,
            pocket: context.pocket,
            inputs: files.inputs,
            args: context.args,
        })
    }

    /// Start the session's job on its worker.
    ///
    /// Request problems fail before any RPC with the job still NEEDSBUILD.
    /// Otherwise the job is committed BUILDING, every input is pushed
    /// concurrently and the build is started once all transfers succeed.
    pub async fn dispatch(&self, session: &mut BuilderSession) -> Result<StartBuildResponse> {
        let worker = session.worker().clone();
        let info = worker.info();
        let request = self.compose_build_request(session.job(), info)?;
        self.context.verify(session.job(), info)?;

        let job = session.job_mut();
        job.transition_to(BuildStatus::Building)?;
        job.worker_name = Some(info.name.clone());
        self.store.commit(job, BuildStatus::NeedsBuild).await?;

        info!(
            cookie = %request.cookie,
            worker = %info.name,
            target = %session.job().target,
            image_type = %request.image_type,
            args = %request.args,
            "Dispatching build"
        );

        try_join_all(request.transfers().map(|(name, locator)| {
            let worker = worker.clone();
            async move {
                debug!(file = %name, sha256 = %locator.sha256, "Ensuring file is present");
                if worker.ensure_present(locator).await? {
                    Ok(())
                } else {
                    Err(Error::Transport(format!(
                        "worker could not fetch {} from {}",
                        name, locator.url
                    )))
                }
            }
        }))
        .await?;

        let response = worker.start_build(&request).await?;
        info!(cookie = %request.cookie, status = %response.status, "Build started");
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use buildfarm_core::args::ArgValue;
    use buildfarm_core::{ImageType, Pocket};
    use buildfarm_worker::MemoryWorker;

    #[tokio::test]
    async fn test_compose_request_for_binary_build() {
        let harness = Harness::new();
        let job = make_binary_job();
        let request = harness
            .dispatcher
            .compose_build_request(&job, &worker_info("bob", false))
            .unwrap();

        assert_eq!(request.kind, "binarypackage");
        assert_eq!(request.image_type, ImageType::Chroot);
        assert_eq!(request.base_image, image_locator(ImageType::Chroot));
        assert_eq!(request.pocket, Pocket::Release);
        assert_eq!(request.filemap().len(), 2);
        assert_eq!(request.args.get("fast_cleanup"), Some(&ArgValue::Bool(false)));
    }

    #[tokio::test]
    async fn test_dispatch_pushes_inputs_then_starts() {
        let harness = Harness::new();
        let job = harness.enqueue(make_binary_job()).await;
        let worker = Arc::new(MemoryWorker::named("bob", false));

        let mut session = BuilderSession::new(job, worker.clone());
        let response = harness.dispatcher.dispatch(&mut session).await.unwrap();
        assert_eq!(response.status, "BUILDING");

        let builds = worker.started_builds();
        assert_eq!(builds.len(), 1);
        assert_eq!(builds[0].cookie, session.job().cookie);
        assert!(worker.is_cached(&image_locator(ImageType::Chroot).sha256));
        assert_eq!(worker.fetch_count(), 3);

        let stored = harness.store.load(session.job().id).await.unwrap();
        assert_eq!(stored.status(), BuildStatus::Building);
        assert_eq!(stored.worker_name.as_deref(), Some("bob"));
        assert!(stored.date_first_dispatched.is_some());
    }

    #[tokio::test]
    async fn test_dispatch_skips_cached_inputs() {
        let harness = Harness::new();
        let job = harness.enqueue(make_binary_job()).await;
        let chroot = image_locator(ImageType::Chroot);
        let worker = Arc::new(MemoryWorker::named("bob", false).with_cached(&chroot.sha256));

        let mut session = BuilderSession::new(job, worker.clone());
        harness.dispatcher.dispatch(&mut session).await.unwrap();
        assert_eq!(worker.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_no_image_fails_before_any_rpc() {
        let harness = Harness::with_images(&[ImageType::Lxd]);
        let job = harness.enqueue(make_binary_job()).await;
        let worker = Arc::new(MemoryWorker::named("bob", false));

        let mut session = BuilderSession::new(job, worker.clone());
        let err = harness.dispatcher.dispatch(&mut session).await.unwrap_err();
        assert!(matches!(err, Error::NoImageAvailable { .. }));
        assert_eq!(worker.rpc_calls(), 0);

        let stored = harness.store.load(session.job().id).await.unwrap();
        assert_eq!(stored.status(), BuildStatus::NeedsBuild);
    }

    #[tokio::test]
    async fn test_virtualized_job_refused_by_bare_metal_worker() {
        let harness = Harness::new();
        let job = harness
            .enqueue(make_binary_job().with_virtualization(true))
            .await;
        let worker = Arc::new(MemoryWorker::named("metal", false));

        let mut session = BuilderSession::new(job, worker.clone());
        let err = harness.dispatcher.dispatch(&mut session).await.unwrap_err();
        assert!(matches!(err, Error::CannotBuild(_)));
        assert_eq!(worker.rpc_calls(), 0);
    }

    #[tokio::test]
    async fn test_one_failed_transfer_aborts_dispatch() {
        let harness = Harness::new();
        let job = harness.enqueue(make_binary_job()).await;
        let worker = Arc::new(MemoryWorker::named("bob", false));
        worker.break_transfer(&source_sha("hello_2.10-3.dsc"));

        let mut session = BuilderSession::new(job, worker.clone());
        let err = harness.dispatcher.dispatch(&mut session).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert!(worker.started_builds().is_empty());

        let stored = harness.store.load(session.job().id).await.unwrap();
        assert_eq!(stored.status(), BuildStatus::Building);
    }

    #[tokio::test]
    async fn test_dispatch_of_stale_job_is_rejected() {
        let harness = Harness::new();
        let job = harness.enqueue(make_binary_job()).await;
        harness.store.request_cancel(job.id).await.unwrap();
        let worker = Arc::new(MemoryWorker::named("bob", false));

        let mut session = BuilderSession::new(job, worker.clone());
        let err = harness.dispatcher.dispatch(&mut session).await.unwrap_err();
        assert!(matches!(err, Error::StaleStatus { .. }));
        assert!(worker.started_builds().is_empty());
    }
}

//! Manager loop that claims queued builds and drives them on a worker.

use buildfarm_core::store::JobStore;
use buildfarm_core::worker::WorkerProxy;
use buildfarm_core::{BuildJob, BuildStatus, Error, ResourceId, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{info, warn};

use crate::dispatcher::Dispatcher;
use crate::session::BuilderSession;
use crate::status::StatusHandler;

const IDLE_INTERVAL: Duration = Duration::from_secs(1);
const ERROR_INTERVAL: Duration = Duration::from_secs(5);
/// How long a worker passes over a job it could not take.
const REFUSAL_INTERVAL: Duration = Duration::from_secs(300);

/// Claims builds for one worker at a time and sees each through to a
/// terminal status.
pub struct BuildManager {
    store: Arc<dyn JobStore>,
    dispatcher: Arc<Dispatcher>,
    handler: Arc<StatusHandler>,
    poll_interval: Duration,
}

impl BuildManager {
    pub fn new(
        store: Arc<dyn JobStore>,
        dispatcher: Arc<Dispatcher>,
        handler: Arc<StatusHandler>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            dispatcher,
            handler,
            poll_interval,
        }
    }

    /// Run the manager loop for one worker.
    ///
    /// Jobs this worker cannot take are released and passed over for a
    /// while, so they never hold up the jobs queued behind them.
    pub async fn run(&self, worker: Arc<dyn WorkerProxy>) {
        let name = worker.info().name.clone();
        let virtualized = worker.info().virtualized;
        info!(worker = %name, "Starting build manager");

        let mut refused: HashMap<ResourceId, Instant> = HashMap::new();
        loop {
            refused.retain(|_, at| at.elapsed() < REFUSAL_INTERVAL);
            let skip: Vec<ResourceId> = refused.keys().copied().collect();

            match self.store.claim_excluding(&name, virtualized, &skip).await {
                Ok(Some(job)) => {
                    let id = job.id;
                    info!(cookie = %job.cookie, worker = %name, "Claimed build");
                    match self.build(job, worker.clone()).await {
                        Ok(_) => {}
                        Err(e) if is_refusal(&e) => {
                            info!(worker = %name, error = %e, "Passing over build");
                            refused.insert(id, Instant::now());
                        }
                        Err(e) => warn!(worker = %name, error = %e, "Build did not complete"),
                    }
                }
                Ok(None) => {
                    sleep(IDLE_INTERVAL).await;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to claim build");
                    sleep(ERROR_INTERVAL).await;
                }
            }
        }
    }

    /// Dispatch a claimed job and drive it to a terminal status.
    ///
    /// If the job cannot be dispatched before any RPC is made, the claim is
    /// released so the job can go elsewhere.
    pub async fn build(&self, job: BuildJob, worker: Arc<dyn WorkerProxy>) -> Result<BuildJob> {
        let id = job.id;
        let mut session = BuilderSession::new(job, worker);
        match self.dispatcher.dispatch(&mut session).await {
            Ok(_) => {}
            Err(e) if is_refusal(&e) => {
                self.store.release(id).await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        }
        self.drive(session).await
    }

    /// Poll the worker until it reports a finished build, then apply the
    /// report. Cancellation requested in the store is forwarded to the
    /// worker once.
    pub async fn drive(&self, mut session: BuilderSession) -> Result<BuildJob> {
        loop {
            if !session.abort_requested() {
                let stored = self.store.load(session.job().id).await?;
                if stored.status() == BuildStatus::Cancelling {
                    info!(cookie = %session.cookie(), "Aborting cancelled build");
                    session.worker().abort(session.cookie()).await?;
                    session.mark_abort_requested();
                }
            }

            match self.handler.poll(&mut session).await? {
                Some(report) => return self.handler.handle_status(session, report).await,
                None => sleep(self.poll_interval).await,
            }
        }
    }
}

/// Errors raised before any RPC that mean this worker cannot take the job.
fn is_refusal(e: &Error) -> bool {
    matches!(e, Error::CannotBuild(_) | Error::NoImageAvailable { .. })
}

//! In-memory job store.

use async_trait::async_trait;
use buildfarm_core::store::JobStore;
use buildfarm_core::{BuildJob, BuildStatus, Error, ResourceId, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone)]
struct QueueEntry {
    id: ResourceId,
    job_id: ResourceId,
    claimed_by: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<ResourceId, BuildJob>,
    /// Oldest first.
    queue: Vec<QueueEntry>,
}

impl Inner {
    fn job(&self, id: ResourceId) -> Result<&BuildJob> {
        self.jobs
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("build {}", id)))
    }

    fn entry_for(&self, job_id: ResourceId) -> Option<&QueueEntry> {
        self.queue.iter().find(|e| e.job_id == job_id)
    }

    fn snapshot(&self, id: ResourceId) -> Result<BuildJob> {
        let mut job = self.job(id)?.clone();
        job.queue_entry = self.entry_for(id).map(|e| e.id);
        Ok(job)
    }

    fn check_expected(&self, job: &BuildJob, expected: BuildStatus) -> Result<()> {
        let found = self.job(job.id)?.status();
        if found != expected {
            return Err(Error::StaleStatus {
                job: job.cookie.to_string(),
                expected,
                found,
            });
        }
        Ok(())
    }

    fn push_entry(&mut self, job_id: ResourceId) -> ResourceId {
        let entry = QueueEntry {
            id: ResourceId::new(),
            job_id,
            claimed_by: None,
            created_at: Utc::now(),
        };
        let id = entry.id;
        self.queue.push(entry);
        id
    }

    fn dequeue(&mut self, job_id: ResourceId) {
        self.queue.retain(|e| e.job_id != job_id);
    }
}

/// Job store kept in process memory. Every operation runs under one lock,
/// so each is atomic with respect to the others.
#[derive(Default)]
pub struct MemoryJobStore {
    inner: Mutex<Inner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queue entries.
    pub async fn queue_len(&self) -> usize {
        self.inner.lock().await.queue.len()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(&self, mut job: BuildJob) -> Result<BuildJob> {
        if job.status() != BuildStatus::NeedsBuild {
            return Err(Error::InvalidTransition {
                from: job.status(),
                to: BuildStatus::NeedsBuild,
            });
        }
        let mut inner = self.inner.lock().await;
        if inner.jobs.contains_key(&job.id) {
            return Err(Error::Storage(format!("build {} already exists", job.id)));
        }
        job.queue_entry = Some(inner.push_entry(job.id));
        inner.jobs.insert(job.id, job.clone());
        debug!(cookie = %job.cookie, "Enqueued build");
        Ok(job)
    }

    async fn claim_excluding(
        &self,
        worker: &str,
        virtualized: bool,
        skip: &[ResourceId],
    ) -> Result<Option<BuildJob>> {
        let mut inner = self.inner.lock().await;
        let Inner { jobs, queue } = &mut *inner;

        let mut candidates: Vec<&mut QueueEntry> = queue
            .iter_mut()
            .filter(|e| e.claimed_by.is_none() && !skip.contains(&e.job_id))
            .filter(|e| {
                jobs.get(&e.job_id).is_some_and(|job| {
                    job.status() == BuildStatus::NeedsBuild
                        && (virtualized || !job.requires_virtualization)
                })
            })
            .collect();
        candidates.sort_by_key(|e| e.created_at);

        let Some(entry) = candidates.into_iter().next() else {
            return Ok(None);
        };
        entry.claimed_by = Some(worker.to_string());
        let job_id = entry.job_id;
        inner.snapshot(job_id).map(Some)
    }

    async fn release(&self, id: ResourceId) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.queue.iter_mut().find(|e| e.job_id == id) {
            entry.claimed_by = None;
        }
        Ok(())
    }

    async fn load(&self, id: ResourceId) -> Result<BuildJob> {
        self.inner.lock().await.snapshot(id)
    }

    async fn commit(&self, job: &BuildJob, expected: BuildStatus) -> Result<()> {
        if job.status().is_terminal() {
            return Err(Error::Internal(format!(
                "{} is terminal and must be committed with commit_terminal",
                job.status()
            )));
        }
        let mut inner = self.inner.lock().await;
        inner.check_expected(job, expected)?;
        inner.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn commit_terminal(&self, job: &BuildJob, expected: BuildStatus) -> Result<()> {
        if !job.status().is_terminal() {
            return Err(Error::Internal(format!("{} is not terminal", job.status())));
        }
        let mut inner = self.inner.lock().await;
        inner.check_expected(job, expected)?;
        let mut stored = job.clone();
        stored.queue_entry = None;
        inner.jobs.insert(job.id, stored);
        inner.dequeue(job.id);
        debug!(cookie = %job.cookie, status = %job.status(), "Committed terminal status");
        Ok(())
    }

    async fn is_queued(&self, id: ResourceId) -> Result<bool> {
        let inner = self.inner.lock().await;
        inner.job(id)?;
        Ok(inner.entry_for(id).is_some())
    }

    async fn request_cancel(&self, id: ResourceId) -> Result<BuildStatus> {
        let mut inner = self.inner.lock().await;
        let mut job = inner.job(id)?.clone();
        match job.status() {
            BuildStatus::Cancelling => return Ok(BuildStatus::Cancelling),
            BuildStatus::Building => job.transition_to(BuildStatus::Cancelling)?,
            _ => {
                job.transition_to(BuildStatus::Cancelled)?;
                job.queue_entry = None;
                inner.dequeue(id);
            }
        }
        let status = job.status();
        inner.jobs.insert(id, job);
        Ok(status)
    }

    async fn retry(&self, id: ResourceId) -> Result<BuildJob> {
        let mut inner = self.inner.lock().await;
        let mut job = inner.job(id)?.clone();
        job.retry()?;
        let queued = inner
            .queue
            .iter_mut()
            .find(|e| e.job_id == id)
            .map(|entry| entry.claimed_by = None)
            .is_some();
        if !queued {
            inner.push_entry(id);
        }
        inner.jobs.insert(id, job);
        inner.snapshot(id)
    }
}

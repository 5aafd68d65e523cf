//! In-process worker for development and tests.
//!
//! Behaves like a real worker from the dispatcher's point of view: it caches
//! files by digest, records build requests, serves output files and reports
//! whatever status it has been told to report.

use async_trait::async_trait;
use bytes::Bytes;
use buildfarm_core::filemap::{FileLocator, FileMap};
use buildfarm_core::worker::*;
use buildfarm_core::{BuildCookie, Error, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::debug;

use crate::sha256_hex;

#[derive(Default)]
struct State {
    /// Cached inputs, digest to source URL.
    cache: HashMap<String, String>,
    /// Downloads performed by `ensure_present`.
    fetches: usize,
    /// Digests whose transfer fails.
    broken: HashSet<String>,
    /// Files served by `get_file`, by key.
    files: HashMap<String, Bytes>,
    builds: Vec<BuildRequest>,
    status: Option<WorkerStatus>,
    aborted: Vec<BuildCookie>,
    cleaned: Vec<BuildCookie>,
    rpc_calls: usize,
}

pub struct MemoryWorker {
    info: WorkerInfo,
    state: Mutex<State>,
}

impl MemoryWorker {
    pub fn new(info: WorkerInfo) -> Self {
        Self {
            info,
            state: Mutex::new(State::default()),
        }
    }

    /// A worker with a throwaway name.
    pub fn named(name: &str, virtualized: bool) -> Self {
        Self::new(WorkerInfo {
            name: name.to_string(),
            url: format!("memory://{}", name),
            virtualized,
        })
    }

    /// Pretend a file is already cached.
    pub fn with_cached(self, sha256: &str) -> Self {
        self.state
            .lock()
            .cache
            .insert(sha256.to_string(), String::new());
        self
    }

    /// Make transfers of this digest fail.
    pub fn break_transfer(&self, sha256: &str) {
        self.state.lock().broken.insert(sha256.to_string());
    }

    /// Serve `data` as an output file; returns its digest.
    pub fn add_output(&self, data: impl Into<Bytes>) -> String {
        let data = data.into();
        let digest = sha256_hex(&data);
        self.state.lock().files.insert(digest.clone(), data);
        digest
    }

    /// Serve `data` under an arbitrary key, whatever its digest.
    pub fn add_file_as(&self, key: &str, data: impl Into<Bytes>) {
        self.state.lock().files.insert(key.to_string(), data.into());
    }

    pub fn set_build_log(&self, log: impl Into<Bytes>) {
        self.add_file_as(BUILD_LOG, log);
    }

    pub fn set_status(&self, status: WorkerStatus) {
        self.state.lock().status = Some(status);
    }

    /// Report a finished build.
    pub fn finish(&self, build_status: &str, filemap: FileMap) {
        self.set_status(WorkerStatus::Waiting(WorkerReport {
            build_status: build_status.to_string(),
            filemap,
            dependencies: None,
        }));
    }

    pub fn is_cached(&self, sha256: &str) -> bool {
        self.state.lock().cache.contains_key(sha256)
    }

    pub fn cached(&self) -> Vec<String> {
        let mut cached: Vec<String> = self.state.lock().cache.keys().cloned().collect();
        cached.sort();
        cached
    }

    pub fn fetch_count(&self) -> usize {
        self.state.lock().fetches
    }

    pub fn started_builds(&self) -> Vec<BuildRequest> {
        self.state.lock().builds.clone()
    }

    pub fn aborted(&self) -> Vec<BuildCookie> {
        self.state.lock().aborted.clone()
    }

    pub fn cleaned(&self) -> Vec<BuildCookie> {
        self.state.lock().cleaned.clone()
    }

    /// Total RPCs received.
    pub fn rpc_calls(&self) -> usize {
        self.state.lock().rpc_calls
    }
}

#[async_trait]
impl WorkerProxy for MemoryWorker {
    fn info(&self) -> &WorkerInfo {
        &self.info
    }

    async fn ensure_present(&self, locator: &FileLocator) -> Result<bool> {
        let mut state = self.state.lock();
        state.rpc_calls += 1;
        if state.broken.contains(&locator.sha256) {
            return Err(Error::Transport(format!("failed to fetch {}", locator.url)));
        }
        if !state.cache.contains_key(&locator.sha256) {
            debug!(worker = %self.info.name, sha256 = %locator.sha256, "Caching file");
            state
                .cache
                .insert(locator.sha256.clone(), locator.url.clone());
            state.fetches += 1;
        }
        Ok(true)
    }

    async fn start_build(&self, request: &BuildRequest) -> Result<StartBuildResponse> {
        let mut state = self.state.lock();
        state.rpc_calls += 1;
        if let Some((name, _)) = request
            .transfers()
            .find(|(_, loc)| !state.cache.contains_key(&loc.sha256))
        {
            return Err(Error::Transport(format!("{} is not cached", name)));
        }
        state.builds.push(request.clone());
        state.status = Some(WorkerStatus::Building { logtail: None });
        Ok(StartBuildResponse {
            status: "BUILDING".to_string(),
            info: request.cookie.to_string(),
        })
    }

    async fn get_status(&self, _cookie: &BuildCookie) -> Result<WorkerStatus> {
        let mut state = self.state.lock();
        state.rpc_calls += 1;
        Ok(state.status.clone().unwrap_or(WorkerStatus::Idle))
    }

    async fn get_file(&self, key: &str, destination: &Path) -> Result<()> {
        let data = {
            let mut state = self.state.lock();
            state.rpc_calls += 1;
            state
                .files
                .get(key)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("file {}", key)))?
        };
        tokio::fs::write(destination, &data).await?;
        Ok(())
    }

    async fn abort(&self, cookie: &BuildCookie) -> Result<()> {
        let mut state = self.state.lock();
        state.rpc_calls += 1;
        state.aborted.push(cookie.clone());
        state.status = Some(WorkerStatus::Aborting);
        Ok(())
    }

    async fn clean(&self, cookie: &BuildCookie) -> Result<()> {
        let mut state = self.state.lock();
        state.rpc_calls += 1;
        state.cleaned.push(cookie.clone());
        state.status = Some(WorkerStatus::Idle);
        Ok(())
    }
}

//! Worker RPC proxies for the build farm dispatcher.
//!
//! Provides implementations of the worker RPC surface:
//! - HTTP/JSON (production workers)
//! - In-process memory worker (development and tests)

pub mod http;
pub mod memory;

pub use buildfarm_core::worker::{
    BUILD_LOG, BuildRequest, StartBuildResponse, WorkerBuildStatus, WorkerInfo, WorkerProxy,
    WorkerReport, WorkerStatus,
};
pub use http::HttpWorkerProxy;
pub use memory::MemoryWorker;

/// Hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(data))
}

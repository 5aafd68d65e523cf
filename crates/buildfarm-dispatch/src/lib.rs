//! Build dispatch for the build farm.
//!
//! Takes queued build jobs to remote workers and back: selects a base
//! image, pushes inputs, starts the build, interprets the worker's final
//! report and collects output files. Job state lives in a [`JobStore`]
//! (in memory or PostgreSQL with SKIP LOCKED claiming).
//!
//! [`JobStore`]: buildfarm_core::store::JobStore

pub mod collector;
pub mod content;
pub mod context;
pub mod dispatcher;
pub mod files;
pub mod manager;
pub mod notify;
pub mod pg;
pub mod session;
pub mod status;
pub mod store;

#[cfg(test)]
mod testing;

pub use collector::{ResultCollector, StagedUpload};
pub use content::FsContentStore;
pub use context::{ArchiveKeyring, BuildContext, BuildContextProvider, ImageRegistry};
pub use dispatcher::Dispatcher;
pub use files::{FileResolver, RegistryFileResolver, ResolvedFiles};
pub use manager::BuildManager;
pub use notify::{LogNotifier, StaticSourceCatalog};
pub use pg::PgJobStore;
pub use session::BuilderSession;
pub use status::StatusHandler;
pub use store::MemoryJobStore;

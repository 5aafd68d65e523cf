//! Core domain types and traits for the build farm dispatcher.
//!
//! This crate contains:
//! - Job identifiers, build jobs and the build status state machine
//! - Build kinds and their kind-specific build arguments
//! - The worker RPC trait and its request/status types
//! - Collaborator traits (job store, content store, notifier, source catalog)
//! - Secret values that never print in cleartext

pub mod args;
pub mod artifact;
pub mod error;
pub mod filemap;
pub mod id;
pub mod job;
pub mod kind;
pub mod notify;
pub mod secret;
pub mod source;
pub mod store;
pub mod worker;

pub use error::{Error, Result};
pub use id::{BuildCookie, ResourceId};
pub use job::{BuildJob, BuildStatus, BuildTarget, ImageSpec, ImageType, Pocket};

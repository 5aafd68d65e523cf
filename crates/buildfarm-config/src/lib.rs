//! KDL configuration parsing for the build farm dispatcher.
//!
//! This crate handles parsing of the farm configuration: the farm's
//! filesystem root, notification policy, workers, registered base images
//! and private archive credentials.

pub mod error;
pub mod farm;

pub use error::{ConfigError, ConfigResult};
pub use farm::{
    ArchiveAuthConfig, FarmConfig, ImageConfig, WorkerConfig, load_farm_config, parse_farm_config,
};

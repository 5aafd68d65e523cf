//! Worker RPC trait and its request/status types.
//!
//! Workers build jobs in isolated environments (chroots, LXD containers)
//! and report status and output files back.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::args::BuildArgs;
use crate::filemap::{FileLocator, FileMap, InputFiles};
use crate::job::{ImageType, Pocket};
use crate::{BuildCookie, Result};

/// Static facts about a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub name: String,
    pub url: String,
    /// Whether the worker is a throwaway virtual machine.
    pub virtualized: bool,
}

/// Everything a worker needs to start one build.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub cookie: BuildCookie,
    /// Builder type name, e.g. `binarypackage`.
    pub kind: &'static str,
    pub image_type: ImageType,
    pub base_image: FileLocator,
    pub pocket: Pocket,
    /// Build-specific inputs, excluding the base image.
    pub inputs: InputFiles,
    pub args: BuildArgs,
}

impl BuildRequest {
    /// Digests of the build-specific inputs.
    pub fn filemap(&self) -> FileMap {
        FileMap::of_inputs(&self.inputs)
    }

    /// Every file that must be on the worker before the build starts.
    pub fn transfers(&self) -> impl Iterator<Item = (&str, &FileLocator)> {
        std::iter::once((self.image_type_name(), &self.base_image))
            .chain(self.inputs.iter().map(|(name, loc)| (name.as_str(), loc)))
    }

    fn image_type_name(&self) -> &'static str {
        match self.image_type {
            ImageType::Lxd => "lxd",
            ImageType::Chroot => "chroot",
        }
    }
}

/// Reply to a start-build call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartBuildResponse {
    pub status: String,
    #[serde(default)]
    pub info: String,
}

/// What a worker reports once a build has finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerReport {
    /// Build status token, e.g. `OK` or `PACKAGEFAIL`.
    pub build_status: String,
    #[serde(default)]
    pub filemap: FileMap,
    /// Missing dependencies, for DEPFAIL.
    #[serde(default)]
    pub dependencies: Option<String>,
}

/// Worker state as returned by a status call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "builder_status", rename_all = "UPPERCASE")]
pub enum WorkerStatus {
    Idle,
    Building {
        #[serde(default)]
        logtail: Option<String>,
    },
    Aborting,
    /// Finished, waiting for results to be collected.
    Waiting(WorkerReport),
}

/// Build status tokens accepted from workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerBuildStatus {
    Ok,
    PackageFail,
    DepFail,
    ChrootFail,
    Aborted,
    GivenBack,
    BuilderFail,
    Unknown(String),
}

impl WorkerBuildStatus {
    pub fn parse(token: &str) -> Self {
        match token {
            "OK" => WorkerBuildStatus::Ok,
            "PACKAGEFAIL" => WorkerBuildStatus::PackageFail,
            "DEPFAIL" => WorkerBuildStatus::DepFail,
            "CHROOTFAIL" => WorkerBuildStatus::ChrootFail,
            "ABORTED" => WorkerBuildStatus::Aborted,
            "GIVENBACK" => WorkerBuildStatus::GivenBack,
            "BUILDERFAIL" => WorkerBuildStatus::BuilderFail,
            other => WorkerBuildStatus::Unknown(other.to_string()),
        }
    }
}

impl std::fmt::Display for WorkerBuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerBuildStatus::Ok => write!(f, "OK"),
            WorkerBuildStatus::PackageFail => write!(f, "PACKAGEFAIL"),
            WorkerBuildStatus::DepFail => write!(f, "DEPFAIL"),
            WorkerBuildStatus::ChrootFail => write!(f, "CHROOTFAIL"),
            WorkerBuildStatus::Aborted => write!(f, "ABORTED"),
            WorkerBuildStatus::GivenBack => write!(f, "GIVENBACK"),
            WorkerBuildStatus::BuilderFail => write!(f, "BUILDERFAIL"),
            WorkerBuildStatus::Unknown(token) => write!(f, "{}", token),
        }
    }
}

/// Name under which workers serve the build log.
pub const BUILD_LOG: &str = "buildlog";

/// RPC surface of a build worker.
#[async_trait]
pub trait WorkerProxy: Send + Sync {
    fn info(&self) -> &WorkerInfo;

    /// Make sure the worker has the file with this digest cached.
    ///
    /// Idempotent. Returns whether the file is present afterwards.
    async fn ensure_present(&self, locator: &FileLocator) -> Result<bool>;

    /// Start a build. All inputs must already be present.
    async fn start_build(&self, request: &BuildRequest) -> Result<StartBuildResponse>;

    async fn get_status(&self, cookie: &BuildCookie) -> Result<WorkerStatus>;

    /// Download a file by digest (or [`BUILD_LOG`]) to `destination`.
    async fn get_file(&self, key: &str, destination: &Path) -> Result<()>;

    /// Download several files concurrently; fails on the first error.
    async fn get_files(&self, files: &[(String, PathBuf)]) -> Result<()> {
        futures::future::try_join_all(
            files
                .iter()
                .map(|(key, destination)| self.get_file(key, destination)),
        )
        .await?;
        Ok(())
    }

    /// Ask the worker to abort the running build.
    async fn abort(&self, cookie: &BuildCookie) -> Result<()>;

    /// Reset the worker to idle once results are collected.
    async fn clean(&self, cookie: &BuildCookie) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status_tokens() {
        assert_eq!(WorkerBuildStatus::parse("OK"), WorkerBuildStatus::Ok);
        assert_eq!(WorkerBuildStatus::parse("DEPFAIL"), WorkerBuildStatus::DepFail);
        assert_eq!(
            WorkerBuildStatus::parse("ok"),
            WorkerBuildStatus::Unknown("ok".to_string())
        );
        assert_eq!(WorkerBuildStatus::parse("GIVENBACK").to_string(), "GIVENBACK");
    }

    #[test]
    fn test_worker_status_wire_format() {
        let json = r#"{"builder_status":"WAITING","build_status":"OK","filemap":{"out.deb":"ab"}}"#;
        let status: WorkerStatus = serde_json::from_str(json).unwrap();
        match status {
            WorkerStatus::Waiting(report) => {
                assert_eq!(report.build_status, "OK");
                assert_eq!(report.filemap.get("out.deb"), Some("ab"));
                assert!(report.dependencies.is_none());
            }
            other => panic!("unexpected status: {:?}", other),
        }

        let building: WorkerStatus =
            serde_json::from_str(r#"{"builder_status":"BUILDING","logtail":"make"}"#).unwrap();
        assert_eq!(
            building,
            WorkerStatus::Building {
                logtail: Some("make".to_string())
            }
        );
    }

    #[test]
    fn test_transfers_include_base_image_first() {
        let locator = |sha: &str| FileLocator {
            url: format!("https://files.example.net/{}", sha),
            sha256: sha.to_string(),
            credentials: None,
        };
        let mut inputs = InputFiles::new();
        inputs.insert("hello.dsc".to_string(), locator("b"));
        let request = BuildRequest {
            cookie: "binarypackage-1".parse::<BuildCookie>().unwrap(),
            kind: "binarypackage",
            image_type: ImageType::Chroot,
            base_image: locator("a"),
            pocket: Pocket::Release,
            inputs,
            args: BuildArgs::new(),
        };

        let names: Vec<&str> = request.transfers().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["chroot", "hello.dsc"]);
        assert_eq!(request.filemap().len(), 1);
    }
}

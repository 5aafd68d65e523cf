//! Build jobs and the build status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifact::ContentRef;
use crate::kind::BuildKind;
use crate::{BuildCookie, Error, ResourceId, Result};

/// Status of a build job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BuildStatus {
    /// Queued, waiting for a worker.
    NeedsBuild,
    /// Dispatched to a worker.
    Building,
    /// Cancellation requested while building; waiting for the worker to abort.
    Cancelling,
    /// Built successfully and handed to the uploader.
    Uploading,
    FailedToBuild,
    /// Build dependencies are missing.
    ManualDepWait,
    /// The base image is broken.
    ChrootWait,
    Cancelled,
    /// The source was superseded while the build ran.
    Superseded,
}

impl BuildStatus {
    pub const ALL: [BuildStatus; 9] = [
        BuildStatus::NeedsBuild,
        BuildStatus::Building,
        BuildStatus::Cancelling,
        BuildStatus::Uploading,
        BuildStatus::FailedToBuild,
        BuildStatus::ManualDepWait,
        BuildStatus::ChrootWait,
        BuildStatus::Cancelled,
        BuildStatus::Superseded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::NeedsBuild => "NEEDSBUILD",
            BuildStatus::Building => "BUILDING",
            BuildStatus::Cancelling => "CANCELLING",
            BuildStatus::Uploading => "UPLOADING",
            BuildStatus::FailedToBuild => "FAILEDTOBUILD",
            BuildStatus::ManualDepWait => "MANUALDEPWAIT",
            BuildStatus::ChrootWait => "CHROOTWAIT",
            BuildStatus::Cancelled => "CANCELLED",
            BuildStatus::Superseded => "SUPERSEDED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildStatus::Uploading
                | BuildStatus::FailedToBuild
                | BuildStatus::ManualDepWait
                | BuildStatus::ChrootWait
                | BuildStatus::Cancelled
                | BuildStatus::Superseded
        )
    }

    /// Whether the job is bound to a worker.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, BuildStatus::Building | BuildStatus::Cancelling)
    }

    /// The legal-transition table. `retry` is the only way out of a
    /// terminal status and is not a transition.
    pub fn can_transition_to(&self, next: BuildStatus) -> bool {
        use BuildStatus::*;
        match (self, next) {
            (NeedsBuild, Building) | (NeedsBuild, Cancelled) => true,
            (Building, Cancelling) => true,
            (Building, Cancelled) => false,
            (Building, next) | (Cancelling, next) => next.is_terminal(),
            _ => false,
        }
    }

    /// Whether `retry` may reset a job in this status.
    pub fn can_be_retried(&self) -> bool {
        !matches!(self, BuildStatus::NeedsBuild | BuildStatus::Uploading)
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BuildStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        BuildStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Unknown build status: {}", s))
    }
}

/// Kind of base filesystem used to isolate a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageType {
    /// LXD container image.
    Lxd,
    /// Classic chroot tarball.
    Chroot,
}

impl std::fmt::Display for ImageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageType::Lxd => write!(f, "lxd"),
            ImageType::Chroot => write!(f, "chroot"),
        }
    }
}

impl std::str::FromStr for ImageType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "lxd" => Ok(ImageType::Lxd),
            "chroot" => Ok(ImageType::Chroot),
            _ => Err(format!("Unknown image type: {}", s)),
        }
    }
}

/// Acceptable image types for a job, most preferred first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSpec(Vec<ImageType>);

impl ImageSpec {
    pub fn new(types: impl IntoIterator<Item = ImageType>) -> Self {
        Self(types.into_iter().collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = ImageType> + '_ {
        self.0.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for ImageSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.0.iter().map(|t| t.to_string()).collect();
        write!(f, "{}", names.join(", "))
    }
}

/// Archive pocket a build targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pocket {
    Release,
    Security,
    Updates,
    Proposed,
    Backports,
}

impl Pocket {
    /// Suite suffix (empty for the release pocket).
    pub fn suffix(&self) -> &'static str {
        match self {
            Pocket::Release => "",
            Pocket::Security => "-security",
            Pocket::Updates => "-updates",
            Pocket::Proposed => "-proposed",
            Pocket::Backports => "-backports",
        }
    }
}

impl std::fmt::Display for Pocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Pocket::Release => write!(f, "release"),
            Pocket::Security => write!(f, "security"),
            Pocket::Updates => write!(f, "updates"),
            Pocket::Proposed => write!(f, "proposed"),
            Pocket::Backports => write!(f, "backports"),
        }
    }
}

/// Purpose of the archive a build publishes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchivePurpose {
    Primary,
    Partner,
    Ppa,
    Copy,
}

impl std::fmt::Display for ArchivePurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArchivePurpose::Primary => write!(f, "PRIMARY"),
            ArchivePurpose::Partner => write!(f, "PARTNER"),
            ArchivePurpose::Ppa => write!(f, "PPA"),
            ArchivePurpose::Copy => write!(f, "COPY"),
        }
    }
}

/// Where a build runs and where its results go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildTarget {
    pub archive_id: i64,
    pub archive_purpose: ArchivePurpose,
    pub archive_private: bool,
    pub distribution: String,
    pub series: String,
    pub arch: String,
    pub pocket: Pocket,
}

impl BuildTarget {
    /// Suite name, e.g. `noble` or `noble-updates`.
    pub fn suite(&self) -> String {
        format!("{}{}", self.series, self.pocket.suffix())
    }
}

impl std::fmt::Display for BuildTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.distribution, self.suite(), self.arch)
    }
}

/// One build attempt.
///
/// The status is private: it only moves through [`BuildJob::transition_to`]
/// and [`BuildJob::retry`], which enforce the legal-transition table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildJob {
    pub id: ResourceId,
    pub cookie: BuildCookie,
    pub kind: BuildKind,
    pub target: BuildTarget,
    pub image_spec: ImageSpec,
    pub requires_virtualization: bool,
    status: BuildStatus,
    /// Queue entry owning this job while it is queued.
    pub queue_entry: Option<ResourceId>,
    pub date_created: DateTime<Utc>,
    pub date_first_dispatched: Option<DateTime<Utc>>,
    pub date_started: Option<DateTime<Utc>>,
    pub date_finished: Option<DateTime<Utc>>,
    /// Worker the job was last dispatched to.
    pub worker_name: Option<String>,
    pub log: Option<ContentRef>,
    /// Missing build dependencies reported with DEPFAIL.
    pub dependencies: Option<String>,
    /// Intake leaf directory holding the build's output.
    pub upload_leaf: Option<String>,
    pub failure_reason: Option<String>,
}

impl BuildJob {
    pub fn new(kind: BuildKind, target: BuildTarget) -> Self {
        let id = ResourceId::new();
        Self {
            cookie: BuildCookie::for_job(kind.name(), &id),
            image_spec: kind.default_image_spec(),
            requires_virtualization: target.archive_private,
            id,
            kind,
            target,
            status: BuildStatus::NeedsBuild,
            queue_entry: None,
            date_created: Utc::now(),
            date_first_dispatched: None,
            date_started: None,
            date_finished: None,
            worker_name: None,
            log: None,
            dependencies: None,
            upload_leaf: None,
            failure_reason: None,
        }
    }

    pub fn with_image_spec(mut self, spec: ImageSpec) -> Self {
        self.image_spec = spec;
        self
    }

    pub fn with_virtualization(mut self, required: bool) -> Self {
        self.requires_virtualization = required;
        self
    }

    pub fn status(&self) -> BuildStatus {
        self.status
    }

    /// Move to `next`, stamping the matching timestamp.
    pub fn transition_to(&mut self, next: BuildStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.status,
                to: next,
            });
        }

        let now = Utc::now();
        if next == BuildStatus::Building {
            self.date_started = Some(now);
            self.date_first_dispatched.get_or_insert(now);
        }
        if next.is_terminal() {
            self.date_finished = Some(now);
        }
        self.status = next;
        Ok(())
    }

    /// Take on a status observed in the store (e.g. an external cancel).
    ///
    /// Only moves along a legal edge, so this cannot be used to skip states.
    pub fn observe(&mut self, stored: BuildStatus) -> Result<()> {
        if stored == self.status {
            return Ok(());
        }
        self.transition_to(stored)
    }

    /// Reset to NEEDSBUILD, discarding everything from the previous attempt
    /// except `date_first_dispatched`.
    pub fn retry(&mut self) -> Result<()> {
        if !self.status.can_be_retried() {
            return Err(Error::InvalidTransition {
                from: self.status,
                to: BuildStatus::NeedsBuild,
            });
        }
        self.status = BuildStatus::NeedsBuild;
        self.date_started = None;
        self.date_finished = None;
        self.worker_name = None;
        self.log = None;
        self.dependencies = None;
        self.upload_leaf = None;
        self.failure_reason = None;
        Ok(())
    }

    /// Name under which the gzipped build log is stored.
    pub fn log_file_name(&self) -> String {
        format!(
            "buildlog_{}-{}-{}.{}.txt.gz",
            self.target.distribution, self.target.series, self.target.arch, self.cookie
        )
    }
}

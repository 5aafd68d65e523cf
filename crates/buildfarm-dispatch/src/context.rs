//! Build context: image selection and build arguments for a job.

use buildfarm_config::{ArchiveAuthConfig, FarmConfig, ImageConfig};
use buildfarm_core::args::BuildArgs;
use buildfarm_core::filemap::FileLocator;
use buildfarm_core::secret::Credentials;
use buildfarm_core::worker::WorkerInfo;
use buildfarm_core::{BuildJob, Error, ImageType, Pocket, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Base images known to the farm, by series, architecture and image type.
#[derive(Debug, Clone, Default)]
pub struct ImageRegistry {
    images: BTreeMap<(String, String, ImageType), FileLocator>,
}

impl ImageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(images: &[ImageConfig]) -> Self {
        let mut registry = Self::new();
        for image in images {
            registry.register(
                &image.series,
                &image.arch,
                image.image_type,
                FileLocator {
                    url: image.url.clone(),
                    sha256: image.sha256.clone(),
                    credentials: None,
                },
            );
        }
        registry
    }

    pub fn register(&mut self, series: &str, arch: &str, image_type: ImageType, locator: FileLocator) {
        self.images
            .insert((series.to_string(), arch.to_string(), image_type), locator);
    }

    pub fn get(&self, series: &str, arch: &str, image_type: ImageType) -> Option<&FileLocator> {
        self.images
            .get(&(series.to_string(), arch.to_string(), image_type))
    }

    pub fn has(&self, series: &str, arch: &str, image_type: ImageType) -> bool {
        self.get(series, arch, image_type).is_some()
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

/// Credentials for private archives, by archive id.
#[derive(Debug, Clone, Default)]
pub struct ArchiveKeyring {
    credentials: BTreeMap<i64, Credentials>,
}

impl ArchiveKeyring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(auth: &[ArchiveAuthConfig]) -> Self {
        let mut keyring = Self::new();
        for entry in auth {
            keyring.add(entry.archive_id, entry.credentials.clone());
        }
        keyring
    }

    pub fn add(&mut self, archive_id: i64, credentials: Credentials) {
        self.credentials.insert(archive_id, credentials);
    }

    pub fn get(&self, archive_id: i64) -> Option<&Credentials> {
        self.credentials.get(&archive_id)
    }
}

/// Everything about a dispatch that does not depend on file locations.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildContext {
    pub image_type: ImageType,
    pub pocket: Pocket,
    pub series: String,
    pub arch: String,
    pub args: BuildArgs,
}

/// Computes the build context for a job.
///
/// Has no side effects: the same job, worker and registry always give the
/// same context.
pub struct BuildContextProvider {
    images: Arc<ImageRegistry>,
    keyring: ArchiveKeyring,
    public_url: Option<String>,
}

impl BuildContextProvider {
    pub fn new(images: Arc<ImageRegistry>, keyring: ArchiveKeyring) -> Self {
        Self {
            images,
            keyring,
            public_url: None,
        }
    }

    pub fn from_config(config: &FarmConfig, images: Arc<ImageRegistry>) -> Self {
        let provider = Self::new(images, ArchiveKeyring::from_config(&config.archive_auth));
        match &config.public_url {
            Some(url) => provider.with_public_url(url.clone()),
            None => provider,
        }
    }

    /// Base URL used to build `build_url` arguments.
    pub fn with_public_url(mut self, url: impl Into<String>) -> Self {
        self.public_url = Some(url.into());
        self
    }

    /// First image type in the job's image spec with a registered image.
    pub fn select_image_type(&self, job: &BuildJob) -> Result<ImageType> {
        let target = &job.target;
        job.image_spec
            .iter()
            .find(|t| self.images.has(&target.series, &target.arch, *t))
            .ok_or_else(|| Error::NoImageAvailable {
                series: target.series.clone(),
                arch: target.arch.clone(),
                wanted: job.image_spec.to_string(),
            })
    }

    /// Archive credentials for the job, if its archive is private.
    pub fn credentials(&self, job: &BuildJob) -> Option<&Credentials> {
        if job.target.archive_private {
            self.keyring.get(job.target.archive_id)
        } else {
            None
        }
    }

    /// Check that the job may be sent to this worker.
    pub fn verify(&self, job: &BuildJob, worker: &WorkerInfo) -> Result<()> {
        if job.requires_virtualization && !worker.virtualized {
            return Err(Error::CannotBuild(format!(
                "{} requires a virtualized worker, {} is not",
                job.cookie, worker.name
            )));
        }
        if job.target.archive_private && self.credentials(job).is_none() {
            return Err(Error::CannotBuild(format!(
                "{} targets private archive {} with no credentials",
                job.cookie, job.target.archive_id
            )));
        }
        Ok(())
    }

    pub fn resolve(&self, job: &BuildJob, worker: &WorkerInfo) -> Result<BuildContext> {
        let image_type = self.select_image_type(job)?;
        let target = &job.target;

        let mut args = BuildArgs::new();
        args.insert("arch_tag", target.arch.clone());
        args.insert("series", target.series.clone());
        args.insert("suite", target.suite());
        args.insert("archive_private", target.archive_private);
        args.insert("fast_cleanup", worker.virtualized);
        args.insert("image_type", image_type.to_string());
        if let Some(base) = &self.public_url {
            args.insert(
                "build_url",
                format!("{}/builds/{}", base.trim_end_matches('/'), job.cookie),
            );
        }
        args.extend(job.kind.extra_args(target, self.credentials(job)));

        Ok(BuildContext {
            image_type,
            pocket: target.pocket,
            series: target.series.clone(),
            arch: target.arch.clone(),
            args,
        })
    }
}

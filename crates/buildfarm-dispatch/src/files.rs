//! Input file resolution.

use buildfarm_core::filemap::{FileLocator, InputFiles};
use buildfarm_core::secret::Credentials;
use buildfarm_core::{BuildJob, Error, ImageType, Result};
use std::sync::Arc;

use crate::context::ImageRegistry;

/// Files a worker must hold before a build starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFiles {
    pub base_image: FileLocator,
    pub inputs: InputFiles,
}

/// Locates the base image and build inputs for a job.
pub trait FileResolver: Send + Sync {
    fn resolve(
        &self,
        job: &BuildJob,
        image_type: ImageType,
        credentials: Option<&Credentials>,
    ) -> Result<ResolvedFiles>;
}

/// Resolves base images from an [`ImageRegistry`] and inputs from the
/// job's build kind.
pub struct RegistryFileResolver {
    images: Arc<ImageRegistry>,
}

impl RegistryFileResolver {
    pub fn new(images: Arc<ImageRegistry>) -> Self {
        Self { images }
    }
}

impl FileResolver for RegistryFileResolver {
    fn resolve(
        &self,
        job: &BuildJob,
        image_type: ImageType,
        credentials: Option<&Credentials>,
    ) -> Result<ResolvedFiles> {
        let target = &job.target;
        let base_image = self
            .images
            .get(&target.series, &target.arch, image_type)
            .cloned()
            .ok_or_else(|| {
                Error::CannotBuild(format!(
                    "no {} image for {}/{}",
                    image_type, target.series, target.arch
                ))
            })?;

        Ok(ResolvedFiles {
            base_image,
            inputs: job.kind.input_files(credentials),
        })
    }
}

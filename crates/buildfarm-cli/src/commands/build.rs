//! Single-job commands: compose a request, or build a job end to end.

use anyhow::{Context, Result};
use buildfarm_core::kind::BuildKind;
use buildfarm_core::store::JobStore;
use buildfarm_core::{BuildJob, BuildTarget, ImageSpec};
use buildfarm_dispatch::MemoryJobStore;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

use super::{Farm, load_config};

/// A job description as written by an operator.
#[derive(Debug, Deserialize)]
struct JobFile {
    build: BuildKind,
    target: BuildTarget,
    #[serde(default)]
    image_spec: Option<ImageSpec>,
    #[serde(default)]
    requires_virtualization: Option<bool>,
}

impl JobFile {
    fn into_job(self) -> BuildJob {
        let mut job = BuildJob::new(self.build, self.target);
        if let Some(spec) = self.image_spec {
            job = job.with_image_spec(spec);
        }
        if let Some(required) = self.requires_virtualization {
            job = job.with_virtualization(required);
        }
        job
    }
}

fn parse_job(content: &str) -> Result<BuildJob> {
    let file: JobFile = serde_json::from_str(content)?;
    Ok(file.into_job())
}

fn load_job(path: &str) -> Result<BuildJob> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read job file: {}", path))?;
    parse_job(&content).with_context(|| format!("Failed to parse job file: {}", path))
}

/// Print the request a job would be dispatched with. Secrets are redacted.
pub fn compose(config_path: &str, job_path: &str, worker: &str) -> Result<()> {
    let farm = Farm::new(load_config(config_path)?, Arc::new(MemoryJobStore::new()));
    let job = load_job(job_path)?;
    let request = farm
        .dispatcher
        .compose_build_request(&job, &farm.worker_info(worker)?)?;

    let view = json!({
        "cookie": request.cookie.as_str(),
        "builder_type": request.kind,
        "image_type": request.image_type.to_string(),
        "base_image": {
            "url": request.base_image.url,
            "sha256": request.base_image.sha256,
        },
        "pocket": request.pocket.to_string(),
        "filemap": request.filemap(),
        "args": request.args.redacted(),
    });
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}

/// Build one job on one worker, waiting for the terminal status.
pub async fn run(config_path: &str, job_path: &str, worker: &str) -> Result<()> {
    let farm = Farm::new(load_config(config_path)?, Arc::new(MemoryJobStore::new()));
    let job = farm.store.enqueue(load_job(job_path)?).await?;
    let proxy = farm.worker(worker)?;
    info!(cookie = %job.cookie, worker = %worker, "Building {}", job.kind.title());

    let job = farm
        .store
        .claim(worker, proxy.info().virtualized)
        .await?
        .context("Job could not be claimed by this worker")?;
    let job = farm.manager().build(job, proxy).await?;

    println!("{}: {}", job.cookie, job.status());
    if let Some(leaf) = &job.upload_leaf {
        println!("  Upload: {}", farm.config.incoming_dir().join(leaf).display());
    }
    if let Some(log) = &job.log {
        println!("  Log:    {}", log.location);
    }
    if let Some(deps) = &job.dependencies {
        println!("  Missing dependencies: {}", deps);
    }
    Ok(())
}

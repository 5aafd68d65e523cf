//! Long-running dispatcher and queue maintenance commands.

use anyhow::{Context, Result};
use buildfarm_core::ResourceId;
use buildfarm_core::store::JobStore;
use buildfarm_dispatch::PgJobStore;
use buildfarm_dispatch::pg::{create_pool, run_migrations};
use std::sync::Arc;
use tracing::info;

use super::{Farm, load_config};

async fn connect(database_url: &str) -> Result<PgJobStore> {
    info!("Connecting to database...");
    let pool = create_pool(database_url)
        .await
        .context("Failed to connect to database")?;
    run_migrations(&pool)
        .await
        .context("Failed to run migrations")?;
    Ok(PgJobStore::new(pool))
}

fn parse_id(id: &str) -> Result<ResourceId> {
    id.parse()
        .with_context(|| format!("Invalid build ID: {}", id))
}

/// Run a manager loop for every configured worker.
pub async fn serve(config_path: &str, database_url: &str) -> Result<()> {
    let config = load_config(config_path)?;
    if config.workers.is_empty() {
        anyhow::bail!("No workers configured in {}", config_path);
    }
    let store = Arc::new(connect(database_url).await?);
    let farm = Arc::new(Farm::new(config, store));

    let mut loops = Vec::new();
    for worker in &farm.config.workers {
        let proxy = farm.worker(&worker.name)?;
        let manager = farm.manager();
        loops.push(tokio::spawn(async move { manager.run(proxy).await }));
    }
    info!(farm = %farm.config.name, workers = loops.len(), "Dispatcher running");

    for result in futures::future::join_all(loops).await {
        result.context("Manager task failed")?;
    }
    Ok(())
}

pub async fn cancel(database_url: &str, id: &str) -> Result<()> {
    let store = connect(database_url).await?;
    let status = store.request_cancel(parse_id(id)?).await?;
    println!("{}: {}", id, status);
    Ok(())
}

pub async fn retry(database_url: &str, id: &str) -> Result<()> {
    let store = connect(database_url).await?;
    let job = store.retry(parse_id(id)?).await?;
    println!("{}: {}", job.cookie, job.status());
    Ok(())
}

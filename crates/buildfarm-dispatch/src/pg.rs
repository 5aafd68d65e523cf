//! Job store backed by PostgreSQL.
//!
//! Builds live in `builds` with their full record as JSON; the queue lives
//! in `build_queue`. Claims use SKIP LOCKED so several dispatchers can share
//! one queue, and every terminal commit updates the build and deletes its
//! queue row in one transaction.

use async_trait::async_trait;
use buildfarm_core::store::JobStore;
use buildfarm_core::{BuildJob, BuildStatus, Error, ResourceId, Result};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgExecutor, PgPool};
use tracing::debug;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .map_err(storage)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(storage)
}

fn storage(e: impl std::fmt::Display) -> Error {
    Error::Storage(e.to_string())
}

#[derive(Debug, sqlx::FromRow)]
struct BuildRow {
    payload: Value,
    queue_id: Option<uuid::Uuid>,
}

impl BuildRow {
    fn into_job(self) -> Result<BuildJob> {
        let mut job: BuildJob = serde_json::from_value(self.payload).map_err(storage)?;
        job.queue_entry = self.queue_id.map(ResourceId::from);
        Ok(job)
    }
}

fn payload(job: &BuildJob) -> Result<Value> {
    serde_json::to_value(job).map_err(storage)
}

async fn current_status<'e>(executor: impl PgExecutor<'e>, id: ResourceId) -> Result<BuildStatus> {
    let status: Option<String> = sqlx::query_scalar("SELECT status FROM builds WHERE id = $1")
        .bind(id.as_uuid())
        .fetch_optional(executor)
        .await
        .map_err(storage)?;
    status
        .ok_or_else(|| Error::NotFound(format!("build {}", id)))?
        .parse()
        .map_err(Error::Storage)
}

async fn lock_job<'e>(executor: impl PgExecutor<'e>, id: ResourceId) -> Result<BuildJob> {
    let payload: Value = sqlx::query_scalar("SELECT payload FROM builds WHERE id = $1 FOR UPDATE")
        .bind(id.as_uuid())
        .fetch_optional(executor)
        .await
        .map_err(storage)?
        .ok_or_else(|| Error::NotFound(format!("build {}", id)))?;
    serde_json::from_value(payload).map_err(storage)
}

const UPDATE_BUILD: &str = r#"
    UPDATE builds SET status = $2, payload = $3, updated_at = NOW()
    WHERE id = $1
"#;

const COMPARE_AND_SWAP_BUILD: &str = r#"
    UPDATE builds SET status = $2, payload = $3, updated_at = NOW()
    WHERE id = $1 AND status = $4
"#;

/// Job store backed by PostgreSQL.
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn stale(job: &BuildJob, expected: BuildStatus, found: BuildStatus) -> Error {
        Error::StaleStatus {
            job: job.cookie.to_string(),
            expected,
            found,
        }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn enqueue(&self, mut job: BuildJob) -> Result<BuildJob> {
        if job.status() != BuildStatus::NeedsBuild {
            return Err(Error::InvalidTransition {
                from: job.status(),
                to: BuildStatus::NeedsBuild,
            });
        }
        let entry = ResourceId::new();
        job.queue_entry = Some(entry);

        let mut tx = self.pool.begin().await.map_err(storage)?;
        sqlx::query(
            r#"
            INSERT INTO builds (id, cookie, status, requires_virtualization, payload, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, NOW(), NOW())
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.cookie.as_str())
        .bind(job.status().as_str())
        .bind(job.requires_virtualization)
        .bind(payload(&job)?)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;
        sqlx::query("INSERT INTO build_queue (id, build_id, created_at) VALUES ($1, $2, NOW())")
            .bind(entry.as_uuid())
            .bind(job.id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        tx.commit().await.map_err(storage)?;

        debug!(cookie = %job.cookie, "Enqueued build");
        Ok(job)
    }

    /// Claim the next available build.
    /// Uses SKIP LOCKED to prevent contention between dispatchers.
    async fn claim_excluding(
        &self,
        worker: &str,
        virtualized: bool,
        skip: &[ResourceId],
    ) -> Result<Option<BuildJob>> {
        let skip: Vec<uuid::Uuid> = skip.iter().map(|id| *id.as_uuid()).collect();
        let claimed: Option<uuid::Uuid> = sqlx::query_scalar(
            r#"
            UPDATE build_queue
            SET claimed_by = $1, claimed_at = NOW()
            WHERE id = (
                SELECT q.id FROM build_queue q
                JOIN builds b ON b.id = q.build_id
                WHERE q.claimed_by IS NULL
                  AND b.status = 'NEEDSBUILD'
                  AND (NOT b.requires_virtualization OR $2)
                  AND NOT (q.build_id = ANY($3))
                ORDER BY q.created_at ASC
                FOR UPDATE OF q SKIP LOCKED
                LIMIT 1
            )
            RETURNING build_id
            "#,
        )
        .bind(worker)
        .bind(virtualized)
        .bind(&skip)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        match claimed {
            Some(id) => self.load(ResourceId::from(id)).await.map(Some),
            None => Ok(None),
        }
    }

    /// Release a claimed build back to the queue.
    async fn release(&self, id: ResourceId) -> Result<()> {
        sqlx::query(
            "UPDATE build_queue SET claimed_by = NULL, claimed_at = NULL WHERE build_id = $1",
        )
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn load(&self, id: ResourceId) -> Result<BuildJob> {
        sqlx::query_as::<_, BuildRow>(
            r#"
            SELECT b.payload, q.id AS queue_id
            FROM builds b
            LEFT JOIN build_queue q ON q.build_id = b.id
            WHERE b.id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?
        .ok_or_else(|| Error::NotFound(format!("build {}", id)))?
        .into_job()
    }

    async fn commit(&self, job: &BuildJob, expected: BuildStatus) -> Result<()> {
        if job.status().is_terminal() {
            return Err(Error::Internal(format!(
                "{} is terminal and must be committed with commit_terminal",
                job.status()
            )));
        }
        let result = sqlx::query(COMPARE_AND_SWAP_BUILD)
            .bind(job.id.as_uuid())
            .bind(job.status().as_str())
            .bind(payload(job)?)
            .bind(expected.as_str())
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        if result.rows_affected() == 0 {
            let found = current_status(&self.pool, job.id).await?;
            return Err(Self::stale(job, expected, found));
        }
        Ok(())
    }

    async fn commit_terminal(&self, job: &BuildJob, expected: BuildStatus) -> Result<()> {
        if !job.status().is_terminal() {
            return Err(Error::Internal(format!("{} is not terminal", job.status())));
        }
        let mut stored = job.clone();
        stored.queue_entry = None;

        let mut tx = self.pool.begin().await.map_err(storage)?;
        let result = sqlx::query(COMPARE_AND_SWAP_BUILD)
            .bind(job.id.as_uuid())
            .bind(job.status().as_str())
            .bind(payload(&stored)?)
            .bind(expected.as_str())
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        if result.rows_affected() == 0 {
            let found = current_status(&mut *tx, job.id).await?;
            return Err(Self::stale(job, expected, found));
        }
        sqlx::query("DELETE FROM build_queue WHERE build_id = $1")
            .bind(job.id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        tx.commit().await.map_err(storage)?;

        debug!(cookie = %job.cookie, status = %job.status(), "Committed terminal status");
        Ok(())
    }

    async fn is_queued(&self, id: ResourceId) -> Result<bool> {
        let (exists, queued): (bool, bool) = sqlx::query_as(
            r#"
            SELECT EXISTS (SELECT 1 FROM builds WHERE id = $1),
                   EXISTS (SELECT 1 FROM build_queue WHERE build_id = $1)
            "#,
        )
        .bind(id.as_uuid())
        .fetch_one(&self.pool)
        .await
        .map_err(storage)?;
        if !exists {
            return Err(Error::NotFound(format!("build {}", id)));
        }
        Ok(queued)
    }

    async fn request_cancel(&self, id: ResourceId) -> Result<BuildStatus> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let mut job = lock_job(&mut *tx, id).await?;
        match job.status() {
            BuildStatus::Cancelling => return Ok(BuildStatus::Cancelling),
            BuildStatus::Building => job.transition_to(BuildStatus::Cancelling)?,
            _ => {
                job.transition_to(BuildStatus::Cancelled)?;
                job.queue_entry = None;
                sqlx::query("DELETE FROM build_queue WHERE build_id = $1")
                    .bind(id.as_uuid())
                    .execute(&mut *tx)
                    .await
                    .map_err(storage)?;
            }
        }
        sqlx::query(UPDATE_BUILD)
            .bind(id.as_uuid())
            .bind(job.status().as_str())
            .bind(payload(&job)?)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        tx.commit().await.map_err(storage)?;
        Ok(job.status())
    }

    async fn retry(&self, id: ResourceId) -> Result<BuildJob> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let mut job = lock_job(&mut *tx, id).await?;
        job.retry()?;
        sqlx::query(UPDATE_BUILD)
            .bind(id.as_uuid())
            .bind(job.status().as_str())
            .bind(payload(&job)?)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        sqlx::query(
            r#"
            INSERT INTO build_queue (id, build_id, created_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (build_id) DO UPDATE SET claimed_by = NULL, claimed_at = NULL
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(id.as_uuid())
        .execute(&mut *tx)
        .await
        .map_err(storage)?;
        tx.commit().await.map_err(storage)?;

        self.load(id).await
    }
}

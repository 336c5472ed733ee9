//! Postgres-backed job store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | JobStoreError |
//! |------------|---------------|
//! | RowNotFound | `NotFound` |
//! | Database / PoolClosed / other | `Storage` |
//!
//! Instance status writes mirror the new status onto `jobworks_jobs.status` in
//! the same transaction.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use jobworks_core::{InstanceId, JobId, JobStatus};

use super::store::{JobStore, JobStoreError};
use super::types::{InstanceRecord, InstanceState, JobRecord};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobworks_jobs (
    id          UUID PRIMARY KEY,
    name        TEXT NOT NULL,
    status      TEXT NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS jobworks_job_instances (
    id             UUID PRIMARY KEY,
    seq            BIGSERIAL NOT NULL,
    job_id         UUID NOT NULL REFERENCES jobworks_jobs (id),
    job_name       TEXT NOT NULL,
    args           JSONB NOT NULL,
    operator       TEXT,
    status         TEXT NOT NULL,
    progress       SMALLINT NOT NULL DEFAULT 0 CHECK (progress BETWEEN 0 AND 100),
    progress_text  TEXT NOT NULL DEFAULT '',
    log            TEXT NOT NULL DEFAULT '',
    created_at     TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS jobworks_job_instances_job_idx
    ON jobworks_job_instances (job_id, created_at, seq);
"#;

/// Postgres-backed job store.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the job tables if they do not exist yet.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    async fn mirror_status(
        tx: &mut Transaction<'_, Postgres>,
        instance_id: InstanceId,
        status: JobStatus,
    ) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            UPDATE jobworks_jobs SET status = $2
            WHERE id = (SELECT job_id FROM jobworks_job_instances WHERE id = $1)
            "#,
        )
        .bind(instance_id.as_uuid())
        .bind(status.as_str())
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("mirror_status", e))?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, job_name = %job.name), err)]
    async fn create_job(&self, job: &JobRecord) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            INSERT INTO jobworks_jobs (id, name, status, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(&job.name)
        .bind(job.status.as_str())
        .bind(job.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_job", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get_job(&self, job_id: JobId) -> Result<JobRecord, JobStoreError> {
        let row = sqlx::query("SELECT id, name, status, created_at FROM jobworks_jobs WHERE id = $1")
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?
            .ok_or_else(|| JobStoreError::job_not_found(job_id))?;
        JobRow::from_row(&row)
            .map_err(|e| map_sqlx_error("decode_job", e))?
            .try_into()
    }

    #[instrument(skip(self, instance), fields(instance_id = %instance.id, job_id = %instance.job_id), err)]
    async fn create_instance(&self, instance: &InstanceRecord) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            INSERT INTO jobworks_job_instances (
                id, job_id, job_name, args, operator,
                status, progress, progress_text, log, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(instance.id.as_uuid())
        .bind(instance.job_id.as_uuid())
        .bind(&instance.job_name)
        .bind(&instance.args)
        .bind(&instance.operator)
        .bind(instance.state.status.as_str())
        .bind(instance.state.progress as i16)
        .bind(&instance.state.progress_text)
        .bind(&instance.state.log)
        .bind(instance.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_instance", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %job_id, %status), err)]
    async fn update_job_status(&self, job_id: JobId, status: JobStatus) -> Result<(), JobStoreError> {
        let updated = sqlx::query("UPDATE jobworks_jobs SET status = $2 WHERE id = $1")
            .bind(job_id.as_uuid())
            .bind(status.as_str())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("update_job_status", e))?;
        if updated.rows_affected() == 0 {
            return Err(JobStoreError::job_not_found(job_id));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(instance_id = %instance_id), err)]
    async fn get_instance(&self, instance_id: InstanceId) -> Result<InstanceRecord, JobStoreError> {
        let row = sqlx::query(&format!("{INSTANCE_COLUMNS} WHERE id = $1"))
            .bind(instance_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_instance", e))?
            .ok_or_else(|| JobStoreError::instance_not_found(instance_id))?;
        InstanceRow::from_row(&row)
            .map_err(|e| map_sqlx_error("decode_instance", e))?
            .try_into()
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn latest_instance(&self, job_id: JobId) -> Result<InstanceRecord, JobStoreError> {
        let row = sqlx::query(&format!(
            "{INSTANCE_COLUMNS} WHERE job_id = $1 ORDER BY created_at DESC, seq DESC LIMIT 1"
        ))
        .bind(job_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("latest_instance", e))?
        .ok_or_else(|| JobStoreError::NotFound(format!("instance of job {job_id}")))?;
        InstanceRow::from_row(&row)
            .map_err(|e| map_sqlx_error("decode_instance", e))?
            .try_into()
    }

    #[instrument(skip(self, state), fields(instance_id = %instance_id, status = %state.status), err)]
    async fn save_instance(
        &self,
        instance_id: InstanceId,
        state: &InstanceState,
    ) -> Result<(), JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let updated = sqlx::query(
            r#"
            UPDATE jobworks_job_instances
            SET status = $2, progress = $3, progress_text = $4, log = $5
            WHERE id = $1
            "#,
        )
        .bind(instance_id.as_uuid())
        .bind(state.status.as_str())
        .bind(state.progress as i16)
        .bind(&state.progress_text)
        .bind(&state.log)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("save_instance", e))?;

        if updated.rows_affected() == 0 {
            return Err(JobStoreError::instance_not_found(instance_id));
        }

        Self::mirror_status(&mut tx, instance_id, state.status).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(instance_id = %instance_id, %expected, %next), err)]
    async fn compare_and_set_status(
        &self,
        instance_id: InstanceId,
        expected: JobStatus,
        next: JobStatus,
    ) -> Result<bool, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let updated = sqlx::query(
            "UPDATE jobworks_job_instances SET status = $3 WHERE id = $1 AND status = $2",
        )
        .bind(instance_id.as_uuid())
        .bind(expected.as_str())
        .bind(next.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("compare_and_set_status", e))?;

        if updated.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(false);
        }

        Self::mirror_status(&mut tx, instance_id, next).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(true)
    }

    #[instrument(skip(self), err)]
    async fn list_jobs(&self, limit: usize) -> Result<Vec<JobRecord>, JobStoreError> {
        let rows = sqlx::query(
            "SELECT id, name, status, created_at FROM jobworks_jobs ORDER BY created_at DESC, id DESC LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_jobs", e))?;

        rows.iter()
            .map(|row| {
                JobRow::from_row(row)
                    .map_err(|e| map_sqlx_error("decode_job", e))?
                    .try_into()
            })
            .collect()
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn list_instances(&self, job_id: JobId) -> Result<Vec<InstanceRecord>, JobStoreError> {
        // Distinguish "unknown job" from "no instances yet".
        self.get_job(job_id).await?;

        let rows = sqlx::query(&format!(
            "{INSTANCE_COLUMNS} WHERE job_id = $1 ORDER BY created_at ASC, seq ASC"
        ))
        .bind(job_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_instances", e))?;

        rows.iter()
            .map(|row| {
                InstanceRow::from_row(row)
                    .map_err(|e| map_sqlx_error("decode_instance", e))?
                    .try_into()
            })
            .collect()
    }
}

const INSTANCE_COLUMNS: &str = r#"
    SELECT id, job_id, job_name, args, operator,
           status, progress, progress_text, log, created_at
    FROM jobworks_job_instances
"#;

/// Map SQLx errors to `JobStoreError`.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            JobStoreError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::RowNotFound => {
            JobStoreError::NotFound(format!("row in {}", operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn parse_status(raw: &str) -> Result<JobStatus, JobStoreError> {
    raw.parse()
        .map_err(|_| JobStoreError::Storage(format!("unknown job status in database: {raw}")))
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    name: String,
    status: String,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for JobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<JobRow> for JobRecord {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(JobRecord {
            id: JobId::from_uuid(row.id),
            name: row.name,
            status: parse_status(&row.status)?,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug)]
struct InstanceRow {
    id: uuid::Uuid,
    job_id: uuid::Uuid,
    job_name: String,
    args: serde_json::Value,
    operator: Option<String>,
    status: String,
    progress: i16,
    progress_text: String,
    log: String,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for InstanceRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(InstanceRow {
            id: row.try_get("id")?,
            job_id: row.try_get("job_id")?,
            job_name: row.try_get("job_name")?,
            args: row.try_get("args")?,
            operator: row.try_get("operator")?,
            status: row.try_get("status")?,
            progress: row.try_get("progress")?,
            progress_text: row.try_get("progress_text")?,
            log: row.try_get("log")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<InstanceRow> for InstanceRecord {
    type Error = JobStoreError;

    fn try_from(row: InstanceRow) -> Result<Self, Self::Error> {
        Ok(InstanceRecord {
            id: InstanceId::from_uuid(row.id),
            job_id: JobId::from_uuid(row.job_id),
            job_name: row.job_name,
            args: row.args,
            operator: row.operator,
            state: InstanceState {
                status: parse_status(&row.status)?,
                progress: row.progress.clamp(0, 100) as u8,
                progress_text: row.progress_text,
                log: row.log,
            },
            created_at: row.created_at,
        })
    }
}

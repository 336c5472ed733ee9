//! Postgres-backed lease table.
//!
//! Leasing uses `FOR UPDATE SKIP LOCKED`, so any number of worker processes can
//! poll the same queue without handing one item to two of them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;

use jobworks_core::{InstanceId, JobId};

use super::store::{LeaseItemId, LeasePlan, LeaseStore, LeaseStoreError, LeasedItem};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobworks_lease_items (
    id            BIGSERIAL PRIMARY KEY,
    queue         TEXT NOT NULL,
    job_id        UUID NOT NULL,
    instance_id   UUID NOT NULL,
    args          JSONB NOT NULL,
    run_at        TIMESTAMPTZ NOT NULL,
    leased_until  TIMESTAMPTZ,
    expired_at    TIMESTAMPTZ,
    done_at       TIMESTAMPTZ,
    failed_at     TIMESTAMPTZ,
    last_error    TEXT,
    created_at    TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS jobworks_lease_items_due_idx
    ON jobworks_lease_items (queue, run_at, id)
    WHERE done_at IS NULL AND failed_at IS NULL;

CREATE INDEX IF NOT EXISTS jobworks_lease_items_instance_idx
    ON jobworks_lease_items (instance_id);

CREATE TABLE IF NOT EXISTS jobworks_worker_errors (
    id          BIGSERIAL PRIMARY KEY,
    queue       TEXT NOT NULL,
    error       TEXT NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
"#;

/// Postgres-backed lease store.
#[derive(Debug, Clone)]
pub struct PostgresLeaseStore {
    pool: Arc<PgPool>,
}

impl PostgresLeaseStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the lease tables if they do not exist yet.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), LeaseStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    async fn update_item(
        &self,
        operation: &str,
        sql: &str,
        id: LeaseItemId,
        text: Option<&str>,
    ) -> Result<(), LeaseStoreError> {
        let mut query = sqlx::query(sql).bind(id);
        if let Some(text) = text {
            query = query.bind(text);
        }
        let updated = query
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        if updated.rows_affected() == 0 {
            return Err(LeaseStoreError::NotFound(id));
        }
        Ok(())
    }
}

#[async_trait]
impl LeaseStore for PostgresLeaseStore {
    #[instrument(skip(self, plan), fields(queue = %plan.queue, instance_id = %plan.instance_id), err)]
    async fn enqueue(&self, plan: &LeasePlan) -> Result<LeaseItemId, LeaseStoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO jobworks_lease_items (queue, job_id, instance_id, args, run_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(&plan.queue)
        .bind(plan.job_id.as_uuid())
        .bind(plan.instance_id.as_uuid())
        .bind(&plan.args)
        .bind(plan.run_at)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?;

        row.try_get("id").map_err(|e| map_sqlx_error("enqueue", e))
    }

    #[instrument(skip(self), err)]
    async fn lease(
        &self,
        queue: &str,
        lease_for: Duration,
    ) -> Result<Option<LeasedItem>, LeaseStoreError> {
        let row = sqlx::query(
            r#"
            UPDATE jobworks_lease_items
            SET leased_until = NOW() + ($2::bigint * INTERVAL '1 millisecond')
            WHERE id = (
                SELECT id FROM jobworks_lease_items
                WHERE queue = $1
                  AND done_at IS NULL AND failed_at IS NULL
                  AND (expired_at IS NULL OR leased_until IS NOT NULL)
                  AND run_at <= NOW()
                  AND (leased_until IS NULL OR leased_until < NOW())
                ORDER BY run_at ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, queue, job_id, instance_id, args, run_at, leased_until
            "#,
        )
        .bind(queue)
        .bind(i64::try_from(lease_for.as_millis()).unwrap_or(i64::MAX))
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("lease", e))?;

        row.map(|row| {
            LeasedRow::from_row(&row)
                .map(Into::into)
                .map_err(|e| map_sqlx_error("decode_lease", e))
        })
        .transpose()
    }

    #[instrument(skip(self), err)]
    async fn renew(
        &self,
        id: LeaseItemId,
        lease_for: Duration,
    ) -> Result<DateTime<Utc>, LeaseStoreError> {
        let row = sqlx::query(
            r#"
            UPDATE jobworks_lease_items
            SET leased_until = NOW() + ($2::bigint * INTERVAL '1 millisecond')
            WHERE id = $1 AND done_at IS NULL AND failed_at IS NULL
            RETURNING leased_until
            "#,
        )
        .bind(id)
        .bind(i64::try_from(lease_for.as_millis()).unwrap_or(i64::MAX))
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("renew", e))?
        .ok_or(LeaseStoreError::NotFound(id))?;
        row.try_get("leased_until")
            .map_err(|e| map_sqlx_error("renew", e))
    }

    #[instrument(skip(self), fields(instance_id = %instance_id), err)]
    async fn is_leased(&self, instance_id: InstanceId) -> Result<bool, LeaseStoreError> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM jobworks_lease_items
                WHERE instance_id = $1
                  AND done_at IS NULL AND failed_at IS NULL
                  AND leased_until >= NOW()
            ) AS leased
            "#,
        )
        .bind(instance_id.as_uuid())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("is_leased", e))?;
        row.try_get("leased")
            .map_err(|e| map_sqlx_error("is_leased", e))
    }

    #[instrument(skip(self), err)]
    async fn expiration(&self, id: LeaseItemId) -> Result<Option<DateTime<Utc>>, LeaseStoreError> {
        let row = sqlx::query("SELECT expired_at FROM jobworks_lease_items WHERE id = $1")
            .bind(id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("expiration", e))?
            .ok_or(LeaseStoreError::NotFound(id))?;
        row.try_get("expired_at")
            .map_err(|e| map_sqlx_error("expiration", e))
    }

    #[instrument(skip(self), fields(instance_id = %instance_id), err)]
    async fn expire_instance(
        &self,
        instance_id: InstanceId,
        at: DateTime<Utc>,
    ) -> Result<bool, LeaseStoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE jobworks_lease_items
            SET expired_at = COALESCE(expired_at, $2)
            WHERE instance_id = $1 AND done_at IS NULL AND failed_at IS NULL
            "#,
        )
        .bind(instance_id.as_uuid())
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("expire_instance", e))?;
        Ok(updated.rows_affected() > 0)
    }

    #[instrument(skip(self), err)]
    async fn mark_done(&self, id: LeaseItemId) -> Result<(), LeaseStoreError> {
        self.update_item(
            "mark_done",
            "UPDATE jobworks_lease_items SET done_at = NOW(), leased_until = NULL WHERE id = $1",
            id,
            None,
        )
        .await
    }

    #[instrument(skip(self), err)]
    async fn mark_failed(&self, id: LeaseItemId, error: &str) -> Result<(), LeaseStoreError> {
        self.update_item(
            "mark_failed",
            "UPDATE jobworks_lease_items SET failed_at = NOW(), leased_until = NULL, last_error = $2 WHERE id = $1",
            id,
            Some(error),
        )
        .await
    }

    #[instrument(skip(self), err)]
    async fn mark_expired(&self, id: LeaseItemId, reason: &str) -> Result<(), LeaseStoreError> {
        self.update_item(
            "mark_expired",
            "UPDATE jobworks_lease_items SET expired_at = COALESCE(expired_at, NOW()), leased_until = NULL, last_error = $2 WHERE id = $1",
            id,
            Some(reason),
        )
        .await
    }

    #[instrument(skip(self), err)]
    async fn record_worker_error(&self, queue: &str, error: &str) -> Result<(), LeaseStoreError> {
        sqlx::query("INSERT INTO jobworks_worker_errors (queue, error) VALUES ($1, $2)")
            .bind(queue)
            .bind(error)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("record_worker_error", e))?;
        Ok(())
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LeaseStoreError {
    match err {
        sqlx::Error::Database(db_err) => LeaseStoreError::Storage(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            LeaseStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => LeaseStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

#[derive(Debug)]
struct LeasedRow {
    id: i64,
    queue: String,
    job_id: uuid::Uuid,
    instance_id: uuid::Uuid,
    args: serde_json::Value,
    run_at: DateTime<Utc>,
    leased_until: DateTime<Utc>,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for LeasedRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(LeasedRow {
            id: row.try_get("id")?,
            queue: row.try_get("queue")?,
            job_id: row.try_get("job_id")?,
            instance_id: row.try_get("instance_id")?,
            args: row.try_get("args")?,
            run_at: row.try_get("run_at")?,
            leased_until: row.try_get("leased_until")?,
        })
    }
}

impl From<LeasedRow> for LeasedItem {
    fn from(row: LeasedRow) -> Self {
        LeasedItem {
            id: row.id,
            queue: row.queue,
            job_id: JobId::from_uuid(row.job_id),
            instance_id: InstanceId::from_uuid(row.instance_id),
            args: row.args,
            run_at: row.run_at,
            leased_until: row.leased_until,
        }
    }
}

//! Postgres-backed job queue.
//!
//! Jobs live in `lifecycle_jobs`. Leasing picks the first queued row by
//! `(lane_rank, enqueued_at)` with `FOR UPDATE SKIP LOCKED`, so concurrent
//! workers never block on each other. While leased, `visible_at` holds the
//! lease deadline. A partial unique index on `tenant_id WHERE status = 'leased'`
//! makes "one in-flight job per tenant" a database invariant: a worker that
//! races another onto the same tenant gets a unique violation and simply
//! leases nothing this round.
//!
//! Waiters are woken through `LISTEN/NOTIFY` on [`NOTIFY_CHANNEL`]; the wait
//! timeout doubles as a polling fallback if a notification is lost.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgListener, PgRow};
use sqlx::{PgPool, Row};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use tenantforge_core::{BackupId, TenantId, truncate_message};

use super::queue::{JobQueue, LeasePolicy, QueueError, QueueStats};
use super::types::{Job, JobId, JobPayload, JobStatus, Lane, LeaseToken, LeasedJob};

/// Channel used for job wakeups.
pub const NOTIFY_CHANNEL: &str = "lifecycle_jobs";

const JOB_COLUMNS: &str = r#"
    id, kind, tenant_id, backup_id, lane, status, attempts, visible_at,
    leased_by, last_error, enqueued_at, updated_at, finished_at
"#;

/// Postgres job queue with LISTEN/NOTIFY wakeups.
#[derive(Debug)]
pub struct PostgresJobQueue {
    pool: Arc<PgPool>,
    leases: LeasePolicy,
    worker_name: String,
    notify: Arc<Notify>,
    listener: Option<JoinHandle<()>>,
}

impl PostgresJobQueue {
    /// Create the queue without a listener; waiters fall back to polling.
    pub fn new(pool: PgPool, leases: LeasePolicy, worker_name: impl Into<String>) -> Self {
        Self {
            pool: Arc::new(pool),
            leases,
            worker_name: worker_name.into(),
            notify: Arc::new(Notify::new()),
            listener: None,
        }
    }

    /// Create the queue and start a background `LISTEN` task.
    pub async fn connect(
        pool: PgPool,
        leases: LeasePolicy,
        worker_name: impl Into<String>,
    ) -> Result<Self, QueueError> {
        let mut queue = Self::new(pool, leases, worker_name);

        let mut listener = PgListener::connect_with(&queue.pool)
            .await
            .map_err(|e| map_sqlx_error("listen", e))?;
        listener
            .listen(NOTIFY_CHANNEL)
            .await
            .map_err(|e| map_sqlx_error("listen", e))?;

        let notify = queue.notify.clone();
        queue.listener = Some(tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(_) => notify.notify_waiters(),
                    Err(e) => {
                        // PgListener reconnects on the next recv.
                        warn!(error = %e, "job listener error; retrying");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }));

        info!(channel = NOTIFY_CHANNEL, "job queue listening for wakeups");
        Ok(queue)
    }

    #[instrument(skip(self), fields(worker = %self.worker_name), err)]
    async fn try_lease(&self) -> Result<Option<LeasedJob>, QueueError> {
        let token = LeaseToken::new();

        let result = sqlx::query(&format!(
            r#"
            WITH candidate AS (
                SELECT j.id
                FROM lifecycle_jobs j
                WHERE j.status = 'queued'
                  AND NOT EXISTS (
                      SELECT 1 FROM lifecycle_jobs l
                      WHERE l.tenant_id = j.tenant_id AND l.status = 'leased'
                  )
                ORDER BY j.lane_rank, j.enqueued_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE lifecycle_jobs
            SET status = 'leased',
                attempts = lifecycle_jobs.attempts + 1,
                lease_token = $1,
                leased_by = $2,
                visible_at = now() + make_interval(secs => CASE
                    WHEN lifecycle_jobs.kind IN ('provision', 'delete') THEN $3
                    ELSE $4
                END),
                updated_at = now()
            FROM candidate
            WHERE lifecycle_jobs.id = candidate.id
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(token.0)
        .bind(&self.worker_name)
        .bind(self.leases.provision.as_secs_f64())
        .bind(self.leases.backup.as_secs_f64())
        .fetch_optional(&*self.pool)
        .await;

        match result {
            Ok(Some(row)) => {
                let job = job_from_row(&row)?;
                debug!(job_id = %job.id, kind = %job.kind(), attempt = job.attempts, "job leased");
                Ok(Some(LeasedJob { job, token }))
            }
            Ok(None) => Ok(None),
            // Another worker leased a job for the same tenant concurrently.
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some("23505") => {
                debug!("lease raced on a busy tenant; skipping this round");
                Ok(None)
            }
            Err(e) => Err(map_sqlx_error("lease_next", e)),
        }
    }

    async fn ack(
        &self,
        leased: &LeasedJob,
        status: JobStatus,
        error: Option<String>,
    ) -> Result<(), QueueError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        let result = sqlx::query(
            r#"
            UPDATE lifecycle_jobs
            SET status = $3, last_error = COALESCE($4, last_error), lease_token = NULL,
                finished_at = now(), updated_at = now()
            WHERE id = $1 AND status = 'leased' AND lease_token = $2
            "#,
        )
        .bind(leased.id().0)
        .bind(leased.token.0)
        .bind(status.as_str())
        .bind(error)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("ack", e))?;

        if result.rows_affected() == 0 {
            return Err(QueueError::LeaseLost(leased.id()));
        }

        notify(&mut tx).await?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))
    }
}

impl Drop for PostgresJobQueue {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

async fn notify(tx: &mut sqlx::Transaction<'_, sqlx::Postgres>) -> Result<(), QueueError> {
    sqlx::query("SELECT pg_notify($1, '')")
        .bind(NOTIFY_CHANNEL)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("notify", e))?;
    Ok(())
}

#[async_trait]
impl JobQueue for PostgresJobQueue {
    #[instrument(skip(self), fields(kind = %payload.kind, tenant_id = %payload.tenant_id), err)]
    async fn enqueue(&self, payload: JobPayload, lane: Lane) -> Result<JobId, QueueError> {
        payload.validate().map_err(QueueError::InvalidPayload)?;
        let job = Job::new(payload, lane);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        sqlx::query(
            r#"
            INSERT INTO lifecycle_jobs (
                id, kind, tenant_id, backup_id, lane, lane_rank, status, attempts,
                visible_at, enqueued_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, 'queued', 0, $7, $7, $7)
            "#,
        )
        .bind(job.id.0)
        .bind(job.kind().as_str())
        .bind(job.tenant_id().as_uuid())
        .bind(payload.backup_id.map(|b| *b.as_uuid()))
        .bind(lane.as_str())
        .bind(lane.rank())
        .bind(job.enqueued_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?;

        notify(&mut tx).await?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;

        debug!(job_id = %job.id, lane = %lane, "job enqueued");
        Ok(job.id)
    }

    async fn lease_next(&self, wait: Duration) -> Result<Option<LeasedJob>, QueueError> {
        let deadline = Instant::now() + wait;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(leased) = self.try_lease().await? {
                return Ok(Some(leased));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_lease().await;
            }
        }
    }

    #[instrument(skip(self, leased), fields(job_id = %leased.id()), err)]
    async fn complete(&self, leased: &LeasedJob) -> Result<(), QueueError> {
        self.ack(leased, JobStatus::Completed, None).await
    }

    #[instrument(skip(self, leased, error), fields(job_id = %leased.id()), err)]
    async fn fail(&self, leased: &LeasedJob, error: &str) -> Result<(), QueueError> {
        self.ack(leased, JobStatus::Failed, Some(truncate_message(error)))
            .await
    }

    #[instrument(skip(self), err)]
    async fn reclaim_expired(&self) -> Result<usize, QueueError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        let result = sqlx::query(
            r#"
            UPDATE lifecycle_jobs
            SET status = 'queued', lease_token = NULL, leased_by = NULL,
                last_error = 'lease expired', updated_at = now()
            WHERE status = 'leased' AND visible_at <= now()
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("reclaim_expired", e))?;

        let reclaimed = result.rows_affected() as usize;
        if reclaimed > 0 {
            notify(&mut tx).await?;
        }
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(reclaimed)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM lifecycle_jobs WHERE id = $1"))
            .bind(id.0)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let rows = sqlx::query("SELECT status, count(*) AS n FROM lifecycle_jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = QueueStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(read_error)?;
            let n: i64 = row.try_get("n").map_err(read_error)?;
            let n = n.max(0) as usize;
            match status.parse::<JobStatus>().map_err(QueueError::Storage)? {
                JobStatus::Queued => stats.queued = n,
                JobStatus::Leased => stats.leased = n,
                JobStatus::Completed => stats.completed = n,
                JobStatus::Failed => stats.failed = n,
            }
        }
        Ok(stats)
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, QueueError> {
    let kind: String = row.try_get("kind").map_err(read_error)?;
    let lane: String = row.try_get("lane").map_err(read_error)?;
    let status: String = row.try_get("status").map_err(read_error)?;
    let backup_id: Option<uuid::Uuid> = row.try_get("backup_id").map_err(read_error)?;
    let attempts: i32 = row.try_get("attempts").map_err(read_error)?;
    let visible_at: DateTime<Utc> = row.try_get("visible_at").map_err(read_error)?;

    let status: JobStatus = status.parse().map_err(QueueError::Storage)?;

    Ok(Job {
        id: JobId::from_uuid(row.try_get("id").map_err(read_error)?),
        payload: JobPayload {
            kind: kind.parse().map_err(QueueError::Storage)?,
            tenant_id: TenantId::from_uuid(row.try_get("tenant_id").map_err(read_error)?),
            backup_id: backup_id.map(BackupId::from_uuid),
        },
        lane: lane.parse().map_err(QueueError::Storage)?,
        status,
        attempts: attempts.max(0) as u32,
        enqueued_at: row.try_get("enqueued_at").map_err(read_error)?,
        updated_at: row.try_get("updated_at").map_err(read_error)?,
        lease_expires_at: (status == JobStatus::Leased).then_some(visible_at),
        leased_by: row.try_get("leased_by").map_err(read_error)?,
        last_error: row.try_get("last_error").map_err(read_error)?,
        finished_at: row.try_get("finished_at").map_err(read_error)?,
    })
}

fn read_error(err: sqlx::Error) -> QueueError {
    QueueError::Storage(format!("failed to read column: {err}"))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> QueueError {
    match err {
        sqlx::Error::Database(db_err) => QueueError::Storage(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            QueueError::Storage(format!("connection pool closed in {}", operation))
        }
        other => QueueError::Storage(format!("error in {}: {}", operation, other)),
    }
}

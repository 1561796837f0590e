//! Postgres-backed tenant record store.
//!
//! Each call runs in its own short transaction with a `statement_timeout`
//! applied via `set_config(..., true)` (transaction-local). No transaction is
//! ever held open across a provisioning or dump call; handlers interleave
//! short store calls with long backend calls.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Code | StoreError |
//! |------------|-----------------|------------|
//! | Database (unique violation) | `23505` | `Duplicate` |
//! | Database (foreign key violation) | `23503` | `NotFound` |
//! | Database (check violation) | `23514` | `Conflict` |
//! | Database (query canceled, statement timeout) | `57014` | `Storage` |
//! | anything else | N/A | `Storage` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};

use tenantforge_core::{
    BackupId, BackupRecord, BackupStatus, BackupType, CustomerId, PlanId, TenantCounters,
    TenantId, TenantRecord, TenantState, Transition,
};

use super::{StoreError, TenantRecordStore};

const TENANT_COLUMNS: &str = r#"
    id, slug, name, customer_id, plan_id, state, state_message, db_name,
    current_users, db_size_bytes, filestore_size_bytes,
    created_at, updated_at, suspended_at, last_backup_at
"#;

const BACKUP_COLUMNS: &str = r#"
    id, tenant_id, backup_type, status, file_path, file_size_bytes, checksum,
    started_at, completed_at, error_message, retry_count, created_at
"#;

/// Postgres-backed [`TenantRecordStore`].
#[derive(Debug, Clone)]
pub struct PostgresRecordStore {
    pool: Arc<PgPool>,
    statement_timeout: Duration,
}

impl PostgresRecordStore {
    pub fn new(pool: PgPool, statement_timeout: Duration) -> Self {
        Self {
            pool: Arc::new(pool),
            statement_timeout,
        }
    }

    /// Begin a transaction bounded by the configured statement timeout.
    async fn begin(&self) -> Result<Transaction<'_, Postgres>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        sqlx::query("SELECT set_config('statement_timeout', $1, true)")
            .bind(format!("{}ms", self.statement_timeout.as_millis()))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("set_statement_timeout", e))?;

        Ok(tx)
    }
}

#[async_trait]
impl TenantRecordStore for PostgresRecordStore {
    #[instrument(skip(self, record), fields(tenant_id = %record.id, slug = %record.slug), err)]
    async fn insert_tenant(&self, record: &TenantRecord) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO tenants (
                id, slug, name, customer_id, plan_id, state, state_message, db_name,
                current_users, db_size_bytes, filestore_size_bytes,
                created_at, updated_at, suspended_at, last_backup_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(&record.slug)
        .bind(&record.name)
        .bind(record.customer_id.as_uuid())
        .bind(record.plan_id.map(|p| *p.as_uuid()))
        .bind(record.state.as_str())
        .bind(&record.state_message)
        .bind(&record.db_name)
        .bind(record.counters.current_users as i32)
        .bind(record.counters.db_size_bytes as i64)
        .bind(record.counters.filestore_size_bytes as i64)
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.suspended_at)
        .bind(record.last_backup_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_tenant", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))
    }

    #[instrument(skip(self), fields(tenant_id = %id), err)]
    async fn get_tenant(&self, id: TenantId) -> Result<Option<TenantRecord>, StoreError> {
        let mut tx = self.begin().await?;

        let row = sqlx::query(&format!("SELECT {TENANT_COLUMNS} FROM tenants WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("get_tenant", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;

        row.as_ref().map(tenant_from_row).transpose()
    }

    #[instrument(
        skip(self, message),
        fields(tenant_id = %id, from = %transition.from(), to = %transition.to(), outcome = tracing::field::Empty),
        err
    )]
    async fn compare_and_set_state(
        &self,
        id: TenantId,
        transition: Transition,
        message: Option<String>,
    ) -> Result<TenantRecord, StoreError> {
        let now = Utc::now();
        let suspended_at = (transition.to() == TenantState::Suspended).then_some(now);

        let mut tx = self.begin().await?;

        let updated = sqlx::query(&format!(
            r#"
            UPDATE tenants
            SET state = $3, state_message = $4, updated_at = $5, suspended_at = $6
            WHERE id = $1 AND state = $2
            RETURNING {TENANT_COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(transition.from().as_str())
        .bind(transition.to().as_str())
        .bind(&message)
        .bind(now)
        .bind(suspended_at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("compare_and_set_state", e))?;

        let result = match updated {
            Some(row) => tenant_from_row(&row),
            None => {
                let current = sqlx::query("SELECT state FROM tenants WHERE id = $1")
                    .bind(id.as_uuid())
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(|e| map_sqlx_error("compare_and_set_state", e))?;

                match current {
                    None => Err(StoreError::NotFound(format!("tenant {id}"))),
                    Some(row) => {
                        let found: String = row.try_get("state").map_err(read_error)?;
                        Err(StoreError::StateConflict {
                            expected: transition.from(),
                            found: parse_state(&found)?,
                        })
                    }
                }
            }
        };

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;

        Span::current().record("outcome", if result.is_ok() { "applied" } else { "rejected" });
        result
    }

    #[instrument(skip(self, counters), fields(tenant_id = %id), err)]
    async fn update_counters(&self, id: TenantId, counters: TenantCounters) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE tenants
            SET current_users = $2, db_size_bytes = $3, filestore_size_bytes = $4, updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(counters.current_users as i32)
        .bind(counters.db_size_bytes as i64)
        .bind(counters.filestore_size_bytes as i64)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_counters", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("tenant {id}")));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(tenant_id = %id), err)]
    async fn record_backup_time(&self, id: TenantId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;

        let result = sqlx::query(
            "UPDATE tenants SET last_backup_at = $2, updated_at = $3 WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(at)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("record_backup_time", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("tenant {id}")));
        }
        Ok(())
    }

    #[instrument(skip(self, backup), fields(backup_id = %backup.id, tenant_id = %backup.tenant_id), err)]
    async fn insert_backup(&self, backup: &BackupRecord) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO backups (
                id, tenant_id, backup_type, status, file_path, file_size_bytes, checksum,
                started_at, completed_at, error_message, retry_count, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(backup.id.as_uuid())
        .bind(backup.tenant_id.as_uuid())
        .bind(backup.backup_type.as_str())
        .bind(backup.status.as_str())
        .bind(&backup.file_path)
        .bind(backup.file_size_bytes.map(|s| s as i64))
        .bind(&backup.checksum)
        .bind(backup.started_at)
        .bind(backup.completed_at)
        .bind(&backup.error_message)
        .bind(backup.retry_count as i32)
        .bind(backup.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_backup", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))
    }

    #[instrument(skip(self), fields(backup_id = %id), err)]
    async fn get_backup(&self, id: BackupId) -> Result<Option<BackupRecord>, StoreError> {
        let mut tx = self.begin().await?;

        let row = sqlx::query(&format!("SELECT {BACKUP_COLUMNS} FROM backups WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("get_backup", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;

        row.as_ref().map(backup_from_row).transpose()
    }

    #[instrument(skip(self, backup), fields(backup_id = %backup.id, status = %backup.status), err)]
    async fn update_backup(&self, backup: &BackupRecord) -> Result<(), StoreError> {
        // Statuses the stored row may currently hold for this write to be legal.
        let allowed_from: Vec<String> = [
            BackupStatus::Pending,
            BackupStatus::InProgress,
            BackupStatus::Completed,
            BackupStatus::Failed,
        ]
        .into_iter()
        .filter(|s| *s == backup.status || s.can_advance_to(backup.status))
        .map(|s| s.as_str().to_string())
        .collect();

        let mut tx = self.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE backups
            SET status = $2, file_path = $3, file_size_bytes = $4, checksum = $5,
                started_at = $6, completed_at = $7, error_message = $8, retry_count = $9
            WHERE id = $1 AND status = ANY($10)
            "#,
        )
        .bind(backup.id.as_uuid())
        .bind(backup.status.as_str())
        .bind(&backup.file_path)
        .bind(backup.file_size_bytes.map(|s| s as i64))
        .bind(&backup.checksum)
        .bind(backup.started_at)
        .bind(backup.completed_at)
        .bind(&backup.error_message)
        .bind(backup.retry_count as i32)
        .bind(&allowed_from)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_backup", e))?;

        if result.rows_affected() == 0 {
            let exists = sqlx::query("SELECT status FROM backups WHERE id = $1")
                .bind(backup.id.as_uuid())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("update_backup", e))?;
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit", e))?;

            return match exists {
                None => Err(StoreError::NotFound(format!("backup {}", backup.id))),
                Some(row) => {
                    let stored: String = row.try_get("status").map_err(read_error)?;
                    Err(StoreError::Conflict(format!(
                        "backup {} cannot move from {} to {}",
                        backup.id, stored, backup.status
                    )))
                }
            };
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))
    }
}

fn tenant_from_row(row: &sqlx::postgres::PgRow) -> Result<TenantRecord, StoreError> {
    let state: String = row.try_get("state").map_err(read_error)?;
    let plan_id: Option<uuid::Uuid> = row.try_get("plan_id").map_err(read_error)?;
    let current_users: i32 = row.try_get("current_users").map_err(read_error)?;
    let db_size_bytes: i64 = row.try_get("db_size_bytes").map_err(read_error)?;
    let filestore_size_bytes: i64 = row.try_get("filestore_size_bytes").map_err(read_error)?;

    Ok(TenantRecord {
        id: TenantId::from_uuid(row.try_get("id").map_err(read_error)?),
        slug: row.try_get("slug").map_err(read_error)?,
        name: row.try_get("name").map_err(read_error)?,
        customer_id: CustomerId::from_uuid(row.try_get("customer_id").map_err(read_error)?),
        plan_id: plan_id.map(PlanId::from_uuid),
        state: parse_state(&state)?,
        state_message: row.try_get("state_message").map_err(read_error)?,
        db_name: row.try_get("db_name").map_err(read_error)?,
        counters: TenantCounters {
            current_users: current_users.max(0) as u32,
            db_size_bytes: db_size_bytes.max(0) as u64,
            filestore_size_bytes: filestore_size_bytes.max(0) as u64,
        },
        created_at: row.try_get("created_at").map_err(read_error)?,
        updated_at: row.try_get("updated_at").map_err(read_error)?,
        suspended_at: row.try_get("suspended_at").map_err(read_error)?,
        last_backup_at: row.try_get("last_backup_at").map_err(read_error)?,
    })
}

fn backup_from_row(row: &sqlx::postgres::PgRow) -> Result<BackupRecord, StoreError> {
    let status: String = row.try_get("status").map_err(read_error)?;
    let backup_type: String = row.try_get("backup_type").map_err(read_error)?;
    let size: Option<i64> = row.try_get("file_size_bytes").map_err(read_error)?;
    let retry_count: i32 = row.try_get("retry_count").map_err(read_error)?;

    if backup_type != BackupType::Full.as_str() {
        return Err(StoreError::Storage(format!("unknown backup type: {backup_type}")));
    }

    Ok(BackupRecord {
        id: BackupId::from_uuid(row.try_get("id").map_err(read_error)?),
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id").map_err(read_error)?),
        backup_type: BackupType::Full,
        status: status
            .parse()
            .map_err(|e: tenantforge_core::DomainError| StoreError::Storage(e.to_string()))?,
        file_path: row.try_get("file_path").map_err(read_error)?,
        file_size_bytes: size.map(|s| s.max(0) as u64),
        checksum: row.try_get("checksum").map_err(read_error)?,
        started_at: row.try_get("started_at").map_err(read_error)?,
        completed_at: row.try_get("completed_at").map_err(read_error)?,
        error_message: row.try_get("error_message").map_err(read_error)?,
        retry_count: retry_count.max(0) as u32,
        created_at: row.try_get("created_at").map_err(read_error)?,
    })
}

fn parse_state(raw: &str) -> Result<TenantState, StoreError> {
    raw.parse()
        .map_err(|e: tenantforge_core::DomainError| StoreError::Storage(e.to_string()))
}

fn read_error(err: sqlx::Error) -> StoreError {
    StoreError::Storage(format!("failed to read column: {err}"))
}

/// Map SQLx errors to `StoreError` with operation context.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());

            match db_err.code().as_deref() {
                Some("23505") => StoreError::Duplicate(msg),
                Some("23503") => StoreError::NotFound(msg),
                Some("23514") => StoreError::Conflict(msg),
                Some("57014") => StoreError::Storage(format!("statement timeout in {operation}")),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Storage(format!("connection pool timed out in {}", operation))
        }
        other => StoreError::Storage(format!("error in {}: {}", operation, other)),
    }
}

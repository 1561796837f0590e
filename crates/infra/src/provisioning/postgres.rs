//! Postgres provisioning: `CREATE DATABASE` / `DROP DATABASE` on the
//! maintenance database.
//!
//! DDL like this cannot run inside a transaction, so every call opens a
//! dedicated autocommit connection rather than borrowing from the record-store
//! pool.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{Connection, Executor, Row};
use tracing::{info, instrument, warn};

use super::{
    CreateOutcome, DropOutcome, ProvisionError, ProvisioningBackend, quote_ident,
    validate_database_name,
};

/// Provisions tenant databases on a Postgres server.
#[derive(Debug, Clone)]
pub struct PostgresProvisioner {
    options: PgConnectOptions,
    timeout: Duration,
}

impl PostgresProvisioner {
    /// `options` must point at the maintenance database (usually `postgres`).
    pub fn new(options: PgConnectOptions, timeout: Duration) -> Self {
        Self { options, timeout }
    }

    async fn connect(&self) -> Result<PgConnection, ProvisionError> {
        PgConnection::connect_with(&self.options)
            .await
            .map_err(|e| ProvisionError::Unavailable(e.to_string()))
    }

    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> Result<T, ProvisionError>
    where
        F: Future<Output = Result<T, ProvisionError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ProvisionError::Timeout {
                operation,
                after: self.timeout,
            }),
        }
    }
}

async fn database_exists(conn: &mut PgConnection, name: &str) -> Result<bool, ProvisionError> {
    let row = sqlx::query("SELECT 1 AS present FROM pg_database WHERE datname = $1")
        .bind(name)
        .fetch_optional(&mut *conn)
        .await
        .map_err(map_ddl_error)?;
    Ok(row.is_some())
}

#[async_trait]
impl ProvisioningBackend for PostgresProvisioner {
    #[instrument(skip(self), err)]
    async fn create_database(&self, name: &str) -> Result<CreateOutcome, ProvisionError> {
        validate_database_name(name)?;

        self.bounded("create_database", async {
            let mut conn = self.connect().await?;

            if database_exists(&mut conn, name).await? {
                info!(db_name = name, "database already exists");
                let _ = conn.close().await;
                return Ok(CreateOutcome::AlreadyExists);
            }

            let ddl = format!("CREATE DATABASE {}", quote_ident(name));
            let outcome = match Executor::execute(&mut conn, sqlx::raw_sql(&ddl)).await {
                Ok(_) => CreateOutcome::Created,
                // Lost a race with a concurrent creator.
                Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some("42P04") => {
                    CreateOutcome::AlreadyExists
                }
                Err(e) => return Err(map_ddl_error(e)),
            };

            let _ = conn.close().await;
            info!(db_name = name, outcome = ?outcome, "create_database finished");
            Ok(outcome)
        })
        .await
    }

    #[instrument(skip(self), err)]
    async fn drop_database(&self, name: &str) -> Result<DropOutcome, ProvisionError> {
        validate_database_name(name)?;

        self.bounded("drop_database", async {
            let mut conn = self.connect().await?;

            if !database_exists(&mut conn, name).await? {
                let _ = conn.close().await;
                return Ok(DropOutcome::Absent);
            }

            let terminated = Executor::fetch_one(
                &mut conn,
                sqlx::query(
                    r#"
                SELECT count(pg_terminate_backend(pid)) AS terminated
                FROM pg_stat_activity
                WHERE datname = $1 AND pid <> pg_backend_pid()
                "#,
                )
                .bind(name),
            )
            .await
            .map_err(map_ddl_error)?;

            let terminated: i64 = terminated.try_get("terminated").unwrap_or(0);
            if terminated > 0 {
                warn!(db_name = name, sessions = terminated, "terminated sessions before drop");
            }

            let ddl = format!("DROP DATABASE IF EXISTS {}", quote_ident(name));
            Executor::execute(&mut conn, sqlx::raw_sql(&ddl))
                .await
                .map_err(map_ddl_error)?;

            let _ = conn.close().await;
            info!(db_name = name, "database dropped");
            Ok(DropOutcome::Dropped)
        })
        .await
    }
}

fn map_ddl_error(err: sqlx::Error) -> ProvisionError {
    match err {
        sqlx::Error::Database(db) => ProvisionError::Backend(db.message().to_string()),
        sqlx::Error::Io(e) => ProvisionError::Unavailable(e.to_string()),
        sqlx::Error::Tls(e) => ProvisionError::Unavailable(e.to_string()),
        other @ (sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed) => {
            ProvisionError::Unavailable(other.to_string())
        }
        other => ProvisionError::Backend(other.to_string()),
    }
}

//! Postgres-backed audit sink (`audit_logs` table, append-only).

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::instrument;

use tenantforge_core::{Actor, AuditEntry};

use super::{AuditError, AuditSink};

#[derive(Debug, Clone)]
pub struct PostgresAuditSink {
    pool: Arc<PgPool>,
}

impl PostgresAuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl AuditSink for PostgresAuditSink {
    #[instrument(
        skip(self, entry),
        fields(action = %entry.action, resource_id = %entry.resource_id),
        err
    )]
    async fn append(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        let actor_type = match entry.actor {
            Actor::System => "system",
            Actor::User { .. } => "user",
        };

        sqlx::query(
            r#"
            INSERT INTO audit_logs (
                id, actor_type, user_id, user_email, action, resource_type, resource_id,
                old_values, new_values, metadata, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(entry.id.as_uuid())
        .bind(actor_type)
        .bind(entry.actor.user_id().map(|id| *id.as_uuid()))
        .bind(entry.actor.label())
        .bind(entry.action.as_str())
        .bind(&entry.resource_type)
        .bind(&entry.resource_id)
        .bind(&entry.before)
        .bind(&entry.after)
        .bind(&entry.metadata)
        .bind(entry.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| AuditError::Storage(format!("insert audit_logs: {e}")))?;

        Ok(())
    }
}

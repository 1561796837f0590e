//! Command surface used by the API layer.
//!
//! Everything here is short: validate, write the record change, audit, and
//! enqueue. The long external work (DDL, dumps) happens in job handlers.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{info, instrument};

use tenantforge_core::{
    Actor, AuditAction, AuditEntry, BackupId, BackupRecord, BackupStatus, DomainError, NewTenant,
    TenantId, TenantRecord, TenantState, request_transition, restore_transition,
};

use crate::audit::AuditTrail;
use crate::backup::state_snapshot;
use crate::jobs::{JobId, JobPayload, JobQueue, Lane, QueueError};
use crate::store::{StoreError, TenantRecordStore};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    /// Validation failure or illegal transition.
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not eligible: {0}")]
    NotEligible(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// A backup request that was accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRequest {
    pub backup: BackupRecord,
    pub job_id: JobId,
}

#[derive(Clone)]
pub struct LifecycleService {
    store: Arc<dyn TenantRecordStore>,
    queue: Arc<dyn JobQueue>,
    audit: AuditTrail,
}

impl LifecycleService {
    pub fn new(store: Arc<dyn TenantRecordStore>, queue: Arc<dyn JobQueue>, audit: AuditTrail) -> Self {
        Self { store, queue, audit }
    }

    async fn load(&self, id: TenantId) -> Result<TenantRecord, ServiceError> {
        self.store
            .get_tenant(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("tenant {id}")))
    }

    /// Enqueue on an explicit lane.
    pub async fn enqueue_on(&self, payload: JobPayload, lane: Lane) -> Result<JobId, ServiceError> {
        Ok(self.queue.enqueue(payload, lane).await?)
    }

    /// Insert a CREATING tenant and queue its provisioning.
    #[instrument(skip(self, new, actor), fields(slug = %new.slug), err)]
    pub async fn register_tenant(
        &self,
        new: NewTenant,
        actor: Actor,
    ) -> Result<(TenantRecord, JobId), ServiceError> {
        let record = TenantRecord::creating(new, Utc::now())?;
        self.store.insert_tenant(&record).await?;

        self.audit
            .record_entry(
                AuditEntry::for_tenant(
                    actor,
                    AuditAction::Create,
                    record.id,
                    None,
                    Some(json!({
                        "slug": record.slug,
                        "name": record.name,
                        "db_name": record.db_name,
                        "state": record.state,
                    })),
                ),
            )
            .await;

        let job_id = self
            .enqueue_on(JobPayload::provision(record.id), Lane::Default)
            .await?;
        info!(tenant_id = %record.id, db_name = %record.db_name, %job_id, "tenant registered");
        Ok((record, job_id))
    }

    /// Queue a delete. `None` when the tenant is already deleted.
    #[instrument(skip(self, actor), err)]
    pub async fn request_delete(
        &self,
        tenant_id: TenantId,
        actor: Actor,
    ) -> Result<Option<JobId>, ServiceError> {
        let tenant = self.load(tenant_id).await?;

        match tenant.state {
            TenantState::Deleted => {
                self.audit
                    .record_noop(actor, tenant.id, "delete", "already deleted")
                    .await;
                return Ok(None);
            }
            // Stuck delete; the handler resumes it.
            TenantState::Deleting => {}
            state => {
                request_transition(state, TenantState::Deleting)?;
            }
        }

        let job_id = self
            .enqueue_on(JobPayload::delete(tenant.id), Lane::Default)
            .await?;
        Ok(Some(job_id))
    }

    #[instrument(skip(self, actor), err)]
    pub async fn suspend(&self, tenant_id: TenantId, actor: Actor) -> Result<TenantRecord, ServiceError> {
        self.apply(tenant_id, TenantState::Suspended, AuditAction::Suspend, actor)
            .await
    }

    #[instrument(skip(self, actor), err)]
    pub async fn resume(&self, tenant_id: TenantId, actor: Actor) -> Result<TenantRecord, ServiceError> {
        self.apply(tenant_id, TenantState::Active, AuditAction::Resume, actor)
            .await
    }

    async fn apply(
        &self,
        tenant_id: TenantId,
        target: TenantState,
        action: AuditAction,
        actor: Actor,
    ) -> Result<TenantRecord, ServiceError> {
        let before = self.load(tenant_id).await?;
        if before.state == TenantState::Deleted {
            self.audit
                .record_noop(actor, before.id, action.as_str(), "tenant deleted")
                .await;
            return Ok(before);
        }
        let transition = request_transition(before.state, target)?;
        let after = self
            .store
            .compare_and_set_state(tenant_id, transition, None)
            .await?;

        self.audit
            .record_entry(AuditEntry::for_tenant(
                actor,
                action,
                tenant_id,
                Some(state_snapshot(before.state, before.state_message.as_deref())),
                Some(json!({ "state": after.state, "suspended_at": after.suspended_at })),
            ))
            .await;

        Ok(after)
    }

    /// Record a PENDING backup of an ACTIVE tenant and queue it. `None` when
    /// the tenant is deleted.
    #[instrument(skip(self, actor), err)]
    pub async fn request_backup(
        &self,
        tenant_id: TenantId,
        actor: Actor,
    ) -> Result<Option<BackupRequest>, ServiceError> {
        let tenant = self.load(tenant_id).await?;
        if tenant.state == TenantState::Deleted {
            self.audit
                .record_noop(actor, tenant.id, "backup", "tenant deleted")
                .await;
            return Ok(None);
        }
        if !tenant.is_active() {
            return Err(ServiceError::NotEligible(format!(
                "tenant {} is {}, backups require active",
                tenant.id, tenant.state
            )));
        }

        let backup = BackupRecord::pending(tenant.id, Utc::now());
        self.store.insert_backup(&backup).await?;

        let job_id = self
            .enqueue_on(JobPayload::backup(tenant.id, backup.id), Lane::Low)
            .await?;
        info!(backup_id = %backup.id, requested_by = actor.label(), %job_id, "backup requested");
        Ok(Some(BackupRequest { backup, job_id }))
    }

    /// Queue a restore of a completed backup owned by the tenant. `None` when
    /// the tenant is deleted.
    #[instrument(skip(self, actor), err)]
    pub async fn request_restore(
        &self,
        tenant_id: TenantId,
        backup_id: BackupId,
        actor: Actor,
    ) -> Result<Option<JobId>, ServiceError> {
        let tenant = self.load(tenant_id).await?;
        if tenant.state == TenantState::Deleted {
            self.audit
                .record_noop(actor, tenant.id, "restore", "tenant deleted")
                .await;
            return Ok(None);
        }
        let backup = self
            .store
            .get_backup(backup_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("backup {backup_id}")))?;

        if backup.tenant_id != tenant.id {
            return Err(ServiceError::NotEligible(format!(
                "backup {backup_id} does not belong to tenant {tenant_id}"
            )));
        }
        if backup.status != BackupStatus::Completed {
            return Err(ServiceError::NotEligible(format!(
                "backup {backup_id} is {}, restore requires completed",
                backup.status
            )));
        }
        restore_transition(tenant.state)?;

        let job_id = self
            .enqueue_on(JobPayload::restore(tenant.id, backup_id), Lane::High)
            .await?;
        info!(requested_by = actor.label(), %job_id, "restore requested");
        Ok(Some(job_id))
    }
}

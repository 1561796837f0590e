//! Lifecycle job handlers.
//!
//! Each handler catches every failure locally, records what it has to on the
//! tenant (state, truncated message, audit entry) and hands a [`JobReport`]
//! back to the worker. Nothing here retries; only lease expiry redelivers.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{error, info, instrument, warn};

use tenantforge_core::{
    Actor, AuditAction, AuditEntry, BackupId, TenantCounters, TenantId, TenantRecord,
    TenantState, request_transition, truncate_message,
};

use crate::audit::AuditTrail;
use crate::backup::{BackupEngine, BackupOutcome, RestoreOutcome, state_snapshot};
use crate::provisioning::{CreateOutcome, DropOutcome, ProvisioningBackend};
use crate::store::TenantRecordStore;

use super::error::LifecycleError;
use super::types::{JobId, JobKind, LeasedJob};

/// How a job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded(String),
    /// Nothing to do (already in the requested state).
    Noop(String),
    Failed(LifecycleError),
    /// The handler panicked; caught at the worker boundary.
    Panicked(String),
}

/// Structured result handed back to the worker pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub job_id: JobId,
    pub kind: JobKind,
    pub tenant_id: TenantId,
    pub attempt: u32,
    pub outcome: JobOutcome,
}

impl JobReport {
    pub fn new(job: &LeasedJob, outcome: JobOutcome) -> Self {
        Self {
            job_id: job.id(),
            kind: job.payload().kind,
            tenant_id: job.payload().tenant_id,
            attempt: job.attempt(),
            outcome,
        }
    }

    /// Succeeded or no-op.
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, JobOutcome::Succeeded(_) | JobOutcome::Noop(_))
    }

    /// Message stored on the job when it failed.
    pub fn failure_message(&self) -> Option<String> {
        match &self.outcome {
            JobOutcome::Failed(err) => Some(format!("{}: {err}", err.kind())),
            JobOutcome::Panicked(msg) => Some(format!("panic: {msg}")),
            _ => None,
        }
    }
}

/// Runs a leased job to completion.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &LeasedJob) -> JobReport;
}

#[async_trait]
impl<H> JobHandler for Arc<H>
where
    H: JobHandler + ?Sized,
{
    async fn handle(&self, job: &LeasedJob) -> JobReport {
        (**self).handle(job).await
    }
}

/// The four lifecycle actions, dispatched on [`JobKind`].
#[derive(Clone)]
pub struct LifecycleHandlers {
    store: Arc<dyn TenantRecordStore>,
    provisioner: Arc<dyn ProvisioningBackend>,
    backups: BackupEngine,
    audit: AuditTrail,
}

impl LifecycleHandlers {
    pub fn new(
        store: Arc<dyn TenantRecordStore>,
        provisioner: Arc<dyn ProvisioningBackend>,
        backups: BackupEngine,
        audit: AuditTrail,
    ) -> Self {
        Self {
            store,
            provisioner,
            backups,
            audit,
        }
    }

    async fn load_tenant(&self, id: TenantId) -> Result<TenantRecord, LifecycleError> {
        self.store
            .get_tenant(id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(format!("tenant {id}")))
    }

    fn backup_id(job: &LeasedJob) -> Result<BackupId, LifecycleError> {
        job.payload()
            .backup_id
            .ok_or_else(|| LifecycleError::NotEligible("job payload has no backup_id".to_string()))
    }

    async fn dispatch(&self, job: &LeasedJob) -> Result<JobOutcome, LifecycleError> {
        let tenant_id = job.payload().tenant_id;
        match job.payload().kind {
            JobKind::Provision => {
                let result = self.provision(job).await;
                self.route_failure(tenant_id, result).await
            }
            JobKind::Delete => {
                let result = self.delete(tenant_id).await;
                self.route_failure(tenant_id, result).await
            }
            // The engine settles tenant state itself.
            JobKind::Backup => {
                let backup_id = Self::backup_id(job)?;
                match self.backups.backup(tenant_id, backup_id, Actor::System).await? {
                    BackupOutcome::Completed(record) => Ok(JobOutcome::Succeeded(format!(
                        "backup {} completed ({} bytes)",
                        record.id,
                        record.file_size_bytes.unwrap_or_default()
                    ))),
                    BackupOutcome::AlreadyFinished(record) => Ok(JobOutcome::Noop(format!(
                        "backup {} already {}",
                        record.id, record.status
                    ))),
                    BackupOutcome::TenantDeleted(record) => Ok(JobOutcome::Noop(format!(
                        "tenant deleted; backup {} skipped",
                        record.id
                    ))),
                }
            }
            JobKind::Restore => {
                let backup_id = Self::backup_id(job)?;
                match self.backups.restore(tenant_id, backup_id, Actor::System).await? {
                    RestoreOutcome::Restored(_) => {
                        Ok(JobOutcome::Succeeded(format!("restored from backup {backup_id}")))
                    }
                    RestoreOutcome::TenantDeleted(_) => {
                        Ok(JobOutcome::Noop("tenant deleted; restore skipped".to_string()))
                    }
                }
            }
        }
    }

    /// Move the tenant to ERROR when the failure calls for it.
    async fn route_failure(
        &self,
        tenant_id: TenantId,
        result: Result<JobOutcome, LifecycleError>,
    ) -> Result<JobOutcome, LifecycleError> {
        match result {
            Err(err) if err.routes_to_error() => {
                self.mark_error(tenant_id, &err).await;
                Err(err)
            }
            other => other,
        }
    }

    /// CREATING -> ACTIVE once the tenant database exists.
    async fn provision(&self, job: &LeasedJob) -> Result<JobOutcome, LifecycleError> {
        let tenant = self.load_tenant(job.payload().tenant_id).await?;

        match tenant.state {
            TenantState::Active => return Ok(JobOutcome::Noop("tenant already active".to_string())),
            TenantState::Deleted => {
                self.audit
                    .record_noop(Actor::System, tenant.id, "provision", "tenant deleted")
                    .await;
                return Ok(JobOutcome::Noop("tenant deleted".to_string()));
            }
            TenantState::Creating => {}
            other => {
                return Err(LifecycleError::InvalidTransition {
                    from: other,
                    to: TenantState::Active,
                });
            }
        }

        match self.provisioner.create_database(&tenant.db_name).await? {
            CreateOutcome::Created => {}
            // A redelivered job finds the database its first attempt created.
            CreateOutcome::AlreadyExists if job.is_redelivery() => {
                info!(db_name = %tenant.db_name, attempt = job.attempt(), "database already exists; resuming provision");
            }
            CreateOutcome::AlreadyExists => {
                return Err(LifecycleError::ResourceConflict(format!(
                    "database {} already exists",
                    tenant.db_name
                )));
            }
        }

        let after = self
            .store
            .compare_and_set_state(
                tenant.id,
                request_transition(TenantState::Creating, TenantState::Active)?,
                None,
            )
            .await?;

        self.audit
            .record_entry(
                AuditEntry::for_tenant(
                    Actor::System,
                    AuditAction::Update,
                    tenant.id,
                    Some(state_snapshot(tenant.state, None)),
                    Some(state_snapshot(after.state, None)),
                )
                .with_metadata(json!({ "db_name": tenant.db_name, "job": "provision" })),
            )
            .await;

        Ok(JobOutcome::Succeeded(format!("database {} provisioned", tenant.db_name)))
    }

    /// {ACTIVE, SUSPENDED} -> DELETING -> DELETED, dropping the database in between.
    async fn delete(&self, tenant_id: TenantId) -> Result<JobOutcome, LifecycleError> {
        let tenant = self.load_tenant(tenant_id).await?;
        let original = tenant.state;

        let claimed = match tenant.state {
            TenantState::Deleted => {
                self.audit
                    .record_noop(Actor::System, tenant.id, "delete", "already deleted")
                    .await;
                return Ok(JobOutcome::Noop("tenant already deleted".to_string()));
            }
            TenantState::Active | TenantState::Suspended => {
                self.store
                    .compare_and_set_state(
                        tenant.id,
                        request_transition(tenant.state, TenantState::Deleting)?,
                        None,
                    )
                    .await?
            }
            // A previous attempt claimed the tenant and then died.
            TenantState::Deleting => tenant,
            other => {
                return Err(LifecycleError::InvalidTransition {
                    from: other,
                    to: TenantState::Deleting,
                });
            }
        };

        let dropped = self.provisioner.drop_database(&claimed.db_name).await?;

        let after = self.finish_delete(claimed.id).await.map_err(|e| {
            LifecycleError::PartialFailure(format!(
                "database {} dropped but tenant record not finalized: {e}",
                claimed.db_name
            ))
        })?;

        self.audit
            .record_entry(
                AuditEntry::for_tenant(
                    Actor::System,
                    AuditAction::Delete,
                    claimed.id,
                    Some(state_snapshot(original, claimed.state_message.as_deref())),
                    Some(state_snapshot(after.state, None)),
                )
                .with_metadata(json!({
                    "db_name": claimed.db_name,
                    "database_existed": dropped == DropOutcome::Dropped,
                })),
            )
            .await;

        Ok(JobOutcome::Succeeded(format!("tenant {} deleted", claimed.id)))
    }

    /// Reset counters and settle DELETING -> DELETED.
    async fn finish_delete(&self, tenant_id: TenantId) -> Result<TenantRecord, LifecycleError> {
        self.store
            .update_counters(tenant_id, TenantCounters::default())
            .await?;
        let after = self
            .store
            .compare_and_set_state(
                tenant_id,
                request_transition(TenantState::Deleting, TenantState::Deleted)?,
                None,
            )
            .await?;
        Ok(after)
    }

    /// Move the tenant to ERROR with the failure as its message.
    async fn mark_error(&self, tenant_id: TenantId, err: &LifecycleError) {
        let tenant = match self.store.get_tenant(tenant_id).await {
            Ok(Some(tenant)) => tenant,
            Ok(None) => return,
            Err(e) => {
                error!(%tenant_id, error = %e, "cannot load tenant to record error state");
                return;
            }
        };
        let transition = match request_transition(tenant.state, TenantState::Error) {
            Ok(t) => t,
            Err(e) => {
                warn!(%tenant_id, state = %tenant.state, error = %e, "cannot move tenant to error");
                return;
            }
        };

        let message = truncate_message(&err.to_string());
        match self
            .store
            .compare_and_set_state(tenant.id, transition, Some(message.clone()))
            .await
        {
            Ok(after) => {
                self.audit
                    .record_entry(
                        AuditEntry::for_tenant(
                            Actor::System,
                            AuditAction::Update,
                            tenant.id,
                            Some(state_snapshot(tenant.state, tenant.state_message.as_deref())),
                            Some(state_snapshot(after.state, Some(&message))),
                        )
                        .with_metadata(json!({ "error_kind": err.kind(), "at": Utc::now() })),
                    )
                    .await;
            }
            Err(e) => {
                error!(%tenant_id, error = %e, "failed to record tenant error state");
            }
        }
    }
}

#[async_trait]
impl JobHandler for LifecycleHandlers {
    #[instrument(skip(self, job), fields(job_id = %job.id(), kind = %job.payload().kind, tenant_id = %job.payload().tenant_id, attempt = job.attempt()))]
    async fn handle(&self, job: &LeasedJob) -> JobReport {
        let outcome = match self.dispatch(job).await {
            Ok(outcome) => {
                info!(outcome = ?outcome, "job finished");
                outcome
            }
            Err(err) => {
                warn!(error = %err, error_kind = err.kind(), "job failed");
                JobOutcome::Failed(err)
            }
        };
        JobReport::new(job, outcome)
    }
}

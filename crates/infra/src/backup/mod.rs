//! Backup engine: dump a tenant database to an archive and restore it back.
//!
//! Backups never change tenant state. Restores do: a restore drops and
//! recreates the tenant database, so once the drop has been attempted any
//! failure leaves the tenant in `ERROR` for an operator to look at. Both are
//! no-ops on a deleted tenant.

pub mod dump;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::{debug, error, info, instrument, warn};

use tenantforge_core::{
    Actor, AuditAction, AuditEntry, BackupId, BackupRecord, BackupStatus, DomainResult, TenantId,
    TenantRecord, TenantState, Transition, restore_failure, restore_transition, truncate_message,
};

use crate::audit::AuditTrail;
use crate::jobs::LifecycleError;
use crate::provisioning::ProvisioningBackend;
use crate::store::{StoreError, TenantRecordStore};

pub use dump::{DumpError, DumpTool, InMemoryDumpTool, PgDumpTool};

/// Times the final restore CAS is retried after the state moved underneath it.
const SETTLE_ATTEMPTS: usize = 3;

/// What a backup job ended up doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupOutcome {
    Completed(BackupRecord),
    /// The record was already terminal (redelivered job); nothing was redone.
    AlreadyFinished(BackupRecord),
    /// The tenant is deleted; the record is left as it was.
    TenantDeleted(BackupRecord),
}

/// What a restore job ended up doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    Restored(TenantRecord),
    TenantDeleted(TenantRecord),
}

#[derive(Clone)]
pub struct BackupEngine {
    store: Arc<dyn TenantRecordStore>,
    provisioner: Arc<dyn ProvisioningBackend>,
    dump: Arc<dyn DumpTool>,
    audit: AuditTrail,
    backup_dir: PathBuf,
    dump_timeout: Duration,
}

impl std::fmt::Debug for BackupEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupEngine")
            .field("backup_dir", &self.backup_dir)
            .field("dump_timeout", &self.dump_timeout)
            .finish_non_exhaustive()
    }
}

impl BackupEngine {
    pub fn new(
        store: Arc<dyn TenantRecordStore>,
        provisioner: Arc<dyn ProvisioningBackend>,
        dump: Arc<dyn DumpTool>,
        audit: AuditTrail,
        backup_dir: impl Into<PathBuf>,
        dump_timeout: Duration,
    ) -> Self {
        Self {
            store,
            provisioner,
            dump,
            audit,
            backup_dir: backup_dir.into(),
            dump_timeout,
        }
    }

    /// `{backup_dir}/{db_name}_{YYYYmmdd_HHMMSS}.dump`
    pub fn archive_path(&self, db_name: &str, at: DateTime<Utc>) -> PathBuf {
        self.backup_dir
            .join(format!("{}_{}.dump", db_name, at.format("%Y%m%d_%H%M%S")))
    }

    async fn load_backup(&self, tenant_id: TenantId, backup_id: BackupId) -> Result<BackupRecord, LifecycleError> {
        let backup = self
            .store
            .get_backup(backup_id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(format!("backup {backup_id}")))?;

        if backup.tenant_id != tenant_id {
            return Err(LifecycleError::NotEligible(format!(
                "backup {backup_id} does not belong to tenant {tenant_id}"
            )));
        }
        Ok(backup)
    }

    async fn load_tenant(&self, tenant_id: TenantId) -> Result<TenantRecord, LifecycleError> {
        self.store
            .get_tenant(tenant_id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(format!("tenant {tenant_id}")))
    }

    /// Record a failed backup. Never touches the tenant.
    async fn fail_backup(&self, backup: &mut BackupRecord, message: &str) {
        if backup.status.is_terminal() {
            return;
        }
        if let Err(e) = backup.mark_failed(message, Utc::now()) {
            warn!(backup_id = %backup.id, error = %e, "could not mark backup failed");
            return;
        }
        if let Err(e) = self.store.update_backup(backup).await {
            error!(backup_id = %backup.id, error = %e, "failed to persist backup failure");
        }
    }

    /// Dump an ACTIVE tenant's database to a new archive.
    #[instrument(skip(self, actor), fields(tenant_id = %tenant_id, backup_id = %backup_id))]
    pub async fn backup(
        &self,
        tenant_id: TenantId,
        backup_id: BackupId,
        actor: Actor,
    ) -> Result<BackupOutcome, LifecycleError> {
        let mut backup = self.load_backup(tenant_id, backup_id).await?;

        if backup.status.is_terminal() {
            info!(status = %backup.status, "backup already finished; nothing to do");
            return Ok(BackupOutcome::AlreadyFinished(backup));
        }

        let tenant = self.load_tenant(tenant_id).await?;
        if tenant.state == TenantState::Deleted {
            info!("tenant deleted; backup skipped");
            self.audit
                .record_noop(actor, tenant.id, "backup", "tenant deleted")
                .await;
            return Ok(BackupOutcome::TenantDeleted(backup));
        }
        if !tenant.is_active() {
            self.fail_backup(&mut backup, "tenant not active").await;
            return Err(LifecycleError::NotEligible(format!(
                "tenant {} is {}, backups require active",
                tenant.id, tenant.state
            )));
        }

        match backup.status {
            BackupStatus::Pending => {
                backup.mark_in_progress(Utc::now())?;
                self.store.update_backup(&backup).await?;
            }
            // Redelivered after a crash mid-dump; start the dump again.
            _ => {
                backup.retry_count += 1;
                self.store.update_backup(&backup).await?;
            }
        }

        match self.write_archive(&tenant).await {
            Ok((path, size, checksum)) => {
                let now = Utc::now();
                backup.mark_completed(path.display().to_string(), size, checksum.clone(), now)?;
                self.store.update_backup(&backup).await?;
                self.store.record_backup_time(tenant.id, now).await?;

                self.audit
                    .record_entry(
                        AuditEntry::for_tenant(actor, AuditAction::Backup, tenant.id, None, None)
                            .with_metadata(json!({
                                "backup_id": backup.id,
                                "file_path": path.display().to_string(),
                                "file_size_bytes": size,
                                "checksum": checksum,
                            })),
                    )
                    .await;

                info!(size, path = %path.display(), "backup completed");
                Ok(BackupOutcome::Completed(backup))
            }
            Err(err) => {
                error!(error = %err, "backup failed");
                self.fail_backup(&mut backup, &err.to_string()).await;
                Err(err)
            }
        }
    }

    /// Run the dump into a partial file, then rename into place.
    async fn write_archive(&self, tenant: &TenantRecord) -> Result<(PathBuf, u64, String), LifecycleError> {
        tokio::fs::create_dir_all(&self.backup_dir).await.map_err(|e| {
            LifecycleError::BackendUnavailable(format!(
                "cannot create backup dir {}: {e}",
                self.backup_dir.display()
            ))
        })?;

        let mut path = self.archive_path(&tenant.db_name, Utc::now());
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            // Two backups within one second; never overwrite an archive.
            path = path.with_extension(format!("{}.dump", BackupId::new()));
        }
        let partial = path.with_extension("dump.partial");

        let dumped = tokio::time::timeout(self.dump_timeout, self.dump.dump(&tenant.db_name, &partial)).await;
        let result = match dumped {
            Err(_) => Err(LifecycleError::BackendUnavailable(format!(
                "dump timed out after {:?}",
                self.dump_timeout
            ))),
            Ok(Err(e)) => Err(LifecycleError::BackendUnavailable(e.to_string())),
            Ok(Ok(())) => Ok(()),
        };
        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }

        tokio::fs::rename(&partial, &path)
            .await
            .map_err(|e| LifecycleError::BackendUnavailable(format!("finalize archive: {e}")))?;

        let (size, checksum) = checksum_file(&path)
            .await
            .map_err(|e| LifecycleError::BackendUnavailable(format!("read archive: {e}")))?;
        if size == 0 {
            return Err(LifecycleError::BackendUnavailable("dump produced an empty archive".to_string()));
        }

        Ok((path, size, checksum))
    }

    /// Replace a tenant's database with the contents of a completed backup.
    #[instrument(skip(self, actor), fields(tenant_id = %tenant_id, backup_id = %backup_id))]
    pub async fn restore(
        &self,
        tenant_id: TenantId,
        backup_id: BackupId,
        actor: Actor,
    ) -> Result<RestoreOutcome, LifecycleError> {
        let tenant = self.load_tenant(tenant_id).await?;
        if tenant.state == TenantState::Deleted {
            info!("tenant deleted; restore skipped");
            self.audit
                .record_noop(actor, tenant.id, "restore", "tenant deleted")
                .await;
            return Ok(RestoreOutcome::TenantDeleted(tenant));
        }

        // Validation: no side effects past this block.
        let backup = self.load_backup(tenant_id, backup_id).await?;
        if backup.status != BackupStatus::Completed {
            return Err(LifecycleError::NotEligible(format!(
                "backup {backup_id} is {}, restore requires completed",
                backup.status
            )));
        }
        let archive = backup
            .file_path
            .as_deref()
            .map(PathBuf::from)
            .ok_or_else(|| LifecycleError::NotEligible(format!("backup {backup_id} has no archive")))?;
        if !tokio::fs::try_exists(&archive).await.unwrap_or(false) {
            return Err(LifecycleError::NotEligible(format!(
                "archive {} is missing",
                archive.display()
            )));
        }
        restore_transition(tenant.state)?;
        restore_failure(tenant.state)?;

        // A timed-out drop can still finish on the server, so any drop error
        // means the database may be gone.
        if let Err(e) = self.provisioner.drop_database(&tenant.db_name).await {
            let err = LifecycleError::BackendUnavailable(format!(
                "drop of database {} not confirmed: {e}",
                tenant.db_name
            ));
            return Err(self.restore_failed(&tenant, backup_id, actor, err).await);
        }

        if let Err(err) = self.recreate_from(&tenant.db_name, &archive).await {
            let err = LifecycleError::PartialFailure(format!(
                "database {} dropped but not restored: {err}",
                tenant.db_name
            ));
            return Err(self.restore_failed(&tenant, backup_id, actor, err).await);
        }

        let after = self.settle(tenant.id, restore_transition, None).await?;

        self.audit
            .record_entry(
                AuditEntry::for_tenant(
                    actor,
                    AuditAction::Restore,
                    tenant.id,
                    Some(state_snapshot(tenant.state, tenant.state_message.as_deref())),
                    Some(state_snapshot(after.state, None)),
                )
                .with_metadata(json!({ "backup_id": backup_id, "result": "restored" })),
            )
            .await;

        info!(db_name = %tenant.db_name, "restore completed");
        Ok(RestoreOutcome::Restored(after))
    }

    /// Move the tenant to `ERROR` after a restore that may have lost its database.
    async fn restore_failed(
        &self,
        tenant: &TenantRecord,
        backup_id: BackupId,
        actor: Actor,
        err: LifecycleError,
    ) -> LifecycleError {
        error!(error = %err, "restore failed");

        let message = truncate_message(&err.to_string());
        match self.settle(tenant.id, restore_failure, Some(message)).await {
            Ok(after) => {
                self.audit
                    .record_entry(
                        AuditEntry::for_tenant(
                            actor,
                            AuditAction::Restore,
                            tenant.id,
                            Some(state_snapshot(tenant.state, tenant.state_message.as_deref())),
                            Some(state_snapshot(after.state, after.state_message.as_deref())),
                        )
                        .with_metadata(json!({ "backup_id": backup_id, "result": "failed" })),
                    )
                    .await;
            }
            Err(e) => error!(error = %e, "failed to record restore failure on tenant"),
        }
        err
    }

    /// CAS the tenant along `edge` from whatever state it holds now.
    ///
    /// Suspend and resume write the record outside the job queue, so the state
    /// read before the drop can be stale by the time the restore finishes.
    async fn settle(
        &self,
        tenant_id: TenantId,
        edge: fn(TenantState) -> DomainResult<Transition>,
        message: Option<String>,
    ) -> Result<TenantRecord, LifecycleError> {
        let mut attempt = 1;
        loop {
            let current = self.load_tenant(tenant_id).await?;
            let transition = edge(current.state)?;
            match self
                .store
                .compare_and_set_state(tenant_id, transition, message.clone())
                .await
            {
                Ok(after) => return Ok(after),
                Err(StoreError::StateConflict { expected, found }) if attempt < SETTLE_ATTEMPTS => {
                    debug!(%expected, %found, attempt, "tenant state moved during restore; retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn recreate_from(&self, db_name: &str, archive: &Path) -> Result<(), String> {
        self.provisioner
            .create_database(db_name)
            .await
            .map_err(|e| e.to_string())?;

        match tokio::time::timeout(self.dump_timeout, self.dump.restore(db_name, archive)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("restore timed out after {:?}", self.dump_timeout)),
        }
    }
}

/// `{"state": ..., "state_message": ...}` for audit before/after values.
pub(crate) fn state_snapshot(state: TenantState, message: Option<&str>) -> serde_json::Value {
    json!({ "state": state, "state_message": message })
}

/// Size in bytes and hex SHA-256 of a file, streamed.
pub async fn checksum_file(path: &Path) -> std::io::Result<(u64, String)> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut size = 0u64;

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }

    Ok((size, hex::encode(hasher.finalize())))
}

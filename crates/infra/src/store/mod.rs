//! Tenant record store: durable storage of tenant and backup records.
//!
//! Every lifecycle state change goes through [`TenantRecordStore::compare_and_set_state`],
//! an optimistic compare-and-set on the stored `state`. Two workers racing on the
//! same tenant therefore can never both apply a transition from the same source
//! state; the loser sees [`StoreError::StateConflict`].

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use tenantforge_core::{
    BackupId, BackupRecord, TenantCounters, TenantId, TenantRecord, TenantState, Transition,
};

pub use in_memory::InMemoryRecordStore;
pub use postgres::PostgresRecordStore;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    /// The stored state moved on between read and write.
    #[error("state conflict: expected {expected}, found {found}")]
    StateConflict {
        expected: TenantState,
        found: TenantState,
    },

    /// Unique constraint (slug, db_name, id) violated.
    #[error("duplicate: {0}")]
    Duplicate(String),

    /// Backup status would regress.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Storage contract consumed by the orchestrator.
#[async_trait]
pub trait TenantRecordStore: Send + Sync {
    async fn insert_tenant(&self, record: &TenantRecord) -> Result<(), StoreError>;

    async fn get_tenant(&self, id: TenantId) -> Result<Option<TenantRecord>, StoreError>;

    /// Atomically apply `transition` iff the stored state equals `transition.from()`.
    ///
    /// Returns the updated record. `suspended_at` and `updated_at` are maintained
    /// the same way [`Transition::apply`] maintains them.
    async fn compare_and_set_state(
        &self,
        id: TenantId,
        transition: Transition,
        message: Option<String>,
    ) -> Result<TenantRecord, StoreError>;

    async fn update_counters(&self, id: TenantId, counters: TenantCounters) -> Result<(), StoreError>;

    async fn record_backup_time(&self, id: TenantId, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn insert_backup(&self, backup: &BackupRecord) -> Result<(), StoreError>;

    async fn get_backup(&self, id: BackupId) -> Result<Option<BackupRecord>, StoreError>;

    /// Overwrite a backup record. Rejected with `Conflict` if the stored status
    /// could not advance to `backup.status`.
    async fn update_backup(&self, backup: &BackupRecord) -> Result<(), StoreError>;
}

#[async_trait]
impl<S> TenantRecordStore for Arc<S>
where
    S: TenantRecordStore + ?Sized,
{
    async fn insert_tenant(&self, record: &TenantRecord) -> Result<(), StoreError> {
        (**self).insert_tenant(record).await
    }

    async fn get_tenant(&self, id: TenantId) -> Result<Option<TenantRecord>, StoreError> {
        (**self).get_tenant(id).await
    }

    async fn compare_and_set_state(
        &self,
        id: TenantId,
        transition: Transition,
        message: Option<String>,
    ) -> Result<TenantRecord, StoreError> {
        (**self).compare_and_set_state(id, transition, message).await
    }

    async fn update_counters(&self, id: TenantId, counters: TenantCounters) -> Result<(), StoreError> {
        (**self).update_counters(id, counters).await
    }

    async fn record_backup_time(&self, id: TenantId, at: DateTime<Utc>) -> Result<(), StoreError> {
        (**self).record_backup_time(id, at).await
    }

    async fn insert_backup(&self, backup: &BackupRecord) -> Result<(), StoreError> {
        (**self).insert_backup(backup).await
    }

    async fn get_backup(&self, id: BackupId) -> Result<Option<BackupRecord>, StoreError> {
        (**self).get_backup(id).await
    }

    async fn update_backup(&self, backup: &BackupRecord) -> Result<(), StoreError> {
        (**self).update_backup(backup).await
    }
}

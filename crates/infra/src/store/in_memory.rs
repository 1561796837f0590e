use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use tenantforge_core::{
    BackupId, BackupRecord, TenantCounters, TenantId, TenantRecord, Transition,
};

use super::{StoreError, TenantRecordStore};

#[derive(Debug, Default)]
struct Tables {
    tenants: HashMap<TenantId, TenantRecord>,
    backups: HashMap<BackupId, BackupRecord>,
}

/// In-memory record store for tests/dev.
///
/// A single lock covers both tables, so each call is atomic the same way a
/// Postgres transaction would be.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    inner: RwLock<Tables>,
    counter_failures: Mutex<VecDeque<StoreError>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `update_counters` call fail with `err`.
    pub fn fail_next_counter_update(&self, err: StoreError) {
        if let Ok(mut failures) = self.counter_failures.lock() {
            failures.push_back(err);
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>, StoreError> {
        self.inner
            .read()
            .map_err(|_| StoreError::Storage("record store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Tables>, StoreError> {
        self.inner
            .write()
            .map_err(|_| StoreError::Storage("record store lock poisoned".to_string()))
    }
}

fn tenant_mut(tables: &mut Tables, id: TenantId) -> Result<&mut TenantRecord, StoreError> {
    tables
        .tenants
        .get_mut(&id)
        .ok_or_else(|| StoreError::NotFound(format!("tenant {id}")))
}

#[async_trait]
impl TenantRecordStore for InMemoryRecordStore {
    async fn insert_tenant(&self, record: &TenantRecord) -> Result<(), StoreError> {
        let mut tables = self.write()?;

        let clash = tables.tenants.values().find(|t| {
            t.id == record.id || t.slug == record.slug || t.db_name == record.db_name
        });
        if let Some(existing) = clash {
            return Err(StoreError::Duplicate(format!(
                "tenant with slug '{}' or db '{}' already exists",
                existing.slug, existing.db_name
            )));
        }

        tables.tenants.insert(record.id, record.clone());
        Ok(())
    }

    async fn get_tenant(&self, id: TenantId) -> Result<Option<TenantRecord>, StoreError> {
        Ok(self.read()?.tenants.get(&id).cloned())
    }

    async fn compare_and_set_state(
        &self,
        id: TenantId,
        transition: Transition,
        message: Option<String>,
    ) -> Result<TenantRecord, StoreError> {
        let mut tables = self.write()?;
        let record = tenant_mut(&mut tables, id)?;

        if record.state != transition.from() {
            return Err(StoreError::StateConflict {
                expected: transition.from(),
                found: record.state,
            });
        }

        transition
            .apply(record, message, Utc::now())
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(record.clone())
    }

    async fn update_counters(&self, id: TenantId, counters: TenantCounters) -> Result<(), StoreError> {
        let injected = self
            .counter_failures
            .lock()
            .map_err(|_| StoreError::Storage("record store lock poisoned".to_string()))?
            .pop_front();
        if let Some(err) = injected {
            return Err(err);
        }

        let mut tables = self.write()?;
        let record = tenant_mut(&mut tables, id)?;
        record.counters = counters;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn record_backup_time(&self, id: TenantId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        let record = tenant_mut(&mut tables, id)?;
        record.last_backup_at = Some(at);
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn insert_backup(&self, backup: &BackupRecord) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        if !tables.tenants.contains_key(&backup.tenant_id) {
            return Err(StoreError::NotFound(format!("tenant {}", backup.tenant_id)));
        }
        if tables.backups.contains_key(&backup.id) {
            return Err(StoreError::Duplicate(format!("backup {}", backup.id)));
        }
        tables.backups.insert(backup.id, backup.clone());
        Ok(())
    }

    async fn get_backup(&self, id: BackupId) -> Result<Option<BackupRecord>, StoreError> {
        Ok(self.read()?.backups.get(&id).cloned())
    }

    async fn update_backup(&self, backup: &BackupRecord) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        let stored = tables
            .backups
            .get_mut(&backup.id)
            .ok_or_else(|| StoreError::NotFound(format!("backup {}", backup.id)))?;

        if stored.status != backup.status && !stored.status.can_advance_to(backup.status) {
            return Err(StoreError::Conflict(format!(
                "backup {} cannot move from {} to {}",
                backup.id, stored.status, backup.status
            )));
        }

        *stored = backup.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tenantforge_core::{
        BackupStatus, CustomerId, NewTenant, TenantState, request_transition,
    };

    fn tenant(slug: &str) -> TenantRecord {
        TenantRecord::creating(
            NewTenant {
                slug: slug.to_string(),
                name: "Tenant".to_string(),
                customer_id: CustomerId::new(),
                plan_id: None,
            },
            Utc::now(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn slug_and_db_name_are_unique() {
        let store = InMemoryRecordStore::new();
        store.insert_tenant(&tenant("acme-corp")).await.unwrap();

        let err = store.insert_tenant(&tenant("acme-corp")).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));
    }

    #[tokio::test]
    async fn cas_applies_once() {
        let store = InMemoryRecordStore::new();
        let record = tenant("acme-corp");
        store.insert_tenant(&record).await.unwrap();

        let t = request_transition(TenantState::Creating, TenantState::Active).unwrap();
        let updated = store.compare_and_set_state(record.id, t, None).await.unwrap();
        assert_eq!(updated.state, TenantState::Active);

        let err = store
            .compare_and_set_state(record.id, t, None)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::StateConflict {
                expected: TenantState::Creating,
                found: TenantState::Active
            }
        );
    }

    #[tokio::test]
    async fn cas_on_missing_tenant_is_not_found() {
        let store = InMemoryRecordStore::new();
        let t = request_transition(TenantState::Creating, TenantState::Active).unwrap();
        let err = store
            .compare_and_set_state(TenantId::new(), t, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn backup_updates_are_monotonic() {
        let store = InMemoryRecordStore::new();
        let record = tenant("acme-corp");
        store.insert_tenant(&record).await.unwrap();

        let mut backup = BackupRecord::pending(record.id, Utc::now());
        store.insert_backup(&backup).await.unwrap();

        let stale = backup.clone();
        backup.mark_in_progress(Utc::now()).unwrap();
        store.update_backup(&backup).await.unwrap();
        backup
            .mark_completed("/tmp/a.dump".into(), 10, "00".into(), Utc::now())
            .unwrap();
        store.update_backup(&backup).await.unwrap();

        let err = store.update_backup(&stale).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let stored = store.get_backup(backup.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BackupStatus::Completed);
    }

    #[tokio::test]
    async fn backup_requires_existing_tenant() {
        let store = InMemoryRecordStore::new();
        let backup = BackupRecord::pending(TenantId::new(), Utc::now());
        assert!(matches!(
            store.insert_backup(&backup).await.unwrap_err(),
            StoreError::NotFound(_)
        ));
    }
}

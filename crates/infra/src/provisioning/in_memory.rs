use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, Semaphore};

use super::{
    CreateOutcome, DropOutcome, ProvisionError, ProvisioningBackend, validate_database_name,
};

/// In-memory provisioning backend for tests/dev.
///
/// Failures can be queued per operation, and creates can be held behind a
/// gate to stage races deterministically.
#[derive(Debug, Default)]
pub struct InMemoryProvisioner {
    databases: Mutex<HashSet<String>>,
    create_failures: Mutex<VecDeque<ProvisionError>>,
    drop_failures: Mutex<VecDeque<ProvisionError>>,
    create_gate: Mutex<Option<Arc<Semaphore>>>,
    creates: AtomicUsize,
    drops: AtomicUsize,
}

impl InMemoryProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend `name` already exists on the server.
    pub async fn insert_existing(&self, name: impl Into<String>) {
        self.databases.lock().await.insert(name.into());
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.databases.lock().await.contains(name)
    }

    /// Make the next `create_database` call fail with `err`.
    pub async fn fail_next_create(&self, err: ProvisionError) {
        self.create_failures.lock().await.push_back(err);
    }

    /// Make the next `drop_database` call fail with `err`.
    pub async fn fail_next_drop(&self, err: ProvisionError) {
        self.drop_failures.lock().await.push_back(err);
    }

    /// Block creates until the returned semaphore receives permits.
    pub async fn gate_creates(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.create_gate.lock().await = Some(gate.clone());
        gate
    }

    /// Number of `create_database` calls made.
    pub fn create_calls(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn drop_calls(&self) -> usize {
        self.drops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProvisioningBackend for InMemoryProvisioner {
    async fn create_database(&self, name: &str) -> Result<CreateOutcome, ProvisionError> {
        validate_database_name(name)?;
        self.creates.fetch_add(1, Ordering::SeqCst);

        let gate = self.create_gate.lock().await.clone();
        if let Some(gate) = gate {
            gate.acquire()
                .await
                .map_err(|_| ProvisionError::Unavailable("create gate closed".to_string()))?
                .forget();
        }

        if let Some(err) = self.create_failures.lock().await.pop_front() {
            return Err(err);
        }

        if self.databases.lock().await.insert(name.to_string()) {
            Ok(CreateOutcome::Created)
        } else {
            Ok(CreateOutcome::AlreadyExists)
        }
    }

    async fn drop_database(&self, name: &str) -> Result<DropOutcome, ProvisionError> {
        validate_database_name(name)?;
        self.drops.fetch_add(1, Ordering::SeqCst);

        if let Some(err) = self.drop_failures.lock().await.pop_front() {
            return Err(err);
        }

        if self.databases.lock().await.remove(name) {
            Ok(DropOutcome::Dropped)
        } else {
            Ok(DropOutcome::Absent)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_drop_are_idempotent() {
        let p = InMemoryProvisioner::new();

        assert_eq!(p.create_database("odoo_acme").await.unwrap(), CreateOutcome::Created);
        assert_eq!(
            p.create_database("odoo_acme").await.unwrap(),
            CreateOutcome::AlreadyExists
        );
        assert_eq!(p.drop_database("odoo_acme").await.unwrap(), DropOutcome::Dropped);
        assert_eq!(p.drop_database("odoo_acme").await.unwrap(), DropOutcome::Absent);
        assert_eq!(p.create_calls(), 2);
        assert_eq!(p.drop_calls(), 2);
    }

    #[tokio::test]
    async fn injected_failure_applies_once() {
        let p = InMemoryProvisioner::new();
        p.fail_next_create(ProvisionError::Unavailable("down".into())).await;

        assert!(p.create_database("odoo_acme").await.is_err());
        assert!(!p.contains("odoo_acme").await);
        assert!(p.create_database("odoo_acme").await.is_ok());
    }

    #[tokio::test]
    async fn invalid_names_never_reach_the_backend() {
        let p = InMemoryProvisioner::new();
        let err = p.create_database("Robert'); DROP").await.unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidName(_)));
        assert_eq!(p.create_calls(), 0);
    }
}

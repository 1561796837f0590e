//! Append-only audit trail of lifecycle actions.
//!
//! A failed audit write never fails the action being audited: [`AuditTrail`]
//! logs the error and moves on.

pub mod postgres;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use tenantforge_core::{Actor, AuditAction, AuditEntry, TenantId};

pub use postgres::PostgresAuditSink;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuditError {
    #[error("audit storage error: {0}")]
    Storage(String),
}

/// Where audit entries are written.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, entry: &AuditEntry) -> Result<(), AuditError>;
}

#[async_trait]
impl<S> AuditSink for Arc<S>
where
    S: AuditSink + ?Sized,
{
    async fn append(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        (**self).append(entry).await
    }
}

/// Best-effort audit writer shared by handlers and the lifecycle service.
#[derive(Clone)]
pub struct AuditTrail {
    sink: Arc<dyn AuditSink>,
}

impl std::fmt::Debug for AuditTrail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditTrail").finish_non_exhaustive()
    }
}

impl AuditTrail {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    pub async fn record(
        &self,
        actor: Actor,
        action: AuditAction,
        resource_type: &str,
        resource_id: &str,
        before: Option<JsonValue>,
        after: Option<JsonValue>,
    ) {
        let entry = AuditEntry::new(actor, action, resource_type, resource_id, before, after);
        self.record_entry(entry).await;
    }

    /// Marker for a request that changed nothing, e.g. any action on a deleted tenant.
    pub async fn record_noop(&self, actor: Actor, tenant_id: TenantId, requested: &str, reason: &str) {
        let entry = AuditEntry::for_tenant(actor, AuditAction::Noop, tenant_id, None, None)
            .with_metadata(json!({ "requested": requested, "reason": reason }));
        self.record_entry(entry).await;
    }

    pub async fn record_entry(&self, entry: AuditEntry) {
        match self.sink.append(&entry).await {
            Ok(()) => debug!(
                action = %entry.action,
                resource_type = %entry.resource_type,
                resource_id = %entry.resource_id,
                actor = entry.actor.label(),
                "audit entry recorded"
            ),
            Err(e) => warn!(
                action = %entry.action,
                resource_type = %entry.resource_type,
                resource_id = %entry.resource_id,
                error = %e,
                "failed to write audit entry"
            ),
        }
    }
}

/// In-memory audit sink for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
    failing: AtomicBool,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent append fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().await.clone()
    }

    pub async fn entries_for(&self, resource_id: &str) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|e| e.resource_id == resource_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn append(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AuditError::Storage("audit sink unavailable".to_string()));
        }
        self.entries.lock().await.push(entry.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_are_appended_in_order() {
        let sink = Arc::new(InMemoryAuditSink::new());
        let trail = AuditTrail::new(sink.clone());
        let tenant = TenantId::new().to_string();

        trail
            .record(Actor::System, AuditAction::Create, "tenant", &tenant, None, None)
            .await;
        trail
            .record(Actor::System, AuditAction::Suspend, "tenant", &tenant, None, None)
            .await;

        let actions: Vec<_> = sink
            .entries_for(&tenant)
            .await
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(actions, vec![AuditAction::Create, AuditAction::Suspend]);
    }

    #[tokio::test]
    async fn sink_failure_is_swallowed() {
        let sink = Arc::new(InMemoryAuditSink::new());
        sink.set_failing(true);
        let trail = AuditTrail::new(sink.clone());

        trail
            .record(Actor::System, AuditAction::Delete, "tenant", "t-1", None, None)
            .await;

        assert!(sink.entries().await.is_empty());
    }

    #[tokio::test]
    async fn noop_marker_names_the_request() {
        let sink = Arc::new(InMemoryAuditSink::new());
        let trail = AuditTrail::new(sink.clone());
        let tenant = TenantId::new();

        trail.record_noop(Actor::System, tenant, "backup", "tenant deleted").await;

        let entries = sink.entries_for(&tenant.to_string()).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, AuditAction::Noop);
        assert_eq!(entries[0].before, None);
        assert_eq!(entries[0].after, None);
        assert_eq!(
            entries[0].metadata.as_ref().and_then(|m| m.get("requested")),
            Some(&json!("backup"))
        );
    }
}

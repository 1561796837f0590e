//! Audit entries: immutable records of state-affecting actions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::id::{AuditEntryId, TenantId, UserId};

/// Who performed an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Actor {
    /// Background workers and other automated callers.
    System,
    User { id: UserId, email: String },
}

impl Actor {
    pub fn user(id: UserId, email: impl Into<String>) -> Self {
        Self::User {
            id,
            email: email.into(),
        }
    }

    /// Denormalised label kept even if the user is later removed.
    pub fn label(&self) -> &str {
        match self {
            Actor::System => "system",
            Actor::User { email, .. } => email,
        }
    }

    pub fn user_id(&self) -> Option<UserId> {
        match self {
            Actor::System => None,
            Actor::User { id, .. } => Some(*id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
    Suspend,
    Resume,
    Backup,
    Restore,
    /// A requested operation that found nothing to do (e.g. delete of a deleted tenant).
    Noop,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::Create => "create",
            AuditAction::Update => "update",
            AuditAction::Delete => "delete",
            AuditAction::Suspend => "suspend",
            AuditAction::Resume => "resume",
            AuditAction::Backup => "backup",
            AuditAction::Restore => "restore",
            AuditAction::Noop => "noop",
        }
    }
}

impl core::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: AuditEntryId,
    pub actor: Actor,
    pub action: AuditAction,
    pub resource_type: String,
    pub resource_id: String,
    pub before: Option<JsonValue>,
    pub after: Option<JsonValue>,
    pub metadata: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        actor: Actor,
        action: AuditAction,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        before: Option<JsonValue>,
        after: Option<JsonValue>,
    ) -> Self {
        Self {
            id: AuditEntryId::new(),
            actor,
            action,
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            before,
            after,
            metadata: None,
            created_at: Utc::now(),
        }
    }

    /// Entry for a tenant resource.
    pub fn for_tenant(
        actor: Actor,
        action: AuditAction,
        tenant_id: TenantId,
        before: Option<JsonValue>,
        after: Option<JsonValue>,
    ) -> Self {
        Self::new(actor, action, "tenant", tenant_id.to_string(), before, after)
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

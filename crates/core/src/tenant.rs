//! Tenant record and lifecycle state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{CustomerId, PlanId, TenantId};

/// Prefix for every tenant's backing database name.
pub const DB_NAME_PREFIX: &str = "odoo_";

/// Lifecycle state of a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantState {
    Creating,
    Active,
    Suspended,
    Deleting,
    Deleted,
    Error,
}

impl TenantState {
    /// Every state, in declaration order.
    pub const ALL: [TenantState; 6] = [
        TenantState::Creating,
        TenantState::Active,
        TenantState::Suspended,
        TenantState::Deleting,
        TenantState::Deleted,
        TenantState::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TenantState::Creating => "creating",
            TenantState::Active => "active",
            TenantState::Suspended => "suspended",
            TenantState::Deleting => "deleting",
            TenantState::Deleted => "deleted",
            TenantState::Error => "error",
        }
    }

    /// `DELETED` accepts no further lifecycle operation.
    pub fn is_terminal(self) -> bool {
        matches!(self, TenantState::Deleted)
    }
}

impl core::fmt::Display for TenantState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for TenantState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TenantState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown tenant state: {s}")))
    }
}

/// Resource usage counters tracked per tenant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantCounters {
    pub current_users: u32,
    pub db_size_bytes: u64,
    pub filestore_size_bytes: u64,
}

/// Persisted tenant record.
///
/// Fields are public for storage adapters; lifecycle fields (`state`,
/// `state_message`, `suspended_at`) must only be changed through
/// [`crate::lifecycle::Transition::apply`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantRecord {
    pub id: TenantId,
    pub slug: String,
    pub name: String,
    pub customer_id: CustomerId,
    pub plan_id: Option<PlanId>,
    pub state: TenantState,
    pub state_message: Option<String>,
    pub db_name: String,
    pub counters: TenantCounters,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub suspended_at: Option<DateTime<Utc>>,
    pub last_backup_at: Option<DateTime<Utc>>,
}

/// Input for registering a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTenant {
    pub slug: String,
    pub name: String,
    pub customer_id: CustomerId,
    pub plan_id: Option<PlanId>,
}

impl TenantRecord {
    /// Build a fresh record in `CREATING`.
    ///
    /// The slug is normalised (trimmed, lowercased) and validated; the database
    /// name is derived from it and never changes afterwards.
    pub fn creating(new: NewTenant, now: DateTime<Utc>) -> DomainResult<Self> {
        let slug = new.slug.trim().to_lowercase();
        validate_slug(&slug)?;

        let name = new.name.trim().to_string();
        if name.is_empty() || name.chars().count() > 200 {
            return Err(DomainError::validation("tenant name must be 1-200 characters"));
        }

        Ok(Self {
            id: TenantId::new(),
            db_name: db_name_for_slug(&slug),
            slug,
            name,
            customer_id: new.customer_id,
            plan_id: new.plan_id,
            state: TenantState::Creating,
            state_message: None,
            counters: TenantCounters::default(),
            created_at: now,
            updated_at: now,
            suspended_at: None,
            last_backup_at: None,
        })
    }

    pub fn is_active(&self) -> bool {
        self.state == TenantState::Active
    }
}

/// Validate a tenant slug: 4-50 chars, lowercase alphanumerics and hyphens,
/// starting with a letter and not ending with a hyphen.
pub fn validate_slug(slug: &str) -> DomainResult<()> {
    let bytes = slug.as_bytes();
    let len_ok = (4..=50).contains(&bytes.len());
    let first_ok = bytes.first().is_some_and(|b| b.is_ascii_lowercase());
    let last_ok = bytes
        .last()
        .is_some_and(|b| b.is_ascii_lowercase() || b.is_ascii_digit());
    let body_ok = bytes
        .iter()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-');

    if len_ok && first_ok && last_ok && body_ok {
        Ok(())
    } else {
        Err(DomainError::validation(format!(
            "invalid slug '{slug}': must be 4-50 chars, lowercase alphanumeric and hyphens, start with a letter"
        )))
    }
}

/// Derive the backing database name for a slug (`acme-corp` -> `odoo_acme_corp`).
pub fn db_name_for_slug(slug: &str) -> String {
    format!("{DB_NAME_PREFIX}{}", slug.replace('-', "_"))
}

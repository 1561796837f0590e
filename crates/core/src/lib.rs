//! `tenantforge-core`: tenant lifecycle domain building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the tenant/backup/audit records, and the lifecycle state machine.

pub mod audit;
pub mod backup;
pub mod error;
pub mod id;
pub mod lifecycle;
pub mod tenant;

pub use audit::{Actor, AuditAction, AuditEntry};
pub use backup::{BackupRecord, BackupStatus, BackupType, truncate_message};
pub use error::{DomainError, DomainResult};
pub use id::{AuditEntryId, BackupId, CustomerId, PlanId, TenantId, UserId};
pub use lifecycle::{Transition, request_transition, restore_failure, restore_transition};
pub use tenant::{NewTenant, TenantCounters, TenantRecord, TenantState, db_name_for_slug, validate_slug};

//! Error taxonomy for lifecycle job handlers.

use tenantforge_core::{DomainError, TenantState};

use crate::provisioning::ProvisionError;
use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    /// Illegal state change; nothing was touched.
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: TenantState, to: TenantState },

    /// External resource is in a state the job did not expect.
    #[error("resource conflict: {0}")]
    ResourceConflict(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Some external effects happened and others did not.
    #[error("partial failure: {0}")]
    PartialFailure(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Preconditions for the action do not hold.
    #[error("not eligible: {0}")]
    NotEligible(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LifecycleError {
    /// Short machine-readable name, used in job reports and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            LifecycleError::InvalidTransition { .. } => "invalid_transition",
            LifecycleError::ResourceConflict(_) => "resource_conflict",
            LifecycleError::BackendUnavailable(_) => "backend_unavailable",
            LifecycleError::PartialFailure(_) => "partial_failure",
            LifecycleError::NotFound(_) => "not_found",
            LifecycleError::NotEligible(_) => "not_eligible",
            LifecycleError::Store(StoreError::StateConflict { .. }) => "state_conflict",
            LifecycleError::Store(_) => "store",
        }
    }

    /// Whether the tenant record should be moved to `ERROR` for this failure.
    pub fn routes_to_error(&self) -> bool {
        matches!(
            self,
            LifecycleError::ResourceConflict(_)
                | LifecycleError::BackendUnavailable(_)
                | LifecycleError::PartialFailure(_)
        )
    }
}

impl From<DomainError> for LifecycleError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::InvalidTransition { from, to } => {
                LifecycleError::InvalidTransition { from, to }
            }
            DomainError::Conflict(msg) => LifecycleError::Store(StoreError::Conflict(msg)),
            other => LifecycleError::NotEligible(other.to_string()),
        }
    }
}

impl From<ProvisionError> for LifecycleError {
    fn from(err: ProvisionError) -> Self {
        match err {
            ProvisionError::InvalidName(name) => {
                LifecycleError::NotEligible(format!("invalid database name: {name}"))
            }
            other => LifecycleError::BackendUnavailable(other.to_string()),
        }
    }
}

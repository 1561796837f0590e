//! Tenant lifecycle state machine.
//!
//! The legal edges are:
//!
//! ```text
//! CREATING  -> ACTIVE | ERROR
//! ACTIVE    -> SUSPENDED | DELETING
//! SUSPENDED -> ACTIVE | DELETING
//! DELETING  -> DELETED | ERROR
//! ```
//!
//! `ERROR` has no automatic exit and `DELETED` is terminal. A restore is an
//! operator-requested recovery that sits outside the automatic graph; its
//! edges are exposed separately through [`restore_transition`] and
//! [`restore_failure`].
//!
//! Everything here is pure. Persisting a [`Transition`] atomically is the job
//! of the record store, which compares the stored state against
//! [`Transition::from`] before writing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::tenant::{TenantRecord, TenantState};

/// A validated state change. Only obtainable from this module's functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    from: TenantState,
    to: TenantState,
}

/// Whether `(from, to)` is an edge of the automatic lifecycle graph.
pub fn is_edge(from: TenantState, to: TenantState) -> bool {
    use TenantState::*;

    matches!(
        (from, to),
        (Creating, Active)
            | (Creating, Error)
            | (Active, Suspended)
            | (Active, Deleting)
            | (Suspended, Active)
            | (Suspended, Deleting)
            | (Deleting, Deleted)
            | (Deleting, Error)
    )
}

/// Validate a lifecycle change.
///
/// Pure function of the pair; returns `InvalidTransition` for anything that is
/// not an edge, including self-loops.
pub fn request_transition(current: TenantState, target: TenantState) -> DomainResult<Transition> {
    if is_edge(current, target) {
        Ok(Transition {
            from: current,
            to: target,
        })
    } else {
        Err(DomainError::invalid_transition(current, target))
    }
}

fn is_restore_source(state: TenantState) -> bool {
    matches!(
        state,
        TenantState::Active | TenantState::Suspended | TenantState::Error
    )
}

/// Successful restore: the tenant comes back `ACTIVE`.
pub fn restore_transition(current: TenantState) -> DomainResult<Transition> {
    if is_restore_source(current) {
        Ok(Transition {
            from: current,
            to: TenantState::Active,
        })
    } else {
        Err(DomainError::invalid_transition(current, TenantState::Active))
    }
}

/// Failed restore after the database was touched: the tenant goes to `ERROR`.
pub fn restore_failure(current: TenantState) -> DomainResult<Transition> {
    if is_restore_source(current) {
        Ok(Transition {
            from: current,
            to: TenantState::Error,
        })
    } else {
        Err(DomainError::invalid_transition(current, TenantState::Error))
    }
}

impl Transition {
    pub fn from(&self) -> TenantState {
        self.from
    }

    pub fn to(&self) -> TenantState {
        self.to
    }

    /// Apply to an in-memory record.
    ///
    /// Fails with `Conflict` if the record is no longer in `from`. Maintains the
    /// `suspended_at` iff `SUSPENDED` invariant and bumps `updated_at`.
    pub fn apply(
        &self,
        record: &mut TenantRecord,
        message: Option<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        if record.state != self.from {
            return Err(DomainError::conflict(format!(
                "tenant {} is {}, expected {}",
                record.id, record.state, self.from
            )));
        }

        record.state = self.to;
        record.state_message = message;
        record.updated_at = now;
        record.suspended_at = match self.to {
            TenantState::Suspended => Some(now),
            _ => None,
        };
        Ok(())
    }
}

//! Provisioning backend: idempotent create/drop of a tenant's isolated database.

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use in_memory::InMemoryProvisioner;
pub use postgres::PostgresProvisioner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropOutcome {
    Dropped,
    Absent,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProvisionError {
    #[error("invalid database name: {0}")]
    InvalidName(String),

    /// Backend could not be reached.
    #[error("provisioning backend unavailable: {0}")]
    Unavailable(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// Backend reached but the statement failed.
    #[error("provisioning failed: {0}")]
    Backend(String),
}

/// Creates and drops tenant databases.
///
/// Both operations are idempotent and run outside any caller transaction.
#[async_trait]
pub trait ProvisioningBackend: Send + Sync {
    async fn create_database(&self, name: &str) -> Result<CreateOutcome, ProvisionError>;

    async fn drop_database(&self, name: &str) -> Result<DropOutcome, ProvisionError>;
}

#[async_trait]
impl<P> ProvisioningBackend for Arc<P>
where
    P: ProvisioningBackend + ?Sized,
{
    async fn create_database(&self, name: &str) -> Result<CreateOutcome, ProvisionError> {
        (**self).create_database(name).await
    }

    async fn drop_database(&self, name: &str) -> Result<DropOutcome, ProvisionError> {
        (**self).drop_database(name).await
    }
}

/// Accept only `[a-z_][a-z0-9_]{0,62}`.
///
/// Tenant database names are derived from validated slugs, so anything else
/// here is a bug upstream; refusing it keeps DDL free of injection.
pub fn validate_database_name(name: &str) -> Result<(), ProvisionError> {
    let bytes = name.as_bytes();
    let first_ok = bytes
        .first()
        .is_some_and(|b| b.is_ascii_lowercase() || *b == b'_');
    let rest_ok = bytes
        .iter()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'_');

    if first_ok && rest_ok && bytes.len() <= 63 {
        Ok(())
    } else {
        Err(ProvisionError::InvalidName(name.to_string()))
    }
}

/// Double-quote an identifier that already passed [`validate_database_name`].
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

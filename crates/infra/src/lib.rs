//! Infrastructure layer: record stores, provisioning, backups, audit, and the
//! job engine that drives tenant lifecycle actions.

pub mod audit;
pub mod backup;
pub mod config;
pub mod jobs;
pub mod lifecycle;
pub mod provisioning;
pub mod schema;
pub mod store;

#[cfg(test)]
mod integration_tests;

pub use config::OrchestratorConfig;
pub use lifecycle::{LifecycleService, ServiceError};

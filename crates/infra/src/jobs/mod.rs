//! Lifecycle job engine.
//!
//! ## Design
//!
//! - Jobs are tenant-scoped and typed by a closed [`JobKind`]
//! - Three strictly prioritised lanes, FIFO within a lane
//! - At-least-once delivery through leases; lease expiry is the only redelivery
//! - At most one leased job per tenant at a time
//! - Failed jobs are recorded, never retried
//!
//! ## Components
//!
//! - `JobQueue`: durable queue contract (in-memory and Postgres)
//! - `LifecycleHandlers`: PROVISION / DELETE / BACKUP / RESTORE
//! - `WorkerPool`: N workers plus a `LeaseReaper`, with graceful shutdown

pub mod error;
pub mod handlers;
pub mod postgres;
pub mod queue;
pub mod reaper;
pub mod types;
pub mod worker;

pub use error::LifecycleError;
pub use handlers::{JobHandler, JobOutcome, JobReport, LifecycleHandlers};
pub use postgres::PostgresJobQueue;
pub use queue::{InMemoryJobQueue, JobQueue, LeasePolicy, QueueError, QueueStats};
pub use reaper::LeaseReaper;
pub use types::{Job, JobId, JobKind, JobPayload, JobStatus, Lane, LeaseToken, LeasedJob};
pub use worker::{PoolStats, WorkerPool, WorkerPoolConfig, WorkerPoolHandle};

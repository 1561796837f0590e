//! Lifecycle worker: leases jobs from Postgres and runs them until signalled.

mod shutdown;

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use tenantforge_infra::audit::{AuditTrail, PostgresAuditSink};
use tenantforge_infra::backup::{BackupEngine, PgDumpTool};
use tenantforge_infra::jobs::{
    LeasePolicy, LifecycleHandlers, PostgresJobQueue, WorkerPool, WorkerPoolConfig,
};
use tenantforge_infra::provisioning::PostgresProvisioner;
use tenantforge_infra::store::PostgresRecordStore;
use tenantforge_infra::{OrchestratorConfig, schema};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tenantforge_observability::init();

    let config = OrchestratorConfig::from_env().context("invalid configuration")?;
    let db = &config.database;
    tracing::info!(
        worker = %config.worker_name,
        concurrency = config.worker_concurrency,
        host = %db.host,
        database = %db.database,
        backup_dir = %config.backup_dir.display(),
        "starting lifecycle worker"
    );

    let pool = PgPoolOptions::new()
        .max_connections(db.pool_size)
        .connect_with(db.connect_options())
        .await
        .with_context(|| format!("failed to connect to {}:{}/{}", db.host, db.port, db.database))?;

    schema::apply(&pool).await.context("failed to apply schema")?;

    let store = Arc::new(PostgresRecordStore::new(pool.clone(), db.statement_timeout));
    let provisioner = Arc::new(PostgresProvisioner::new(db.maintenance_options(), config.ddl_timeout));
    let dump = Arc::new(PgDumpTool::new(
        db.host.clone(),
        db.port,
        db.user.clone(),
        db.password.clone(),
    ));
    let audit = AuditTrail::new(Arc::new(PostgresAuditSink::new(pool.clone())));

    let backups = BackupEngine::new(
        store.clone(),
        provisioner.clone(),
        dump,
        audit.clone(),
        config.backup_dir.clone(),
        config.dump_timeout,
    );
    let handlers = Arc::new(LifecycleHandlers::new(store, provisioner, backups, audit));

    let queue = Arc::new(
        PostgresJobQueue::connect(pool.clone(), LeasePolicy::from(&config), config.worker_name.clone())
            .await
            .context("failed to start job queue listener")?,
    );

    let workers = WorkerPool::new(queue, handlers, WorkerPoolConfig::from(&config)).spawn();

    let signalled = shutdown::wait().await;
    workers.shutdown().await;
    pool.close().await;

    signalled.context("signal handling failed")?;
    tracing::info!("lifecycle worker stopped");
    Ok(())
}

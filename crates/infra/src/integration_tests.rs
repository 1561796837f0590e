//! Integration tests for the full lifecycle pipeline.
//!
//! Tests: LifecycleService → JobQueue → WorkerPool → LifecycleHandlers → stores
//!
//! Verifies:
//! - Jobs drive tenants through the lifecycle and leave an audit trail
//! - Backups round-trip through restore
//! - Conflicting actions on one tenant never corrupt its record

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tenantforge_core::{
        Actor, AuditAction, BackupRecord, BackupStatus, CustomerId, NewTenant, TenantId, TenantRecord,
        TenantState, UserId,
    };

    use crate::audit::{AuditTrail, InMemoryAuditSink};
    use crate::backup::{BackupEngine, DumpError, InMemoryDumpTool};
    use crate::jobs::{
        InMemoryJobQueue, Job, JobHandler, JobId, JobOutcome, JobPayload, JobQueue, JobStatus,
        Lane, LeasePolicy, LifecycleError, LifecycleHandlers, WorkerPool, WorkerPoolConfig,
        WorkerPoolHandle,
    };
    use crate::lifecycle::{LifecycleService, ServiceError};
    use crate::provisioning::InMemoryProvisioner;
    use crate::store::{InMemoryRecordStore, TenantRecordStore};

    const WAIT: Duration = Duration::from_secs(5);

    struct Stack {
        store: Arc<InMemoryRecordStore>,
        provisioner: Arc<InMemoryProvisioner>,
        dump: Arc<InMemoryDumpTool>,
        audit: Arc<InMemoryAuditSink>,
        queue: Arc<InMemoryJobQueue>,
        service: LifecycleService,
        handlers: Arc<LifecycleHandlers>,
        _backups: tempfile::TempDir,
    }

    fn stack() -> Stack {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("tenantforge_infra=debug")
            .with_test_writer()
            .try_init();

        let backups = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryRecordStore::new());
        let provisioner = Arc::new(InMemoryProvisioner::new());
        let dump = Arc::new(InMemoryDumpTool::new());
        let audit = Arc::new(InMemoryAuditSink::new());
        let queue = InMemoryJobQueue::arc(LeasePolicy::uniform(Duration::from_secs(60)));
        let trail = AuditTrail::new(audit.clone());

        let engine = BackupEngine::new(
            store.clone(),
            provisioner.clone(),
            dump.clone(),
            trail.clone(),
            backups.path(),
            Duration::from_secs(10),
        );
        let handlers = Arc::new(LifecycleHandlers::new(
            store.clone(),
            provisioner.clone(),
            engine,
            trail.clone(),
        ));
        let service = LifecycleService::new(store.clone(), queue.clone(), trail);

        Stack {
            store,
            provisioner,
            dump,
            audit,
            queue,
            service,
            handlers,
            _backups: backups,
        }
    }

    fn operator() -> Actor {
        Actor::user(UserId::new(), "ops@example.com")
    }

    fn acme() -> NewTenant {
        NewTenant {
            slug: "acme-corp".into(),
            name: "Acme Corp".into(),
            customer_id: CustomerId::new(),
            plan_id: None,
        }
    }

    impl Stack {
        fn start(&self) -> WorkerPoolHandle {
            let config = WorkerPoolConfig::default()
                .with_name("it")
                .with_concurrency(2)
                .with_dequeue_wait(Duration::from_millis(20))
                .with_reaper_interval(Duration::from_secs(1));
            WorkerPool::new(self.queue.clone(), self.handlers.clone(), config).spawn()
        }

        async fn tenant(&self, id: TenantId) -> TenantRecord {
            self.store.get_tenant(id).await.unwrap().unwrap()
        }

        async fn wait_for_job(&self, id: JobId) -> Job {
            tokio::time::timeout(WAIT, async {
                loop {
                    let job = self.queue.get(id).await.unwrap().unwrap();
                    if job.status.is_terminal() {
                        return job;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("job should finish")
        }

        /// Register acme-corp and run its provision job to completion.
        async fn active_tenant(&self) -> TenantRecord {
            let (record, job) = self.service.register_tenant(acme(), operator()).await.unwrap();
            let pool = self.start();
            assert_eq!(self.wait_for_job(job).await.status, JobStatus::Completed);
            pool.shutdown().await;
            self.tenant(record.id).await
        }

        async fn actions(&self, id: TenantId) -> Vec<AuditAction> {
            self.audit
                .entries_for(&id.to_string())
                .await
                .into_iter()
                .map(|e| e.action)
                .collect()
        }
    }

    #[tokio::test]
    async fn acme_corp_is_provisioned_to_active() {
        let s = stack();
        let (record, job) = s.service.register_tenant(acme(), operator()).await.unwrap();
        assert_eq!(record.state, TenantState::Creating);
        assert_eq!(record.db_name, "odoo_acme_corp");

        let pool = s.start();
        let job = s.wait_for_job(job).await;
        pool.shutdown().await;

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 1);

        let tenant = s.tenant(record.id).await;
        assert_eq!(tenant.state, TenantState::Active);
        assert_eq!(tenant.state_message, None);
        assert!(s.provisioner.contains("odoo_acme_corp").await);
        assert_eq!(
            s.actions(record.id).await,
            vec![AuditAction::Create, AuditAction::Update]
        );
    }

    #[tokio::test]
    async fn provision_on_active_tenant_never_recreates_the_database() {
        let s = stack();
        let tenant = s.active_tenant().await;

        let pool = s.start();
        let job = s
            .service
            .enqueue_on(JobPayload::provision(tenant.id), Lane::High)
            .await
            .unwrap();
        assert_eq!(s.wait_for_job(job).await.status, JobStatus::Completed);
        pool.shutdown().await;

        assert_eq!(s.provisioner.create_calls(), 1);
        assert_eq!(s.tenant(tenant.id).await, tenant);
    }

    #[tokio::test]
    async fn suspend_resume_then_delete() {
        let s = stack();
        let tenant = s.active_tenant().await;

        let suspended = s.service.suspend(tenant.id, operator()).await.unwrap();
        assert_eq!(suspended.state, TenantState::Suspended);
        assert!(suspended.suspended_at.is_some());

        let resumed = s.service.resume(tenant.id, operator()).await.unwrap();
        assert_eq!(resumed.state, TenantState::Active);
        assert!(resumed.suspended_at.is_none());

        s.service.suspend(tenant.id, operator()).await.unwrap();
        let pool = s.start();
        let job = s
            .service
            .request_delete(tenant.id, operator())
            .await
            .unwrap()
            .expect("delete should be queued");
        assert_eq!(s.wait_for_job(job).await.status, JobStatus::Completed);
        pool.shutdown().await;

        let deleted = s.tenant(tenant.id).await;
        assert_eq!(deleted.state, TenantState::Deleted);
        assert!(deleted.suspended_at.is_none());
        assert!(!s.provisioner.contains(&tenant.db_name).await);
    }

    #[tokio::test]
    async fn delete_of_deleted_tenant_only_leaves_a_noop_marker() {
        let s = stack();
        let tenant = s.active_tenant().await;

        let pool = s.start();
        let job = s.service.request_delete(tenant.id, operator()).await.unwrap().unwrap();
        s.wait_for_job(job).await;

        let deleted = s.tenant(tenant.id).await;
        let audits = s.audit.entries().await.len();

        // Through the service: nothing queued.
        assert_eq!(s.service.request_delete(tenant.id, operator()).await.unwrap(), None);

        // Through a job submitted directly.
        let job = s
            .service
            .enqueue_on(JobPayload::delete(tenant.id), Lane::Default)
            .await
            .unwrap();
        assert_eq!(s.wait_for_job(job).await.status, JobStatus::Completed);
        pool.shutdown().await;

        assert_eq!(s.tenant(tenant.id).await, deleted);
        let entries = s.audit.entries().await;
        assert_eq!(entries.len(), audits + 2);
        assert!(entries[audits..].iter().all(|e| e.action == AuditAction::Noop));
        assert_eq!(s.provisioner.drop_calls(), 1);
    }

    #[tokio::test]
    async fn jobs_on_a_deleted_tenant_complete_without_effect() {
        let s = stack();
        let tenant = s.active_tenant().await;
        let request = s
            .service
            .request_backup(tenant.id, operator())
            .await
            .unwrap()
            .unwrap();

        let pool = s.start();
        s.wait_for_job(request.job_id).await;
        let job = s.service.request_delete(tenant.id, operator()).await.unwrap().unwrap();
        s.wait_for_job(job).await;

        let deleted = s.tenant(tenant.id).await;
        assert_eq!(deleted.state, TenantState::Deleted);
        let pending = BackupRecord::pending(tenant.id, chrono::Utc::now());
        s.store.insert_backup(&pending).await.unwrap();
        let audits = s.audit.entries().await.len();

        for (payload, lane) in [
            (JobPayload::provision(tenant.id), Lane::Default),
            (JobPayload::backup(tenant.id, pending.id), Lane::Low),
            (JobPayload::restore(tenant.id, request.backup.id), Lane::High),
        ] {
            let job = s.service.enqueue_on(payload, lane).await.unwrap();
            assert_eq!(s.wait_for_job(job).await.status, JobStatus::Completed);
        }
        pool.shutdown().await;

        assert_eq!(s.tenant(tenant.id).await, deleted);
        assert_eq!(
            s.store.get_backup(pending.id).await.unwrap().unwrap().status,
            BackupStatus::Pending
        );
        assert_eq!(s.provisioner.create_calls(), 1);
        assert_eq!(s.provisioner.drop_calls(), 1);

        let entries = s.audit.entries().await;
        assert_eq!(entries.len(), audits + 3);
        assert!(entries[audits..].iter().all(|e| e.action == AuditAction::Noop));
    }

    #[tokio::test]
    async fn backup_of_suspended_tenant_is_rejected() {
        let s = stack();
        let tenant = s.active_tenant().await;
        let request = s.service.request_backup(tenant.id, operator()).await.unwrap().unwrap();
        s.service.suspend(tenant.id, operator()).await.unwrap();

        assert!(matches!(
            s.service.request_backup(tenant.id, operator()).await,
            Err(ServiceError::NotEligible(_))
        ));

        // The backup queued while active now runs against a suspended tenant.
        let pool = s.start();
        let job = s.wait_for_job(request.job_id).await;
        pool.shutdown().await;

        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.last_error.unwrap().starts_with("not_eligible"));

        let backup = s.store.get_backup(request.backup.id).await.unwrap().unwrap();
        assert_eq!(backup.status, BackupStatus::Failed);
        assert_eq!(backup.error_message.as_deref(), Some("tenant not active"));
        assert_eq!(s.tenant(tenant.id).await.state, TenantState::Suspended);
    }

    #[tokio::test]
    async fn backup_then_restore_round_trip() {
        let s = stack();
        let tenant = s.active_tenant().await;
        s.dump.set_contents("odoo_acme_corp", b"customer rows v1".to_vec()).await;

        let pool = s.start();
        let request = s.service.request_backup(tenant.id, operator()).await.unwrap().unwrap();
        assert_eq!(s.wait_for_job(request.job_id).await.status, JobStatus::Completed);

        let backup = s.store.get_backup(request.backup.id).await.unwrap().unwrap();
        assert_eq!(backup.status, BackupStatus::Completed);
        assert!(backup.file_size_bytes.unwrap() > 0);
        assert_eq!(backup.checksum.as_ref().map(String::len), Some(64));
        assert!(backup.started_at.is_some() && backup.completed_at.is_some());
        assert!(s.tenant(tenant.id).await.last_backup_at.is_some());

        s.dump.set_contents("odoo_acme_corp", b"damaged".to_vec()).await;

        let job = s
            .service
            .request_restore(tenant.id, backup.id, operator())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(s.wait_for_job(job).await.status, JobStatus::Completed);
        pool.shutdown().await;

        assert_eq!(
            s.dump.contents("odoo_acme_corp").await.unwrap(),
            b"customer rows v1".to_vec()
        );
        assert_eq!(s.tenant(tenant.id).await.state, TenantState::Active);

        let restore = s
            .audit
            .entries_for(&tenant.id.to_string())
            .await
            .into_iter()
            .find(|e| e.action == AuditAction::Restore)
            .expect("restore audited");
        assert_eq!(
            restore.metadata.unwrap()["backup_id"],
            serde_json::json!(backup.id)
        );
    }

    #[tokio::test]
    async fn restore_failure_after_drop_leaves_tenant_in_error() {
        let s = stack();
        let tenant = s.active_tenant().await;

        let pool = s.start();
        let request = s.service.request_backup(tenant.id, operator()).await.unwrap().unwrap();
        s.wait_for_job(request.job_id).await;

        s.dump
            .fail_next_restore(DumpError::Failed {
                program: "pg_restore".into(),
                code: Some(1),
                stderr: "could not read archive".into(),
            })
            .await;
        let job = s
            .service
            .request_restore(tenant.id, request.backup.id, operator())
            .await
            .unwrap()
            .unwrap();
        let job = s.wait_for_job(job).await;
        pool.shutdown().await;

        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.last_error.unwrap().starts_with("partial_failure"));

        let tenant = s.tenant(tenant.id).await;
        assert_eq!(tenant.state, TenantState::Error);
        assert!(tenant.state_message.unwrap().contains("could not read archive"));
    }

    #[tokio::test]
    async fn queue_holds_second_job_while_tenant_is_busy() {
        let s = stack();
        let gate = s.provisioner.gate_creates().await;
        let (record, provision) = s.service.register_tenant(acme(), operator()).await.unwrap();
        let delete = s
            .service
            .enqueue_on(JobPayload::delete(record.id), Lane::High)
            .await
            .unwrap();

        // Only one job of the tenant may be leased; the high-lane delete goes first.
        let pool = s.start();
        let first = s.wait_for_job(delete).await;
        assert_eq!(first.status, JobStatus::Failed);
        assert!(first.last_error.unwrap().starts_with("invalid_transition"));

        tokio::time::timeout(WAIT, async {
            while s.provisioner.create_calls() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(s.queue.stats().await.unwrap().leased, 1);

        gate.add_permits(1);
        assert_eq!(s.wait_for_job(provision).await.status, JobStatus::Completed);
        pool.shutdown().await;

        assert_eq!(s.tenant(record.id).await.state, TenantState::Active);
    }

    #[tokio::test]
    async fn conflicting_jobs_on_one_tenant_exactly_one_wins() {
        let s = stack();
        let gate = s.provisioner.gate_creates().await;
        let (record, _) = s.service.register_tenant(acme(), operator()).await.unwrap();

        // Lease both jobs from separate queues so nothing serialises them
        // except the record store.
        let provision = s.queue.lease_next(Duration::ZERO).await.unwrap().unwrap();
        let side_queue = InMemoryJobQueue::new(LeasePolicy::default());
        side_queue
            .enqueue(JobPayload::delete(record.id), Lane::Default)
            .await
            .unwrap();
        let delete = side_queue.lease_next(Duration::ZERO).await.unwrap().unwrap();

        let handlers = s.handlers.clone();
        let provisioning = tokio::spawn(async move { handlers.handle(&provision).await });
        tokio::time::timeout(WAIT, async {
            while s.provisioner.create_calls() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let deleted = s.handlers.handle(&delete).await;
        let suspended = s.service.suspend(record.id, operator()).await;
        gate.add_permits(1);
        let provisioned = provisioning.await.unwrap();

        assert!(provisioned.is_success());
        assert_eq!(
            deleted.outcome,
            JobOutcome::Failed(LifecycleError::InvalidTransition {
                from: TenantState::Creating,
                to: TenantState::Deleting,
            })
        );
        assert!(matches!(suspended, Err(ServiceError::Domain(_))));

        let tenant = s.tenant(record.id).await;
        assert_eq!(tenant.state, TenantState::Active);
        assert_eq!(tenant.state_message, None);
        assert_eq!(s.provisioner.drop_calls(), 0);
    }

    #[tokio::test]
    async fn audit_outage_does_not_block_lifecycle() {
        let s = stack();
        s.audit.set_failing(true);

        let (record, job) = s.service.register_tenant(acme(), operator()).await.unwrap();
        let pool = s.start();
        assert_eq!(s.wait_for_job(job).await.status, JobStatus::Completed);
        pool.shutdown().await;

        assert_eq!(s.tenant(record.id).await.state, TenantState::Active);
        assert!(s.audit.entries().await.is_empty());
    }
}

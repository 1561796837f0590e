//! Job queue abstraction and the in-memory implementation.
//!
//! Delivery is at-least-once. A leased job that is not acked before its lease
//! deadline becomes visible again with its attempt count bumped on the next
//! lease. Acks are checked against the lease token, so a worker whose lease
//! was reclaimed cannot complete a job someone else now holds.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

use tenantforge_core::TenantId;

use crate::config::OrchestratorConfig;

use super::types::{Job, JobId, JobKind, JobPayload, JobStatus, Lane, LeaseToken, LeasedJob};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// The lease was reclaimed (expired) or the token does not match.
    #[error("lease lost for job {0}")]
    LeaseLost(JobId),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("queue storage error: {0}")]
    Storage(String),
}

/// Counts of jobs per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub leased: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Lease durations per job kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeasePolicy {
    pub provision: Duration,
    pub backup: Duration,
}

impl Default for LeasePolicy {
    fn default() -> Self {
        Self {
            provision: Duration::from_secs(1800),
            backup: Duration::from_secs(3600),
        }
    }
}

impl LeasePolicy {
    pub fn uniform(lease: Duration) -> Self {
        Self {
            provision: lease,
            backup: lease,
        }
    }

    pub fn lease_for(&self, kind: JobKind) -> Duration {
        match kind {
            JobKind::Provision | JobKind::Delete => self.provision,
            JobKind::Backup | JobKind::Restore => self.backup,
        }
    }
}

impl From<&OrchestratorConfig> for LeasePolicy {
    fn from(cfg: &OrchestratorConfig) -> Self {
        Self {
            provision: cfg.provision_lease,
            backup: cfg.backup_lease,
        }
    }
}

/// Durable, prioritised, at-least-once queue of lifecycle jobs.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, payload: JobPayload, lane: Lane) -> Result<JobId, QueueError>;

    /// Lease the next ready job, waiting up to `wait` for one to appear.
    ///
    /// Strict lane priority, FIFO within a lane. Jobs whose tenant already has
    /// a job in flight are skipped.
    async fn lease_next(&self, wait: Duration) -> Result<Option<LeasedJob>, QueueError>;

    async fn complete(&self, leased: &LeasedJob) -> Result<(), QueueError>;

    async fn fail(&self, leased: &LeasedJob, error: &str) -> Result<(), QueueError>;

    /// Make every job whose lease has expired visible again. Returns how many.
    async fn reclaim_expired(&self) -> Result<usize, QueueError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;
}

#[async_trait]
impl<Q> JobQueue for Arc<Q>
where
    Q: JobQueue + ?Sized,
{
    async fn enqueue(&self, payload: JobPayload, lane: Lane) -> Result<JobId, QueueError> {
        (**self).enqueue(payload, lane).await
    }

    async fn lease_next(&self, wait: Duration) -> Result<Option<LeasedJob>, QueueError> {
        (**self).lease_next(wait).await
    }

    async fn complete(&self, leased: &LeasedJob) -> Result<(), QueueError> {
        (**self).complete(leased).await
    }

    async fn fail(&self, leased: &LeasedJob, error: &str) -> Result<(), QueueError> {
        (**self).fail(leased, error).await
    }

    async fn reclaim_expired(&self) -> Result<usize, QueueError> {
        (**self).reclaim_expired().await
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        (**self).get(id).await
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        (**self).stats().await
    }
}

#[derive(Debug)]
struct Lease {
    token: LeaseToken,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    jobs: HashMap<JobId, Job>,
    /// Enqueue sequence per job; keeps FIFO order stable across redelivery.
    seq: HashMap<JobId, u64>,
    next_seq: u64,
    /// Ready job ids per lane, ordered by sequence.
    ready: [VecDeque<JobId>; 3],
    leases: HashMap<JobId, Lease>,
    busy_tenants: HashSet<TenantId>,
}

impl QueueState {
    fn push_ready(&mut self, id: JobId, lane: Lane) {
        let seq = self.seq.get(&id).copied().unwrap_or(u64::MAX);
        let seqs = &self.seq;
        let lane_queue = &mut self.ready[lane.rank() as usize];
        let pos = lane_queue.partition_point(|other| seqs.get(other).copied().unwrap_or(0) < seq);
        lane_queue.insert(pos, id);
    }

    fn reclaim(&mut self, now: Instant) -> usize {
        let expired: Vec<JobId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            self.leases.remove(id);
            let Some(job) = self.jobs.get_mut(id) else {
                continue;
            };
            job.mark_requeued();
            let (tenant, lane) = (job.tenant_id(), job.lane);
            self.busy_tenants.remove(&tenant);
            self.push_ready(*id, lane);
            debug!(job_id = %id, tenant_id = %tenant, "lease expired; job requeued");
        }

        expired.len()
    }

    fn take_next(&mut self) -> Option<JobId> {
        for lane in Lane::ALL {
            let idx = lane.rank() as usize;
            let pos = self.ready[idx].iter().position(|id| {
                self.jobs
                    .get(id)
                    .is_some_and(|job| !self.busy_tenants.contains(&job.tenant_id()))
            });
            if let Some(pos) = pos {
                return self.ready[idx].remove(pos);
            }
        }
        None
    }

    /// Check the lease and release it; the job is then free to finish.
    fn release(&mut self, leased: &LeasedJob) -> Result<&mut Job, QueueError> {
        let id = leased.id();
        match self.leases.get(&id) {
            Some(lease) if lease.token == leased.token => {}
            _ => return Err(QueueError::LeaseLost(id)),
        }
        self.leases.remove(&id);

        let job = self.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        self.busy_tenants.remove(&job.tenant_id());
        Ok(job)
    }
}

/// In-memory job queue for tests/dev.
///
/// Waiting leasers park on a [`Notify`] that is signalled whenever a job
/// becomes leasable (enqueue, ack, reclaim).
#[derive(Debug)]
pub struct InMemoryJobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    leases: LeasePolicy,
}

impl InMemoryJobQueue {
    pub fn new(leases: LeasePolicy) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            leases,
        }
    }

    pub fn arc(leases: LeasePolicy) -> Arc<Self> {
        Arc::new(Self::new(leases))
    }

    async fn try_lease(&self) -> Option<LeasedJob> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.reclaim(now);

        let id = state.take_next()?;
        let job = state.jobs.get_mut(&id)?;

        let lease = self.leases.lease_for(job.kind());
        let until = Utc::now() + chrono::Duration::from_std(lease).unwrap_or_default();
        job.mark_leased(until, None);

        let leased = LeasedJob {
            job: job.clone(),
            token: LeaseToken::new(),
        };
        let tenant = job.tenant_id();

        state.busy_tenants.insert(tenant);
        state.leases.insert(
            id,
            Lease {
                token: leased.token,
                deadline: now + lease,
            },
        );
        Some(leased)
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new(LeasePolicy::default())
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, payload: JobPayload, lane: Lane) -> Result<JobId, QueueError> {
        payload.validate().map_err(QueueError::InvalidPayload)?;

        let job = Job::new(payload, lane);
        let id = job.id;
        {
            let mut state = self.state.lock().await;
            let seq = state.next_seq;
            state.next_seq += 1;
            state.seq.insert(id, seq);
            state.jobs.insert(id, job);
            state.push_ready(id, lane);
        }

        debug!(job_id = %id, kind = %payload.kind, lane = %lane, tenant_id = %payload.tenant_id, "job enqueued");
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn lease_next(&self, wait: Duration) -> Result<Option<LeasedJob>, QueueError> {
        let deadline = Instant::now() + wait;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent enqueue cannot be missed.
            notified.as_mut().enable();

            if let Some(leased) = self.try_lease().await {
                return Ok(Some(leased));
            }

            // Wake at the earliest lease deadline too, so expired jobs are
            // picked up without waiting for the reaper.
            let next_expiry = {
                let state = self.state.lock().await;
                state.leases.values().map(|l| l.deadline).min()
            };
            let wake_at = next_expiry.map_or(deadline, |d| d.min(deadline));

            if tokio::time::timeout_at(wake_at, notified).await.is_err() && wake_at >= deadline {
                return Ok(self.try_lease().await);
            }
        }
    }

    async fn complete(&self, leased: &LeasedJob) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock().await;
            state.release(leased)?.mark_completed();
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn fail(&self, leased: &LeasedJob, error: &str) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock().await;
            state.release(leased)?.mark_failed(error);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn reclaim_expired(&self) -> Result<usize, QueueError> {
        let reclaimed = self.state.lock().await.reclaim(Instant::now());
        if reclaimed > 0 {
            self.notify.notify_waiters();
        }
        Ok(reclaimed)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        Ok(self.state.lock().await.jobs.get(&id).cloned())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let state = self.state.lock().await;
        let mut stats = QueueStats::default();
        for job in state.jobs.values() {
            match job.status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Leased => stats.leased += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tenantforge_core::BackupId;

    const NO_WAIT: Duration = Duration::ZERO;

    fn queue() -> InMemoryJobQueue {
        InMemoryJobQueue::new(LeasePolicy::uniform(Duration::from_secs(60)))
    }

    #[tokio::test]
    async fn high_lane_is_leased_first() {
        let q = queue();
        let low = q
            .enqueue(JobPayload::backup(TenantId::new(), BackupId::new()), Lane::Low)
            .await
            .unwrap();
        let default = q
            .enqueue(JobPayload::provision(TenantId::new()), Lane::Default)
            .await
            .unwrap();
        let high = q
            .enqueue(JobPayload::restore(TenantId::new(), BackupId::new()), Lane::High)
            .await
            .unwrap();

        let order: Vec<JobId> = [
            q.lease_next(NO_WAIT).await.unwrap().unwrap().id(),
            q.lease_next(NO_WAIT).await.unwrap().unwrap().id(),
            q.lease_next(NO_WAIT).await.unwrap().unwrap().id(),
        ]
        .to_vec();
        assert_eq!(order, vec![high, default, low]);
    }

    #[tokio::test]
    async fn fifo_within_a_lane() {
        let q = queue();
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(
                q.enqueue(JobPayload::provision(TenantId::new()), Lane::Default)
                    .await
                    .unwrap(),
            );
        }

        for expected in ids {
            let leased = q.lease_next(NO_WAIT).await.unwrap().unwrap();
            assert_eq!(leased.id(), expected);
            assert_eq!(leased.attempt(), 1);
        }
        assert!(q.lease_next(NO_WAIT).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn one_job_in_flight_per_tenant() {
        let q = queue();
        let tenant = TenantId::new();
        let other = TenantId::new();

        q.enqueue(JobPayload::provision(tenant), Lane::Default).await.unwrap();
        q.enqueue(JobPayload::delete(tenant), Lane::High).await.unwrap();
        let other_job = q
            .enqueue(JobPayload::provision(other), Lane::Low)
            .await
            .unwrap();

        let first = q.lease_next(NO_WAIT).await.unwrap().unwrap();
        assert_eq!(first.payload().kind, JobKind::Delete);

        // Tenant busy: the other tenant's low-lane job jumps ahead.
        let second = q.lease_next(NO_WAIT).await.unwrap().unwrap();
        assert_eq!(second.id(), other_job);
        assert!(q.lease_next(NO_WAIT).await.unwrap().is_none());

        q.complete(&first).await.unwrap();
        let third = q.lease_next(NO_WAIT).await.unwrap().unwrap();
        assert_eq!(third.payload().kind, JobKind::Provision);
        assert_eq!(third.payload().tenant_id, tenant);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_is_redelivered_and_stale_ack_rejected() {
        let q = InMemoryJobQueue::new(LeasePolicy::uniform(Duration::from_secs(10)));
        let id = q
            .enqueue(JobPayload::provision(TenantId::new()), Lane::Default)
            .await
            .unwrap();

        let first = q.lease_next(NO_WAIT).await.unwrap().unwrap();
        assert!(q.lease_next(NO_WAIT).await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(q.reclaim_expired().await.unwrap(), 1);

        let second = q.lease_next(NO_WAIT).await.unwrap().unwrap();
        assert_eq!(second.id(), id);
        assert_eq!(second.attempt(), 2);
        assert!(second.is_redelivery());

        assert_eq!(q.complete(&first).await, Err(QueueError::LeaseLost(id)));
        q.complete(&second).await.unwrap();

        let job = q.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_leaser_picks_up_expired_lease_without_reaper() {
        let q = InMemoryJobQueue::new(LeasePolicy::uniform(Duration::from_secs(5)));
        q.enqueue(JobPayload::delete(TenantId::new()), Lane::Default)
            .await
            .unwrap();
        let _abandoned = q.lease_next(NO_WAIT).await.unwrap().unwrap();

        let redelivered = q.lease_next(Duration::from_secs(30)).await.unwrap().unwrap();
        assert_eq!(redelivered.attempt(), 2);
    }

    #[tokio::test]
    async fn blocking_lease_wakes_on_enqueue() {
        let q = Arc::new(queue());
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.lease_next(Duration::from_secs(30)).await })
        };

        tokio::task::yield_now().await;
        let id = q
            .enqueue(JobPayload::provision(TenantId::new()), Lane::Default)
            .await
            .unwrap();

        let leased = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter should wake")
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(leased.id(), id);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_lease_returns_after_wait() {
        let q = queue();
        let started = Instant::now();
        assert!(q.lease_next(Duration::from_secs(2)).await.unwrap().is_none());
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn fail_records_error_and_stats() {
        let q = queue();
        q.enqueue(JobPayload::provision(TenantId::new()), Lane::Default)
            .await
            .unwrap();
        let leased = q.lease_next(NO_WAIT).await.unwrap().unwrap();
        q.fail(&leased, "backend unavailable: down").await.unwrap();

        let job = q.get(leased.id()).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.last_error.as_deref(), Some("backend unavailable: down"));

        let stats = q.stats().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.queued, 0);
    }

    fn any_lane() -> impl Strategy<Value = Lane> {
        prop_oneof![Just(Lane::High), Just(Lane::Default), Just(Lane::Low)]
    }

    proptest! {
        #[test]
        fn lease_order_is_lane_then_fifo(lanes in prop::collection::vec(any_lane(), 1..30)) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();

            let (expected, leased) = rt.block_on(async {
                let q = queue();
                let mut enqueued = Vec::new();
                for lane in &lanes {
                    let id = q
                        .enqueue(JobPayload::provision(TenantId::new()), *lane)
                        .await
                        .unwrap();
                    enqueued.push((*lane, id));
                }
                // Stable: enqueue order survives within a lane.
                enqueued.sort_by_key(|(lane, _)| *lane);

                let mut leased = Vec::new();
                while let Some(job) = q.lease_next(NO_WAIT).await.unwrap() {
                    leased.push(job.id());
                }
                (enqueued.into_iter().map(|(_, id)| id).collect::<Vec<_>>(), leased)
            });

            prop_assert_eq!(expected, leased);
        }
    }

    #[tokio::test]
    async fn payload_without_backup_id_is_rejected() {
        let q = queue();
        let mut payload = JobPayload::restore(TenantId::new(), BackupId::new());
        payload.backup_id = None;
        assert!(matches!(
            q.enqueue(payload, Lane::High).await,
            Err(QueueError::InvalidPayload(_))
        ));
    }
}

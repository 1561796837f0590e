//! Core job types: kinds, lanes, payloads and the job record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tenantforge_core::{BackupId, TenantId, truncate_message};

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Proof of a lease. Acks carrying an older token are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseToken(pub Uuid);

impl LeaseToken {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for LeaseToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle action a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Provision,
    Delete,
    Backup,
    Restore,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Provision => "provision",
            JobKind::Delete => "delete",
            JobKind::Backup => "backup",
            JobKind::Restore => "restore",
        }
    }

    /// Lane used when the caller does not pick one.
    pub fn default_lane(self) -> Lane {
        match self {
            JobKind::Provision | JobKind::Delete => Lane::Default,
            JobKind::Backup => Lane::Low,
            JobKind::Restore => Lane::High,
        }
    }

    pub fn requires_backup_id(self) -> bool {
        matches!(self, JobKind::Backup | JobKind::Restore)
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provision" => Ok(JobKind::Provision),
            "delete" => Ok(JobKind::Delete),
            "backup" => Ok(JobKind::Backup),
            "restore" => Ok(JobKind::Restore),
            other => Err(format!("unknown job kind: {other}")),
        }
    }
}

/// Priority lane. Strictly ordered: every ready `High` job is leased before
/// any `Default` job, and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    High,
    Default,
    Low,
}

impl Lane {
    /// Lanes in lease order.
    pub const ALL: [Lane; 3] = [Lane::High, Lane::Default, Lane::Low];

    pub fn as_str(self) -> &'static str {
        match self {
            Lane::High => "high",
            Lane::Default => "default",
            Lane::Low => "low",
        }
    }

    /// Lower ranks are leased first.
    pub fn rank(self) -> i16 {
        match self {
            Lane::High => 0,
            Lane::Default => 1,
            Lane::Low => 2,
        }
    }
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Lane {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Lane::ALL
            .into_iter()
            .find(|lane| lane.as_str() == s)
            .ok_or_else(|| format!("unknown lane: {s}"))
    }
}

/// What gets submitted to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    pub kind: JobKind,
    pub tenant_id: TenantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<BackupId>,
}

impl JobPayload {
    pub fn provision(tenant_id: TenantId) -> Self {
        Self {
            kind: JobKind::Provision,
            tenant_id,
            backup_id: None,
        }
    }

    pub fn delete(tenant_id: TenantId) -> Self {
        Self {
            kind: JobKind::Delete,
            tenant_id,
            backup_id: None,
        }
    }

    pub fn backup(tenant_id: TenantId, backup_id: BackupId) -> Self {
        Self {
            kind: JobKind::Backup,
            tenant_id,
            backup_id: Some(backup_id),
        }
    }

    pub fn restore(tenant_id: TenantId, backup_id: BackupId) -> Self {
        Self {
            kind: JobKind::Restore,
            tenant_id,
            backup_id: Some(backup_id),
        }
    }

    /// Reject payloads missing a required backup id.
    pub fn validate(&self) -> Result<(), String> {
        if self.kind.requires_backup_id() && self.backup_id.is_none() {
            return Err(format!("{} job requires a backup_id", self.kind));
        }
        Ok(())
    }
}

/// Job status as tracked by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Leased,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Leased => "leased",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "leased" => Ok(JobStatus::Leased),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// A lifecycle job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub payload: JobPayload,
    pub lane: Lane,
    pub status: JobStatus,
    /// Number of times the job has been leased (1 on first delivery).
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Deadline of the current lease, while leased.
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub leased_by: Option<String>,
    pub last_error: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(payload: JobPayload, lane: Lane) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            payload,
            lane,
            status: JobStatus::Queued,
            attempts: 0,
            enqueued_at: now,
            updated_at: now,
            lease_expires_at: None,
            leased_by: None,
            last_error: None,
            finished_at: None,
        }
    }

    pub fn tenant_id(&self) -> TenantId {
        self.payload.tenant_id
    }

    pub fn kind(&self) -> JobKind {
        self.payload.kind
    }

    pub(crate) fn mark_leased(&mut self, until: DateTime<Utc>, worker: Option<&str>) {
        let now = Utc::now();
        self.status = JobStatus::Leased;
        self.attempts += 1;
        self.lease_expires_at = Some(until);
        self.leased_by = worker.map(str::to_string);
        self.updated_at = now;
    }

    /// Lease expired without an ack: visible again.
    pub(crate) fn mark_requeued(&mut self) {
        self.status = JobStatus::Queued;
        self.lease_expires_at = None;
        self.leased_by = None;
        self.last_error = Some("lease expired".to_string());
        self.updated_at = Utc::now();
    }

    pub(crate) fn mark_completed(&mut self) {
        let now = Utc::now();
        self.status = JobStatus::Completed;
        self.lease_expires_at = None;
        self.finished_at = Some(now);
        self.updated_at = now;
    }

    pub(crate) fn mark_failed(&mut self, error: &str) {
        let now = Utc::now();
        self.status = JobStatus::Failed;
        self.lease_expires_at = None;
        self.last_error = Some(truncate_message(error));
        self.finished_at = Some(now);
        self.updated_at = now;
    }
}

/// A job held by one worker under a lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeasedJob {
    pub job: Job,
    pub token: LeaseToken,
}

impl LeasedJob {
    pub fn id(&self) -> JobId {
        self.job.id
    }

    pub fn payload(&self) -> &JobPayload {
        &self.job.payload
    }

    /// 1 on first delivery, higher on lease-expiry redelivery.
    pub fn attempt(&self) -> u32 {
        self.job.attempts
    }

    pub fn is_redelivery(&self) -> bool {
        self.job.attempts > 1
    }
}

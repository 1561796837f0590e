//! Backup records and their monotonic status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{BackupId, TenantId};

/// Longest error message kept on a backup or tenant record.
pub const MAX_ERROR_MESSAGE_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl BackupStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BackupStatus::Pending => "pending",
            BackupStatus::InProgress => "in_progress",
            BackupStatus::Completed => "completed",
            BackupStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BackupStatus::Completed | BackupStatus::Failed)
    }

    /// Status only moves forward: PENDING -> IN_PROGRESS -> {COMPLETED, FAILED},
    /// with PENDING -> FAILED for jobs rejected before they start.
    pub fn can_advance_to(self, next: BackupStatus) -> bool {
        use BackupStatus::*;

        matches!(
            (self, next),
            (Pending, InProgress) | (Pending, Failed) | (InProgress, Completed) | (InProgress, Failed)
        )
    }
}

impl core::fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for BackupStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BackupStatus::Pending),
            "in_progress" => Ok(BackupStatus::InProgress),
            "completed" => Ok(BackupStatus::Completed),
            "failed" => Ok(BackupStatus::Failed),
            other => Err(DomainError::validation(format!("unknown backup status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    #[default]
    Full,
}

impl BackupType {
    pub fn as_str(self) -> &'static str {
        match self {
            BackupType::Full => "full",
        }
    }
}

/// A backup of one tenant database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: BackupId,
    pub tenant_id: TenantId,
    pub backup_type: BackupType,
    pub status: BackupStatus,
    pub file_path: Option<String>,
    pub file_size_bytes: Option<u64>,
    /// Hex-encoded SHA-256 of the archive.
    pub checksum: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
}

impl BackupRecord {
    pub fn pending(tenant_id: TenantId, now: DateTime<Utc>) -> Self {
        Self {
            id: BackupId::new(),
            tenant_id,
            backup_type: BackupType::Full,
            status: BackupStatus::Pending,
            file_path: None,
            file_size_bytes: None,
            checksum: None,
            started_at: None,
            completed_at: None,
            error_message: None,
            retry_count: 0,
            created_at: now,
        }
    }

    fn advance(&mut self, next: BackupStatus) -> DomainResult<()> {
        if !self.status.can_advance_to(next) {
            return Err(DomainError::StatusRegression(format!(
                "backup {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    pub fn mark_in_progress(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.advance(BackupStatus::InProgress)?;
        self.started_at = Some(now);
        Ok(())
    }

    pub fn mark_completed(
        &mut self,
        file_path: String,
        file_size_bytes: u64,
        checksum: String,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.advance(BackupStatus::Completed)?;
        self.file_path = Some(file_path);
        self.file_size_bytes = Some(file_size_bytes);
        self.checksum = Some(checksum);
        self.completed_at = Some(now);
        Ok(())
    }

    pub fn mark_failed(&mut self, error: &str, now: DateTime<Utc>) -> DomainResult<()> {
        self.advance(BackupStatus::Failed)?;
        self.error_message = Some(truncate_message(error));
        self.completed_at = Some(now);
        Ok(())
    }
}

/// Truncate to [`MAX_ERROR_MESSAGE_CHARS`] characters (never splits a code point).
pub fn truncate_message(message: &str) -> String {
    message.chars().take(MAX_ERROR_MESSAGE_CHARS).collect()
}

//! # Job State Machine
//!
//! Durable units of background work and their lifecycle.
//!
//! ## State Machine
//!
//! ```text
//! Pending → Running → Completed
//!     ↓         ↓
//!     ├────────┴──→ Failed
//!     └────────┴──→ Cancelled
//! ```
//!
//! `Pending → Failed` only happens when a job cannot be queued at all.
//!
//! Terminal states have no outgoing transitions. The only way back to
//! `Pending` is a resume after a restart, which is not a transition of the
//! state machine but a reset performed by the job manager before any worker
//! has seen the job in the new process.
//!
//! Progress is a percentage that never decreases while the job is running.

use crate::{Result, SyncError};
use bridge_traits::OwnerId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// ID Types
// ============================================================================

/// Unique identifier for a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a job ID from a string
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not a valid UUID
    pub fn from_string(s: &str) -> Result<Self> {
        Ok(Self(
            Uuid::parse_str(s).map_err(|e| SyncError::InvalidJobId(e.to_string()))?,
        ))
    }

    pub fn as_str(&self) -> String {
        self.0.to_string()
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

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

// ============================================================================
// Status Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Persisted, waiting for a worker
    Pending,
    /// Claimed by a worker
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        matches!(
            (self, to),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Failed)
                | (JobStatus::Pending, JobStatus::Cancelled)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Cancelled)
        )
    }

    /// Validate a state transition
    pub fn validate_transition(&self, to: JobStatus) -> Result<()> {
        if self.can_transition_to(to) {
            return Ok(());
        }

        Err(SyncError::InvalidStateTransition {
            from: self.as_str().to_string(),
            to: to.as_str().to_string(),
            reason: if self.is_terminal() {
                format!("{} is a terminal state", self.as_str())
            } else {
                format!("Cannot transition from {} to {}", self.as_str(), to.as_str())
            },
        })
    }
}

impl FromStr for JobStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            _ => Err(SyncError::InvalidStatus(s.to_string())),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The closed set of job kinds, each bound to one processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Discover, mirror and match everything the owner can access
    FullSync,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::FullSync => "full_sync",
        }
    }

    /// At most one non-terminal job of this type per owner.
    pub fn is_exclusive_per_owner(&self) -> bool {
        matches!(self, JobType::FullSync)
    }

    pub fn requires_owner(&self) -> bool {
        matches!(self, JobType::FullSync)
    }
}

impl FromStr for JobType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "full_sync" => Ok(JobType::FullSync),
            _ => Err(SyncError::InvalidJobType(s.to_string())),
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Progress Types
// ============================================================================

/// Item counters reported by a processor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounters {
    pub total: u64,
    pub processed: u64,
    pub successful: u64,
    pub failed: u64,
}

/// A partial progress update. Never changes status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// 0-100; lower values than the stored one are ignored
    pub progress: u8,
    pub step: String,
    pub counters: Option<JobCounters>,
}

impl ProgressUpdate {
    pub fn new(progress: u8, step: impl Into<String>) -> Self {
        Self {
            progress: progress.min(100),
            step: step.into(),
            counters: None,
        }
    }

    pub fn with_counters(mut self, counters: JobCounters) -> Self {
        self.counters = Some(counters);
        self
    }
}

// ============================================================================
// Job Entity
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    pub owner_id: Option<OwnerId>,
    pub status: JobStatus,
    /// Percentage, 0-100
    pub progress: u8,
    pub current_step: String,
    pub counters: JobCounters,
    pub error_message: Option<String>,
    /// Opaque key/value bag supplied by the caller
    pub metadata: Map<String, Value>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub updated_at: i64,
}

impl Job {
    /// Create a new job in pending state
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Validation`] when the job type needs an owner and
    /// none is given.
    pub fn new(
        job_type: JobType,
        owner_id: Option<OwnerId>,
        metadata: Map<String, Value>,
        now: i64,
    ) -> Result<Self> {
        if job_type.requires_owner() && owner_id.is_none() {
            return Err(SyncError::Validation(format!(
                "{} jobs require an owner",
                job_type
            )));
        }

        Ok(Self {
            id: JobId::new(),
            job_type,
            owner_id,
            status: JobStatus::Pending,
            progress: 0,
            current_step: "Queued".to_string(),
            counters: JobCounters::default(),
            error_message: None,
            metadata,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Seconds between start and completion
    pub fn duration_secs(&self) -> Option<u64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) if end >= start => Some((end - start) as u64),
            _ => None,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

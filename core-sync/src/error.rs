use core_library::LibraryError;
use core_metadata::MetadataError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("A full sync is already in progress for owner {owner_id}")]
    Conflict { owner_id: i64 },

    #[error("Job {job_id} not found")]
    JobNotFound { job_id: String },

    #[error("Invalid job ID: {0}")]
    InvalidJobId(String),

    #[error("Invalid job status: {0}")]
    InvalidStatus(String),

    #[error("Invalid job type: {0}")]
    InvalidJobType(String),

    #[error("Invalid state transition from {from} to {to}: {reason}")]
    InvalidStateTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Missing credentials: {0}")]
    MissingCredentials(String),

    #[error("Discovery failed: {0}")]
    Discovery(String),

    #[error("Job cancelled")]
    Cancelled,

    #[error("Job timed out after {0} seconds")]
    Timeout(u64),

    #[error("Job queue is full")]
    QueueFull,

    #[error("Job manager is not running")]
    NotRunning,

    #[error("Processor error: {0}")]
    Processor(String),

    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("Library error: {0}")]
    Library(#[from] LibraryError),

    #[error("Database error: {0}")]
    Database(String),
}

/// Coarse classification surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Conflict,
    NotFound,
    /// Worth retrying later.
    Transient,
    Permanent,
    Internal,
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Validation(_)
            | SyncError::InvalidJobId(_)
            | SyncError::InvalidJobType(_)
            | SyncError::InvalidStatus(_) => ErrorKind::Validation,
            SyncError::Conflict { .. } | SyncError::InvalidStateTransition { .. } => {
                ErrorKind::Conflict
            }
            SyncError::JobNotFound { .. } => ErrorKind::NotFound,
            SyncError::Library(LibraryError::NotFound { .. }) => ErrorKind::NotFound,
            SyncError::Library(LibraryError::InvalidInput { .. }) => ErrorKind::Validation,
            SyncError::Timeout(_) | SyncError::QueueFull => ErrorKind::Transient,
            SyncError::Metadata(e) => match e {
                MetadataError::QueueFull | MetadataError::Timeout(_) => ErrorKind::Transient,
                MetadataError::RetriesExhausted { .. } => ErrorKind::Transient,
                MetadataError::Provider(_) if e.is_transient() => ErrorKind::Transient,
                MetadataError::Library(_) => ErrorKind::Internal,
                _ => ErrorKind::Permanent,
            },
            SyncError::MissingCredentials(_)
            | SyncError::Discovery(_)
            | SyncError::Cancelled
            | SyncError::Processor(_) => ErrorKind::Permanent,
            SyncError::NotRunning | SyncError::Library(_) | SyncError::Database(_) => {
                ErrorKind::Internal
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            SyncError::Cancelled | SyncError::Metadata(MetadataError::Cancelled)
        )
    }
}

pub(crate) fn db_error(e: sqlx::Error) -> SyncError {
    SyncError::Database(e.to_string())
}

pub type Result<T> = std::result::Result<T, SyncError>;

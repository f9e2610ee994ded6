//! # Job Repository
//!
//! Durable job rows in the `jobs` table.
//!
//! ## Overview
//!
//! Every status change is a conditional update on the expected current
//! status, so a stale writer can never move a job backwards:
//! - `mark_running` only claims `pending` rows
//! - `finish` only closes `running` rows
//! - `cancel` only touches `pending` or `running` rows
//! - `update_progress` only touches `running` rows and never lowers progress
//!
//! The partial unique index on `(owner_id, job_type)` for active full syncs
//! turns a racing second insert into [`SyncError::Conflict`].

use crate::error::db_error;
use crate::{Job, JobCounters, JobId, JobStatus, JobType, ProgressUpdate, Result, SyncError};
use async_trait::async_trait;
use bridge_traits::OwnerId;
use serde_json::{Map, Value};
use sqlx::{FromRow, SqlitePool};

/// How a running job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed(JobCounters),
    Failed(String),
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Completed(_) => JobStatus::Completed,
            JobOutcome::Failed(_) => JobStatus::Failed,
        }
    }
}

// ============================================================================
// Repository Trait
// ============================================================================

#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Persist a new job
    ///
    /// # Errors
    ///
    /// [`SyncError::Conflict`] when the owner already has an active job of an
    /// exclusive type.
    async fn insert(&self, job: &Job) -> Result<()>;

    async fn find_by_id(&self, id: &JobId) -> Result<Option<Job>>;

    /// Most recent first.
    async fn find_by_owner(&self, owner: OwnerId, limit: u32) -> Result<Vec<Job>>;

    /// Whether the owner has a pending or running job of this type.
    async fn has_active(&self, owner: OwnerId, job_type: JobType) -> Result<bool>;

    /// Apply a progress update to a running job. Returns false when the job
    /// is not running.
    async fn update_progress(&self, id: &JobId, update: &ProgressUpdate, now: i64)
        -> Result<bool>;

    /// Claim a pending job. Returns the updated job, or `None` if it was no
    /// longer pending.
    async fn mark_running(&self, id: &JobId, now: i64) -> Result<Option<Job>>;

    /// Close a running job. Returns the finished job, or `None` when it was
    /// not running (for example, cancelled meanwhile).
    async fn finish(&self, id: &JobId, outcome: &JobOutcome, now: i64) -> Result<Option<Job>>;

    /// Fail a job that never started (queue full).
    async fn fail_pending(&self, id: &JobId, message: &str, now: i64) -> Result<bool>;

    /// Cancel a pending or running job. Returns false when it was terminal.
    async fn cancel(&self, id: &JobId, now: i64) -> Result<bool>;

    /// Jobs left pending or running, oldest first.
    async fn find_resumable(&self) -> Result<Vec<Job>>;

    /// Put an interrupted job back to pending with its progress cleared.
    async fn reset_to_pending(&self, id: &JobId, now: i64) -> Result<bool>;

    /// Physically delete terminal jobs completed before `cutoff`.
    async fn delete_terminal_before(&self, cutoff: i64) -> Result<u64>;
}

// ============================================================================
// SQLite Implementation
// ============================================================================

pub struct SqliteJobRepository {
    pool: SqlitePool,
}

impl SqliteJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct JobRow {
    id: String,
    job_type: String,
    owner_id: Option<i64>,
    status: String,
    progress: i64,
    current_step: String,
    total_items: i64,
    processed_items: i64,
    successful_items: i64,
    failed_items: i64,
    error_message: Option<String>,
    metadata: String,
    created_at: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
    updated_at: i64,
}

impl TryFrom<JobRow> for Job {
    type Error = SyncError;

    fn try_from(row: JobRow) -> Result<Self> {
        let metadata: Map<String, Value> = serde_json::from_str(&row.metadata)
            .map_err(|e| SyncError::Database(format!("Invalid job metadata: {}", e)))?;

        Ok(Job {
            id: JobId::from_string(&row.id)?,
            job_type: row.job_type.parse()?,
            owner_id: row.owner_id.map(OwnerId),
            status: row.status.parse()?,
            progress: row.progress.clamp(0, 100) as u8,
            current_step: row.current_step,
            counters: JobCounters {
                total: row.total_items.max(0) as u64,
                processed: row.processed_items.max(0) as u64,
                successful: row.successful_items.max(0) as u64,
                failed: row.failed_items.max(0) as u64,
            },
            error_message: row.error_message,
            metadata,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            updated_at: row.updated_at,
        })
    }
}

#[async_trait]
impl JobRepository for SqliteJobRepository {
    async fn insert(&self, job: &Job) -> Result<()> {
        let metadata = serde_json::to_string(&job.metadata)
            .map_err(|e| SyncError::Validation(format!("Invalid job metadata: {}", e)))?;

        let result = sqlx::query(
            r#"
            INSERT INTO jobs (
                id, job_type, owner_id, status, progress, current_step,
                total_items, processed_items, successful_items, failed_items,
                error_message, metadata, created_at, started_at, completed_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job.id.as_str())
        .bind(job.job_type.as_str())
        .bind(job.owner_id.map(|o| o.as_i64()))
        .bind(job.status.as_str())
        .bind(job.progress as i64)
        .bind(&job.current_step)
        .bind(job.counters.total as i64)
        .bind(job.counters.processed as i64)
        .bind(job.counters.successful as i64)
        .bind(job.counters.failed as i64)
        .bind(&job.error_message)
        .bind(metadata)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(SyncError::Conflict {
                    owner_id: job.owner_id.map(|o| o.as_i64()).unwrap_or_default(),
                })
            }
            Err(e) => Err(db_error(e)),
        }
    }

    async fn find_by_id(&self, id: &JobId) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        row.map(Job::try_from).transpose()
    }

    async fn find_by_owner(&self, owner: OwnerId, limit: u32) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT * FROM jobs
            WHERE owner_id = ?
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(owner.as_i64())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.into_iter()
            .map(Job::try_from)
            .collect::<Result<Vec<_>>>()
    }

    async fn has_active(&self, owner: OwnerId, job_type: JobType) -> Result<bool> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM jobs
            WHERE owner_id = ? AND job_type = ? AND status IN ('pending', 'running')
            "#,
        )
        .bind(owner.as_i64())
        .bind(job_type.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(count > 0)
    }

    async fn update_progress(
        &self,
        id: &JobId,
        update: &ProgressUpdate,
        now: i64,
    ) -> Result<bool> {
        let counters = update.counters;
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                progress = MAX(progress, ?),
                current_step = ?,
                total_items = COALESCE(?, total_items),
                processed_items = COALESCE(?, processed_items),
                successful_items = COALESCE(?, successful_items),
                failed_items = COALESCE(?, failed_items),
                updated_at = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(update.progress.min(100) as i64)
        .bind(&update.step)
        .bind(counters.map(|c| c.total as i64))
        .bind(counters.map(|c| c.processed as i64))
        .bind(counters.map(|c| c.successful as i64))
        .bind(counters.map(|c| c.failed as i64))
        .bind(now)
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_running(&self, id: &JobId, now: i64) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs SET
                status = 'running', started_at = ?, current_step = 'Starting', updated_at = ?
            WHERE id = ? AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.map(Job::try_from).transpose()
    }

    async fn finish(&self, id: &JobId, outcome: &JobOutcome, now: i64) -> Result<Option<Job>> {
        let row = match outcome {
            JobOutcome::Completed(counters) => {
                sqlx::query_as::<_, JobRow>(
                    r#"
                    UPDATE jobs SET
                        status = 'completed', progress = 100, current_step = 'Completed',
                        total_items = ?, processed_items = ?,
                        successful_items = ?, failed_items = ?,
                        completed_at = ?, updated_at = ?
                    WHERE id = ? AND status = 'running'
                    RETURNING *
                    "#,
                )
                .bind(counters.total as i64)
                .bind(counters.processed as i64)
                .bind(counters.successful as i64)
                .bind(counters.failed as i64)
                .bind(now)
                .bind(now)
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await
            }
            JobOutcome::Failed(message) => {
                sqlx::query_as::<_, JobRow>(
                    r#"
                    UPDATE jobs SET
                        status = 'failed', current_step = 'Failed', error_message = ?,
                        completed_at = ?, updated_at = ?
                    WHERE id = ? AND status = 'running'
                    RETURNING *
                    "#,
                )
                .bind(message)
                .bind(now)
                .bind(now)
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await
            }
        }
        .map_err(db_error)?;

        row.map(Job::try_from).transpose()
    }

    async fn fail_pending(&self, id: &JobId, message: &str, now: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                status = 'failed', current_step = 'Failed', error_message = ?,
                completed_at = ?, updated_at = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(message)
        .bind(now)
        .bind(now)
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn cancel(&self, id: &JobId, now: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                status = 'cancelled', current_step = 'Cancelled', completed_at = ?, updated_at = ?
            WHERE id = ? AND status IN ('pending', 'running')
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_resumable(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT * FROM jobs
            WHERE status IN ('pending', 'running')
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.into_iter()
            .map(Job::try_from)
            .collect::<Result<Vec<_>>>()
    }

    async fn reset_to_pending(&self, id: &JobId, now: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                status = 'pending', progress = 0, current_step = 'Resumed',
                total_items = 0, processed_items = 0, successful_items = 0, failed_items = 0,
                started_at = NULL, updated_at = ?
            WHERE id = ? AND status IN ('pending', 'running')
            "#,
        )
        .bind(now)
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_terminal_before(&self, cutoff: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE status IN ('completed', 'failed', 'cancelled')
              AND COALESCE(completed_at, updated_at) < ?
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected())
    }
}

// ============================================================================
// Tests
// ============================================================================

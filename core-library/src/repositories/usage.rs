//! Rate limiter usage counter
//!
//! A single row of running totals. Written after calls complete, never on the
//! limiter's dispatch path.

use crate::error::Result;
use crate::models::RateLimiterUsage;
use async_trait::async_trait;
use sqlx::{query_as, SqlitePool};

#[async_trait]
pub trait UsageRepository: Send + Sync {
    async fn record(&self, requests: u64, retries: u64, failures: u64, now: i64) -> Result<()>;

    async fn get(&self) -> Result<RateLimiterUsage>;
}

pub struct SqliteUsageRepository {
    pool: SqlitePool,
}

impl SqliteUsageRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UsageRepository for SqliteUsageRepository {
    async fn record(&self, requests: u64, retries: u64, failures: u64, now: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO rate_limiter_usage (
                id, total_requests, total_retries, total_failures, last_request_at
            ) VALUES (1, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                total_requests = total_requests + excluded.total_requests,
                total_retries = total_retries + excluded.total_retries,
                total_failures = total_failures + excluded.total_failures,
                last_request_at = excluded.last_request_at
            "#,
        )
        .bind(requests as i64)
        .bind(retries as i64)
        .bind(failures as i64)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self) -> Result<RateLimiterUsage> {
        let usage = query_as::<_, RateLimiterUsage>(
            "SELECT total_requests, total_retries, total_failures, last_request_at \
             FROM rate_limiter_usage WHERE id = 1",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(usage)
    }
}

//! User access grant repository

use crate::error::Result;
use crate::models::UserAccessGrant;
use async_trait::async_trait;
use bridge_traits::OwnerId;
use sqlx::{query_as, SqlitePool};

#[async_trait]
pub trait AccessGrantRepository: Send + Sync {
    /// Create or re-verify the owner's grant on a library.
    async fn grant(&self, owner: OwnerId, library_id: i64, now: i64) -> Result<UserAccessGrant>;

    async fn find_by_owner(&self, owner: OwnerId) -> Result<Vec<UserAccessGrant>>;

    /// Deactivate active grants last verified before `verified_before`.
    async fn deactivate_stale(&self, verified_before: i64, now: i64) -> Result<u64>;
}

pub struct SqliteAccessGrantRepository {
    pool: SqlitePool,
}

impl SqliteAccessGrantRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccessGrantRepository for SqliteAccessGrantRepository {
    async fn grant(&self, owner: OwnerId, library_id: i64, now: i64) -> Result<UserAccessGrant> {
        let row = query_as::<_, UserAccessGrant>(
            r#"
            INSERT INTO user_library_access (
                owner_id, library_id, is_active, last_verified_at, created_at, updated_at
            ) VALUES (?, ?, 1, ?, ?, ?)
            ON CONFLICT (owner_id, library_id) DO UPDATE SET
                is_active = 1,
                last_verified_at = excluded.last_verified_at,
                updated_at = excluded.updated_at
            RETURNING *
            "#,
        )
        .bind(owner.as_i64())
        .bind(library_id)
        .bind(now)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn find_by_owner(&self, owner: OwnerId) -> Result<Vec<UserAccessGrant>> {
        let rows = query_as::<_, UserAccessGrant>(
            "SELECT * FROM user_library_access WHERE owner_id = ? ORDER BY library_id",
        )
        .bind(owner.as_i64())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn deactivate_stale(&self, verified_before: i64, now: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE user_library_access SET is_active = 0, updated_at = ?
            WHERE is_active = 1 AND last_verified_at < ?
            "#,
        )
        .bind(now)
        .bind(verified_before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

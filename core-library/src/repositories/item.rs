//! External library item repository
//!
//! Items are keyed by (library, native key). Every write is an upsert, so
//! re-running a sync over the same catalog converges to the same rows.

use crate::error::Result;
use crate::models::{ExternalLibraryItem, ItemUpsert};
use async_trait::async_trait;
use bridge_traits::OwnerId;
use sqlx::{query_as, QueryBuilder, Sqlite, SqlitePool};

#[async_trait]
pub trait ItemRepository: Send + Sync {
    /// Insert or refresh an item and mark it seen at `now`.
    ///
    /// When the item's GUID changed since the last sync, its previous match
    /// and attempt counter are discarded.
    async fn upsert(&self, item: &ItemUpsert, now: i64) -> Result<ExternalLibraryItem>;

    async fn find_by_id(&self, id: i64) -> Result<Option<ExternalLibraryItem>>;

    async fn find_by_library(&self, library_id: i64) -> Result<Vec<ExternalLibraryItem>>;

    /// Active, unmatched items in the owner's accessible libraries whose
    /// attempt counter is below `max_attempts`.
    async fn find_matchable(
        &self,
        owner: OwnerId,
        max_attempts: u32,
    ) -> Result<Vec<ExternalLibraryItem>>;

    async fn set_match(&self, item_id: i64, metadata_id: i64, now: i64) -> Result<()>;

    /// Count one failed resolution attempt.
    async fn record_failed_match(&self, item_id: i64, now: i64) -> Result<()>;

    /// Mark active items of the given libraries inactive when they were last
    /// seen before `seen_before`. Returns the number of items deactivated.
    async fn deactivate_unseen(&self, library_ids: &[i64], seen_before: i64) -> Result<u64>;

    /// Delete items whose library has no active access grant.
    async fn delete_without_active_grant(&self) -> Result<u64>;

    /// Deactivate unmatched items that used up their attempts.
    async fn deactivate_exhausted(&self, max_attempts: u32, now: i64) -> Result<u64>;
}

pub struct SqliteItemRepository {
    pool: SqlitePool,
}

impl SqliteItemRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ItemRepository for SqliteItemRepository {
    async fn upsert(&self, item: &ItemUpsert, now: i64) -> Result<ExternalLibraryItem> {
        item.validate()?;
        let alternate_guids = serde_json::to_string(&item.alternate_guids)?;

        // In an UPDATE every column reference sees the pre-update row, so the
        // CASE expressions compare against the stored GUID.
        let row = query_as::<_, ExternalLibraryItem>(
            r#"
            INSERT INTO external_library_items (
                library_id, native_key, guid, alternate_guids, title, year, kind,
                is_active, last_seen_at, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?)
            ON CONFLICT (library_id, native_key) DO UPDATE SET
                metadata_id = CASE WHEN guid = excluded.guid THEN metadata_id ELSE NULL END,
                matching_attempts =
                    CASE WHEN guid = excluded.guid THEN matching_attempts ELSE 0 END,
                guid = excluded.guid,
                alternate_guids = excluded.alternate_guids,
                title = excluded.title,
                year = excluded.year,
                kind = excluded.kind,
                is_active = 1,
                last_seen_at = excluded.last_seen_at,
                updated_at = excluded.updated_at
            RETURNING *
            "#,
        )
        .bind(item.library_id)
        .bind(&item.native_key)
        .bind(&item.guid)
        .bind(alternate_guids)
        .bind(&item.title)
        .bind(item.year)
        .bind(item.kind.as_str())
        .bind(now)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<ExternalLibraryItem>> {
        let row = query_as::<_, ExternalLibraryItem>(
            "SELECT * FROM external_library_items WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn find_by_library(&self, library_id: i64) -> Result<Vec<ExternalLibraryItem>> {
        let rows = query_as::<_, ExternalLibraryItem>(
            "SELECT * FROM external_library_items WHERE library_id = ? ORDER BY id",
        )
        .bind(library_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn find_matchable(
        &self,
        owner: OwnerId,
        max_attempts: u32,
    ) -> Result<Vec<ExternalLibraryItem>> {
        let rows = query_as::<_, ExternalLibraryItem>(
            r#"
            SELECT i.* FROM external_library_items i
            JOIN user_library_access a ON a.library_id = i.library_id
            WHERE a.owner_id = ?
              AND a.is_active = 1
              AND i.is_active = 1
              AND i.metadata_id IS NULL
              AND i.matching_attempts < ?
            ORDER BY i.matching_attempts ASC, i.id ASC
            "#,
        )
        .bind(owner.as_i64())
        .bind(max_attempts as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn set_match(&self, item_id: i64, metadata_id: i64, now: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE external_library_items
            SET metadata_id = ?, last_matched_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(metadata_id)
        .bind(now)
        .bind(now)
        .bind(item_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_failed_match(&self, item_id: i64, now: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE external_library_items
            SET matching_attempts = matching_attempts + 1, last_matched_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(item_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn deactivate_unseen(&self, library_ids: &[i64], seen_before: i64) -> Result<u64> {
        if library_ids.is_empty() {
            return Ok(0);
        }

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "UPDATE external_library_items SET is_active = 0, updated_at = ",
        );
        builder.push_bind(seen_before);
        builder.push(" WHERE is_active = 1 AND last_seen_at < ");
        builder.push_bind(seen_before);
        builder.push(" AND library_id IN (");
        let mut separated = builder.separated(", ");
        for id in library_ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn delete_without_active_grant(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM external_library_items
            WHERE library_id NOT IN (
                SELECT library_id FROM user_library_access WHERE is_active = 1
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn deactivate_exhausted(&self, max_attempts: u32, now: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE external_library_items
            SET is_active = 0, updated_at = ?
            WHERE is_active = 1 AND metadata_id IS NULL AND matching_attempts >= ?
            "#,
        )
        .bind(now)
        .bind(max_attempts as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

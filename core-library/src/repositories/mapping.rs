//! External ID mapping cache repository

use crate::error::Result;
use crate::models::{ExternalIdMapping, MappingUpsert};
use async_trait::async_trait;
use sqlx::{query_as, SqlitePool};

#[async_trait]
pub trait MappingRepository: Send + Sync {
    /// Most recently confirmed mapping for a GUID.
    async fn find_by_guid(&self, guid: &str) -> Result<Option<ExternalIdMapping>>;

    /// Record a resolution. Re-resolving a GUID updates its existing row
    /// instead of adding a second one.
    async fn upsert(&self, mapping: &MappingUpsert, now: i64) -> Result<ExternalIdMapping>;

    /// Delete mappings no active item refers to by GUID.
    async fn delete_orphans(&self) -> Result<u64>;

    async fn count(&self) -> Result<i64>;
}

pub struct SqliteMappingRepository {
    pool: SqlitePool,
}

impl SqliteMappingRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MappingRepository for SqliteMappingRepository {
    async fn find_by_guid(&self, guid: &str) -> Result<Option<ExternalIdMapping>> {
        let row = query_as::<_, ExternalIdMapping>(
            "SELECT * FROM external_id_mappings WHERE guid = ? ORDER BY updated_at DESC, id DESC LIMIT 1",
        )
        .bind(guid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn upsert(&self, mapping: &MappingUpsert, now: i64) -> Result<ExternalIdMapping> {
        let mut tx = self.pool.begin().await?;

        let updated = query_as::<_, ExternalIdMapping>(
            r#"
            UPDATE external_id_mappings SET
                metadata_id = ?, title = ?, year = ?,
                native_key = COALESCE(?, native_key),
                match_strategy = ?, updated_at = ?
            WHERE id = (
                SELECT id FROM external_id_mappings WHERE guid = ?
                ORDER BY updated_at DESC, id DESC LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(mapping.metadata_id)
        .bind(&mapping.title)
        .bind(mapping.year)
        .bind(&mapping.native_key)
        .bind(&mapping.match_strategy)
        .bind(now)
        .bind(&mapping.guid)
        .fetch_optional(&mut *tx)
        .await?;

        let row = match updated {
            Some(row) => row,
            None => {
                query_as::<_, ExternalIdMapping>(
                    r#"
                    INSERT INTO external_id_mappings (
                        guid, metadata_id, title, year, native_key, match_strategy,
                        created_at, updated_at
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT (guid, metadata_id) DO UPDATE SET
                        title = excluded.title,
                        year = excluded.year,
                        match_strategy = excluded.match_strategy,
                        updated_at = excluded.updated_at
                    RETURNING *
                    "#,
                )
                .bind(&mapping.guid)
                .bind(mapping.metadata_id)
                .bind(&mapping.title)
                .bind(mapping.year)
                .bind(&mapping.native_key)
                .bind(&mapping.match_strategy)
                .bind(now)
                .bind(now)
                .fetch_one(&mut *tx)
                .await?
            }
        };

        tx.commit().await?;
        Ok(row)
    }

    async fn delete_orphans(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM external_id_mappings
            WHERE NOT EXISTS (
                SELECT 1 FROM external_library_items i
                WHERE i.guid = external_id_mappings.guid AND i.is_active = 1
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn count(&self) -> Result<i64> {
        let (count,): (i64,) = query_as("SELECT COUNT(*) FROM external_id_mappings")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

//! External library repository

use crate::error::Result;
use crate::models::{ExternalLibrary, LibraryUpsert};
use async_trait::async_trait;
use bridge_traits::OwnerId;
use sqlx::{query_as, SqlitePool};

#[async_trait]
pub trait LibraryRepository: Send + Sync {
    /// Insert or update a library keyed by (server, library key).
    async fn upsert(&self, library: &LibraryUpsert, now: i64) -> Result<ExternalLibrary>;

    async fn find_by_id(&self, id: i64) -> Result<Option<ExternalLibrary>>;

    async fn find_by_server(&self, server_id: i64) -> Result<Vec<ExternalLibrary>>;

    /// Libraries the owner holds an active grant for.
    async fn find_accessible(&self, owner: OwnerId) -> Result<Vec<ExternalLibrary>>;

    /// Recount active items of one library, store and return the count.
    async fn refresh_item_count(&self, library_id: i64, now: i64) -> Result<i64>;

    async fn mark_synced(&self, library_id: i64, now: i64) -> Result<()>;

    /// Recount every library whose cached count drifted. Returns the number
    /// of libraries updated.
    async fn recompute_item_counts(&self) -> Result<u64>;
}

pub struct SqliteLibraryRepository {
    pool: SqlitePool,
}

impl SqliteLibraryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

const ACTIVE_ITEM_COUNT: &str = r#"
    (SELECT COUNT(*) FROM external_library_items i
     WHERE i.library_id = external_libraries.id AND i.is_active = 1)
"#;

#[async_trait]
impl LibraryRepository for SqliteLibraryRepository {
    async fn upsert(&self, library: &LibraryUpsert, now: i64) -> Result<ExternalLibrary> {
        let row = query_as::<_, ExternalLibrary>(
            r#"
            INSERT INTO external_libraries (
                server_id, library_key, title, kind, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (server_id, library_key) DO UPDATE SET
                title = excluded.title,
                kind = excluded.kind,
                updated_at = excluded.updated_at
            RETURNING *
            "#,
        )
        .bind(library.server_id)
        .bind(&library.library_key)
        .bind(&library.title)
        .bind(library.kind.as_str())
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<ExternalLibrary>> {
        let row = query_as::<_, ExternalLibrary>("SELECT * FROM external_libraries WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn find_by_server(&self, server_id: i64) -> Result<Vec<ExternalLibrary>> {
        let rows = query_as::<_, ExternalLibrary>(
            "SELECT * FROM external_libraries WHERE server_id = ? ORDER BY library_key",
        )
        .bind(server_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn find_accessible(&self, owner: OwnerId) -> Result<Vec<ExternalLibrary>> {
        let rows = query_as::<_, ExternalLibrary>(
            r#"
            SELECT l.* FROM external_libraries l
            JOIN user_library_access a ON a.library_id = l.id
            WHERE a.owner_id = ? AND a.is_active = 1
            ORDER BY l.id
            "#,
        )
        .bind(owner.as_i64())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn refresh_item_count(&self, library_id: i64, now: i64) -> Result<i64> {
        let (count,): (i64,) = query_as(&format!(
            "UPDATE external_libraries SET item_count = {}, updated_at = ? WHERE id = ? \
             RETURNING item_count",
            ACTIVE_ITEM_COUNT
        ))
        .bind(now)
        .bind(library_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn mark_synced(&self, library_id: i64, now: i64) -> Result<()> {
        sqlx::query("UPDATE external_libraries SET last_synced_at = ?, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(now)
            .bind(library_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn recompute_item_counts(&self) -> Result<u64> {
        let result = sqlx::query(&format!(
            "UPDATE external_libraries SET item_count = {0} WHERE item_count != {0}",
            ACTIVE_ITEM_COUNT
        ))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;
    use crate::models::{MediaKind, ServerUpsert};
    use crate::repositories::{ServerRepository, SqliteServerRepository};

    async fn seed_server(pool: &SqlitePool) -> i64 {
        SqliteServerRepository::new(pool.clone())
            .upsert(
                &ServerUpsert {
                    machine_id: "m".to_string(),
                    name: "Server".to_string(),
                    connection_uri: "https://s:32400".to_string(),
                    is_local: false,
                    is_relay: false,
                    access_token: None,
                },
                1,
            )
            .await
            .unwrap()
            .id
    }

    fn movies(server_id: i64, title: &str) -> LibraryUpsert {
        LibraryUpsert {
            server_id,
            library_key: "1".to_string(),
            title: title.to_string(),
            kind: MediaKind::Movie,
        }
    }

    #[tokio::test]
    async fn test_upsert_updates_in_place() {
        let pool = create_test_pool().await.unwrap();
        let server_id = seed_server(&pool).await;
        let repo = SqliteLibraryRepository::new(pool);

        let a = repo.upsert(&movies(server_id, "Movies"), 10).await.unwrap();
        let b = repo.upsert(&movies(server_id, "Films"), 20).await.unwrap();

        assert_eq!(a.id, b.id);
        assert_eq!(b.title, "Films");
        assert!(b.is_movie_library());
        assert_eq!(repo.find_by_server(server_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_item_counts_recompute_only_drifted_rows() {
        let pool = create_test_pool().await.unwrap();
        let server_id = seed_server(&pool).await;
        let repo = SqliteLibraryRepository::new(pool.clone());
        let library = repo.upsert(&movies(server_id, "Movies"), 10).await.unwrap();

        sqlx::query(
            "INSERT INTO external_library_items \
             (library_id, native_key, guid, title, kind, last_seen_at, created_at, updated_at) \
             VALUES (?, 'k1', 'g1', 'A', 'movie', 1, 1, 1), (?, 'k2', 'g2', 'B', 'movie', 1, 1, 1)",
        )
        .bind(library.id)
        .bind(library.id)
        .execute(&pool)
        .await
        .unwrap();

        assert_eq!(repo.recompute_item_counts().await.unwrap(), 1);
        assert_eq!(repo.recompute_item_counts().await.unwrap(), 0);

        sqlx::query("UPDATE external_library_items SET is_active = 0 WHERE native_key = 'k1'")
            .execute(&pool)
            .await
            .unwrap();
        assert_eq!(repo.refresh_item_count(library.id, 11).await.unwrap(), 1);
    }
}

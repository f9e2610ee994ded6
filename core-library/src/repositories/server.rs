//! External server repository

use crate::error::Result;
use crate::models::{ExternalServer, ServerUpsert};
use async_trait::async_trait;
use sqlx::{query_as, SqlitePool};

#[async_trait]
pub trait ServerRepository: Send + Sync {
    /// Insert or update a server keyed by its machine identifier.
    async fn upsert(&self, server: &ServerUpsert, now: i64) -> Result<ExternalServer>;

    async fn find_by_id(&self, id: i64) -> Result<Option<ExternalServer>>;

    async fn find_by_machine_id(&self, machine_id: &str) -> Result<Option<ExternalServer>>;
}

pub struct SqliteServerRepository {
    pool: SqlitePool,
}

impl SqliteServerRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ServerRepository for SqliteServerRepository {
    async fn upsert(&self, server: &ServerUpsert, now: i64) -> Result<ExternalServer> {
        let row = query_as::<_, ExternalServer>(
            r#"
            INSERT INTO external_servers (
                machine_id, name, connection_uri, is_local, is_relay, access_token,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (machine_id) DO UPDATE SET
                name = excluded.name,
                connection_uri = excluded.connection_uri,
                is_local = excluded.is_local,
                is_relay = excluded.is_relay,
                access_token = COALESCE(excluded.access_token, external_servers.access_token),
                updated_at = excluded.updated_at
            RETURNING *
            "#,
        )
        .bind(&server.machine_id)
        .bind(&server.name)
        .bind(&server.connection_uri)
        .bind(server.is_local)
        .bind(server.is_relay)
        .bind(&server.access_token)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<ExternalServer>> {
        let row = query_as::<_, ExternalServer>("SELECT * FROM external_servers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn find_by_machine_id(&self, machine_id: &str) -> Result<Option<ExternalServer>> {
        let row =
            query_as::<_, ExternalServer>("SELECT * FROM external_servers WHERE machine_id = ?")
                .bind(machine_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row)
    }
}

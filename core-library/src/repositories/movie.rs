//! Local metadata record repository

use crate::error::Result;
use crate::models::{Movie, NewMovie};
use async_trait::async_trait;
use sqlx::{query_as, SqlitePool};

#[async_trait]
pub trait MovieRepository: Send + Sync {
    async fn find_by_id(&self, id: i64) -> Result<Option<Movie>>;

    async fn exists(&self, id: i64) -> Result<bool>;

    /// Create the record or refresh its descriptive fields.
    async fn upsert(&self, movie: &NewMovie, now: i64) -> Result<Movie>;
}

pub struct SqliteMovieRepository {
    pool: SqlitePool,
}

impl SqliteMovieRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MovieRepository for SqliteMovieRepository {
    async fn find_by_id(&self, id: i64) -> Result<Option<Movie>> {
        let row = query_as::<_, Movie>("SELECT * FROM movies WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn exists(&self, id: i64) -> Result<bool> {
        let (exists,): (bool,) = query_as("SELECT EXISTS (SELECT 1 FROM movies WHERE id = ?)")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn upsert(&self, movie: &NewMovie, now: i64) -> Result<Movie> {
        let row = query_as::<_, Movie>(
            r#"
            INSERT INTO movies (
                id, title, original_title, release_year, overview, poster_path, popularity,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                title = excluded.title,
                original_title = COALESCE(excluded.original_title, movies.original_title),
                release_year = COALESCE(excluded.release_year, movies.release_year),
                overview = COALESCE(excluded.overview, movies.overview),
                poster_path = COALESCE(excluded.poster_path, movies.poster_path),
                popularity = COALESCE(excluded.popularity, movies.popularity),
                updated_at = excluded.updated_at
            RETURNING *
            "#,
        )
        .bind(movie.id)
        .bind(&movie.title)
        .bind(&movie.original_title)
        .bind(movie.release_year)
        .bind(&movie.overview)
        .bind(&movie.poster_path)
        .bind(movie.popularity)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;

    #[tokio::test]
    async fn test_upsert_keeps_known_fields() {
        let pool = create_test_pool().await.unwrap();
        let repo = SqliteMovieRepository::new(pool);

        assert!(!repo.exists(603).await.unwrap());

        let full = NewMovie {
            id: 603,
            title: "The Matrix".to_string(),
            original_title: None,
            release_year: Some(1999),
            overview: Some("Neo".to_string()),
            poster_path: None,
            popularity: Some(80.5),
        };
        repo.upsert(&full, 10).await.unwrap();

        let sparse = NewMovie {
            overview: None,
            release_year: None,
            ..full.clone()
        };
        let stored = repo.upsert(&sparse, 20).await.unwrap();

        assert!(repo.exists(603).await.unwrap());
        assert_eq!(stored.release_year, Some(1999));
        assert_eq!(stored.overview.as_deref(), Some("Neo"));
        assert_eq!(stored.created_at, 10);
        assert_eq!(stored.updated_at, 20);
    }
}

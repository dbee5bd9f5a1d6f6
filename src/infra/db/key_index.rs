use async_trait::async_trait;

use crate::application::repos::{KeyIndexRepo, RepoError};

use super::{PostgresRepositories, map_sqlx_error};

#[async_trait]
impl KeyIndexRepo for PostgresRepositories {
    async fn upsert_key(&self, cache_name: &str, key: &str) -> Result<(), RepoError> {
        sqlx::query(
            r#"
            INSERT INTO cache_key_index (cache_name, cache_key)
            VALUES ($1, $2)
            ON CONFLICT (cache_name, cache_key) DO UPDATE
            SET indexed_at = now()
            "#,
        )
        .bind(cache_name)
        .bind(key)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn remove_key(&self, cache_name: &str, key: &str) -> Result<(), RepoError> {
        sqlx::query("DELETE FROM cache_key_index WHERE cache_name = $1 AND cache_key = $2")
            .bind(cache_name)
            .bind(key)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn list_keys(&self, cache_name: &str) -> Result<Vec<String>, RepoError> {
        sqlx::query_scalar::<_, String>(
            "SELECT cache_key FROM cache_key_index WHERE cache_name = $1 ORDER BY cache_key",
        )
        .bind(cache_name)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)
    }
}

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::{
    application::repos::{CacheNameRepo, RepoError},
    domain::cache_name::CacheNameRecord,
};

use super::{PostgresRepositories, map_sqlx_error};

#[derive(sqlx::FromRow)]
struct CacheNameRow {
    cache_name: String,
    description: Option<String>,
    deleted: bool,
    updated_at: OffsetDateTime,
}

impl From<CacheNameRow> for CacheNameRecord {
    fn from(row: CacheNameRow) -> Self {
        Self {
            cache_name: row.cache_name,
            description: row.description,
            deleted: row.deleted,
            updated_at: row.updated_at,
        }
    }
}

#[async_trait]
impl CacheNameRepo for PostgresRepositories {
    async fn find(&self, cache_name: &str) -> Result<Option<CacheNameRecord>, RepoError> {
        let row = sqlx::query_as::<_, CacheNameRow>(
            r#"
            SELECT cache_name, description, deleted, updated_at
            FROM cache_names
            WHERE cache_name = $1
            "#,
        )
        .bind(cache_name)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.map(CacheNameRecord::from))
    }

    async fn upsert(&self, record: &CacheNameRecord) -> Result<(), RepoError> {
        sqlx::query(
            r#"
            INSERT INTO cache_names (cache_name, description, deleted, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (cache_name) DO UPDATE
            SET description = EXCLUDED.description,
                deleted = EXCLUDED.deleted,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&record.cache_name)
        .bind(record.description.as_deref())
        .bind(record.deleted)
        .bind(record.updated_at)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }
}

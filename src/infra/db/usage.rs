use async_trait::async_trait;

use crate::{
    application::repos::{RepoError, UsageRepo},
    domain::usage::{TenantUsage, UsageDelta},
};

use super::{PostgresRepositories, map_sqlx_error};

#[derive(sqlx::FromRow)]
struct TenantUsageRow {
    org: String,
    cache_count: i64,
    total_bytes_cached: i64,
}

impl From<TenantUsageRow> for TenantUsage {
    fn from(row: TenantUsageRow) -> Self {
        Self {
            org: row.org,
            cache_count: row.cache_count,
            total_bytes_cached: row.total_bytes_cached,
        }
    }
}

#[async_trait]
impl UsageRepo for PostgresRepositories {
    async fn apply_delta(&self, org: &str, delta: UsageDelta) -> Result<(), RepoError> {
        sqlx::query(
            r#"
            INSERT INTO tenant_usage (org, cache_count, total_bytes_cached)
            VALUES ($1, $2, $3)
            ON CONFLICT (org) DO UPDATE
            SET cache_count = tenant_usage.cache_count + EXCLUDED.cache_count,
                total_bytes_cached = tenant_usage.total_bytes_cached + EXCLUDED.total_bytes_cached,
                updated_at = now()
            "#,
        )
        .bind(org)
        .bind(delta.cache_count)
        .bind(delta.total_bytes)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn get(&self, org: &str) -> Result<TenantUsage, RepoError> {
        let row = sqlx::query_as::<_, TenantUsageRow>(
            "SELECT org, cache_count, total_bytes_cached FROM tenant_usage WHERE org = $1",
        )
        .bind(org)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(row
            .map(TenantUsage::from)
            .unwrap_or_else(|| TenantUsage::empty(org)))
    }

    async fn reset(&self, org: &str) -> Result<(), RepoError> {
        sqlx::query(
            r#"
            INSERT INTO tenant_usage (org, cache_count, total_bytes_cached)
            VALUES ($1, 0, 0)
            ON CONFLICT (org) DO UPDATE
            SET cache_count = 0, total_bytes_cached = 0, updated_at = now()
            "#,
        )
        .bind(org)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }
}

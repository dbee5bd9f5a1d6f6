use async_trait::async_trait;
use time::OffsetDateTime;

use crate::{
    application::repos::{ProjectionOutbox, RepoError},
    projection::{Epoch, EventKind, StoreEvent},
};

use super::{PostgresRepositories, map_sqlx_error};

#[derive(sqlx::FromRow)]
struct OutboxRow {
    id: i64,
    kind: String,
    cache_name: String,
    cache_key: String,
    org: Option<String>,
    total_bytes: i64,
    recorded_at: OffsetDateTime,
}

impl TryFrom<OutboxRow> for StoreEvent {
    type Error = RepoError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        let epoch = Epoch::try_from(row.id)
            .map_err(|_| RepoError::integrity(format!("negative outbox id {}", row.id)))?;
        let kind = match row.kind.as_str() {
            "entry_created" => EventKind::EntryCreated {
                cache_name: row.cache_name,
                key: row.cache_key,
                org: row.org,
                total_bytes: row.total_bytes,
            },
            "entry_deleted" => EventKind::EntryDeleted {
                cache_name: row.cache_name,
                key: row.cache_key,
                org: row.org,
                total_bytes: row.total_bytes,
            },
            other => {
                return Err(RepoError::integrity(format!(
                    "unknown outbox event kind `{other}`"
                )));
            }
        };
        Ok(StoreEvent {
            epoch,
            kind,
            timestamp: row.recorded_at,
        })
    }
}

#[async_trait]
impl ProjectionOutbox for PostgresRepositories {
    async fn pending(&self, limit: usize) -> Result<Vec<StoreEvent>, RepoError> {
        let rows = sqlx::query_as::<_, OutboxRow>(
            r#"
            SELECT id, kind, cache_name, cache_key, org, total_bytes, recorded_at
            FROM projection_outbox
            ORDER BY id
            LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter().map(StoreEvent::try_from).collect()
    }

    async fn acknowledge(&self, epochs: &[Epoch]) -> Result<(), RepoError> {
        if epochs.is_empty() {
            return Ok(());
        }
        let ids: Vec<i64> = epochs
            .iter()
            .filter_map(|epoch| i64::try_from(*epoch).ok())
            .collect();
        sqlx::query("DELETE FROM projection_outbox WHERE id = ANY($1)")
            .bind(ids)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn backlog(&self) -> Result<u64, RepoError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM projection_outbox")
            .fetch_one(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

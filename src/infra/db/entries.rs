use async_trait::async_trait;
use bytes::Bytes;
use time::OffsetDateTime;

use crate::{
    application::repos::{EntryJournal, ExpiryRecord, RepoError},
    domain::entry::{Chunk, EntryEvent, EntryId},
    projection::EventKind,
};

use super::{PostgresRepositories, map_sqlx_error};

#[derive(sqlx::FromRow)]
struct EntryEventRow {
    kind: String,
    org: Option<String>,
    ttl_seconds: Option<i32>,
    total_bytes: Option<i64>,
    sequence: Option<i32>,
    payload: Option<Vec<u8>>,
}

impl TryFrom<EntryEventRow> for EntryEvent {
    type Error = RepoError;

    fn try_from(row: EntryEventRow) -> Result<Self, Self::Error> {
        let total_bytes = || {
            row.total_bytes
                .ok_or_else(|| RepoError::integrity(format!("`{}` event without total_bytes", row.kind)))
        };
        match row.kind.as_str() {
            "created" => Ok(EntryEvent::Created {
                org: row.org.clone(),
                ttl_seconds: row
                    .ttl_seconds
                    .map(|ttl| u32::try_from(ttl).unwrap_or(0))
                    .filter(|ttl| *ttl > 0),
                total_bytes: total_bytes()?,
                first_chunk: Bytes::from(row.payload.clone().unwrap_or_default()),
            }),
            "chunk_appended" => {
                let sequence = row
                    .sequence
                    .and_then(|sequence| u32::try_from(sequence).ok())
                    .ok_or_else(|| RepoError::integrity("chunk event without valid sequence"))?;
                Ok(EntryEvent::ChunkAppended {
                    chunk: Chunk::new(sequence, row.payload.clone().unwrap_or_default()),
                })
            }
            "deleted" => Ok(EntryEvent::Deleted {
                org: row.org.clone(),
                total_bytes: total_bytes()?,
            }),
            other => Err(RepoError::integrity(format!(
                "unknown entry event kind `{other}`"
            ))),
        }
    }
}

#[derive(sqlx::FromRow)]
struct ExpiringRow {
    cache_name: String,
    cache_key: String,
    ttl_seconds: i32,
    recorded_at: OffsetDateTime,
}

impl From<ExpiringRow> for ExpiryRecord {
    fn from(row: ExpiringRow) -> Self {
        Self {
            id: EntryId::new(row.cache_name, row.cache_key),
            ttl_seconds: u64::try_from(row.ttl_seconds).unwrap_or(0),
            created_at: row.recorded_at,
        }
    }
}

#[async_trait]
impl EntryJournal for PostgresRepositories {
    async fn load(&self, id: &EntryId) -> Result<Vec<EntryEvent>, RepoError> {
        let rows = sqlx::query_as::<_, EntryEventRow>(
            r#"
            SELECT kind, org, ttl_seconds, total_bytes, sequence, payload
            FROM cache_entry_events
            WHERE cache_name = $1 AND cache_key = $2
            ORDER BY id
            "#,
        )
        .bind(id.cache_name())
        .bind(id.key())
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter().map(EntryEvent::try_from).collect()
    }

    async fn append(&self, id: &EntryId, events: &[EntryEvent]) -> Result<(), RepoError> {
        let mut tx = self.begin().await.map_err(map_sqlx_error)?;

        let start = events.iter().rposition(EntryEvent::is_boundary);
        if start.is_some() {
            sqlx::query("DELETE FROM cache_entry_events WHERE cache_name = $1 AND cache_key = $2")
                .bind(id.cache_name())
                .bind(id.key())
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
        }

        for event in &events[start.unwrap_or(0)..] {
            let (org, ttl_seconds, total_bytes, sequence, payload) = match event {
                EntryEvent::Created {
                    org,
                    ttl_seconds,
                    total_bytes,
                    first_chunk,
                } => (
                    org.as_deref(),
                    ttl_seconds.map(|ttl| i32::try_from(ttl).unwrap_or(i32::MAX)),
                    Some(*total_bytes),
                    Some(0),
                    Some(&first_chunk[..]),
                ),
                EntryEvent::ChunkAppended { chunk } => (
                    None,
                    None,
                    None,
                    Some(i32::try_from(chunk.sequence).map_err(|_| {
                        RepoError::InvalidInput {
                            message: format!("chunk sequence {} out of range", chunk.sequence),
                        }
                    })?),
                    Some(&chunk.payload[..]),
                ),
                EntryEvent::Deleted { org, total_bytes } => {
                    (org.as_deref(), None, Some(*total_bytes), None, None)
                }
            };

            sqlx::query(
                r#"
                INSERT INTO cache_entry_events
                    (cache_name, cache_key, kind, org, ttl_seconds, total_bytes, sequence, payload)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(id.cache_name())
            .bind(id.key())
            .bind(event.kind())
            .bind(org)
            .bind(ttl_seconds)
            .bind(total_bytes)
            .bind(sequence)
            .bind(payload)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        }

        for kind in events
            .iter()
            .filter_map(|event| EventKind::from_entry_event(id, event))
        {
            let (org, total_bytes) = match &kind {
                EventKind::EntryCreated {
                    org, total_bytes, ..
                }
                | EventKind::EntryDeleted {
                    org, total_bytes, ..
                } => (org.as_deref(), *total_bytes),
            };
            sqlx::query(
                r#"
                INSERT INTO projection_outbox (kind, cache_name, cache_key, org, total_bytes)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(kind.as_str())
            .bind(id.cache_name())
            .bind(id.key())
            .bind(org)
            .bind(total_bytes)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        }

        tx.commit().await.map_err(map_sqlx_error)
    }

    async fn expiring(&self) -> Result<Vec<ExpiryRecord>, RepoError> {
        let rows = sqlx::query_as::<_, ExpiringRow>(
            r#"
            SELECT cache_name, cache_key, ttl_seconds, recorded_at
            FROM (
                SELECT DISTINCT ON (cache_name, cache_key)
                       cache_name, cache_key, kind, ttl_seconds, recorded_at
                FROM cache_entry_events
                WHERE kind IN ('created', 'deleted')
                ORDER BY cache_name, cache_key, id DESC
            ) latest
            WHERE kind = 'created' AND ttl_seconds > 0
            ORDER BY recorded_at
            "#,
        )
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(rows.into_iter().map(ExpiryRecord::from).collect())
    }
}

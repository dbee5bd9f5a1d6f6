use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    application::repos::{DeletionJobRepo, RepoError},
    domain::deletion::{DeletionJob, DeletionStatus, DeletionStep},
};

use super::{PostgresRepositories, map_sqlx_error};

#[derive(sqlx::FromRow)]
struct DeletionJobRow {
    job_id: Uuid,
    cache_name: String,
    flush_only: bool,
    key_snapshot: Vec<String>,
    cursor_pos: i64,
    retry_count: i32,
    step: String,
    status: String,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<DeletionJobRow> for DeletionJob {
    type Error = RepoError;

    fn try_from(row: DeletionJobRow) -> Result<Self, Self::Error> {
        let invalid = |err: &dyn std::fmt::Display| {
            RepoError::integrity(format!("deletion job {}: {err}", row.job_id))
        };
        let step = row.step.parse::<DeletionStep>().map_err(|err| invalid(&err))?;
        let status = row
            .status
            .parse::<DeletionStatus>()
            .map_err(|err| invalid(&err))?;
        let cursor = usize::try_from(row.cursor_pos).map_err(|err| invalid(&err))?;
        let retry_count = u32::try_from(row.retry_count).map_err(|err| invalid(&err))?;

        Ok(DeletionJob {
            job_id: row.job_id,
            cache_name: row.cache_name,
            flush_only: row.flush_only,
            key_snapshot: row.key_snapshot,
            cursor,
            retry_count,
            step,
            status,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const SELECT_JOB: &str = r#"
    SELECT job_id, cache_name, flush_only, key_snapshot, cursor_pos, retry_count,
           step, status, created_at, updated_at
    FROM deletion_jobs
"#;

#[async_trait]
impl DeletionJobRepo for PostgresRepositories {
    async fn save(&self, job: &DeletionJob) -> Result<(), RepoError> {
        let cursor = i64::try_from(job.cursor).map_err(|_| RepoError::InvalidInput {
            message: format!("cursor {} out of range", job.cursor),
        })?;
        let retry_count = i32::try_from(job.retry_count).unwrap_or(i32::MAX);

        sqlx::query(
            r#"
            INSERT INTO deletion_jobs
                (job_id, cache_name, flush_only, key_snapshot, cursor_pos, retry_count,
                 step, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (job_id) DO UPDATE
            SET key_snapshot = EXCLUDED.key_snapshot,
                cursor_pos = EXCLUDED.cursor_pos,
                retry_count = EXCLUDED.retry_count,
                step = EXCLUDED.step,
                status = EXCLUDED.status,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(job.job_id)
        .bind(&job.cache_name)
        .bind(job.flush_only)
        .bind(&job.key_snapshot)
        .bind(cursor)
        .bind(retry_count)
        .bind(job.step.as_str())
        .bind(job.status.as_str())
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn find(&self, job_id: Uuid) -> Result<Option<DeletionJob>, RepoError> {
        let row = sqlx::query_as::<_, DeletionJobRow>(&format!("{SELECT_JOB} WHERE job_id = $1"))
            .bind(job_id)
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        row.map(DeletionJob::try_from).transpose()
    }
}

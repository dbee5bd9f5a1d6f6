use async_trait::async_trait;
use time::OffsetDateTime;

use crate::application::repos::{JobsRepo, NewJobRecord, RepoError};

use super::{PostgresRepositories, map_sqlx_error};

#[async_trait]
impl JobsRepo for PostgresRepositories {
    async fn enqueue_job(&self, job: NewJobRecord) -> Result<String, RepoError> {
        sqlx::query_scalar::<_, String>(
            r#"
            SELECT (apalis.push_job($1, $2::json, $3, $4, $5, $6)).id
            "#,
        )
        .bind(job.job_type)
        .bind(job.payload)
        .bind("Pending")
        .bind(OffsetDateTime::now_utc())
        .bind(job.max_attempts)
        .bind(0_i32)
        .fetch_one(self.pool())
        .await
        .map_err(map_sqlx_error)
    }
}

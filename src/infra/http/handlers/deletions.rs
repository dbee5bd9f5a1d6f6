use axum::Json;
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use keystash_api_types::{DeletionJobView, DeletionStatus as ApiDeletionStatus};
use uuid::Uuid;

use crate::domain::deletion::{DeletionJob, DeletionStatus};

use super::cache_to_api;
use crate::infra::http::error::ApiError;
use crate::infra::http::state::HttpState;

fn job_to_view(job: DeletionJob) -> DeletionJobView {
    let status = match job.status {
        DeletionStatus::Empty => ApiDeletionStatus::Empty,
        DeletionStatus::InProgress => ApiDeletionStatus::InProgress,
        DeletionStatus::Complete => ApiDeletionStatus::Complete,
    };
    DeletionJobView {
        job_id: job.job_id,
        cache_name: job.cache_name,
        flush_only: job.flush_only,
        status,
        step: job.step.to_string(),
        keys_total: job.key_snapshot.len(),
        cursor: job.cursor,
        retry_count: job.retry_count,
        created_at: job.created_at,
        updated_at: job.updated_at,
    }
}

pub async fn get_deletion_job(
    State(state): State<HttpState>,
    Path(job_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .cache
        .deletion_job(job_id)
        .await
        .map_err(cache_to_api)?;

    Ok(Json(job_to_view(job)))
}

use apalis::prelude::{Data, Error as ApalisError};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::application::repos::{JobsRepo, NewJobRecord, RepoError};

use super::context::{JobWorkerContext, job_failed};

/// Queue namespace shared by producers and the worker.
pub const BULK_DELETE_JOB: &str = "keystash::BulkDelete";
const BULK_DELETE_MAX_ATTEMPTS: i32 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkDeleteJobPayload {
    pub job_id: Uuid,
}

/// Queue a run of the persisted deletion job `job_id`.
pub async fn enqueue_bulk_delete_job<J>(repo: &J, job_id: Uuid) -> Result<String, RepoError>
where
    J: JobsRepo + ?Sized,
{
    let payload = serde_json::to_value(BulkDeleteJobPayload { job_id })
        .map_err(RepoError::from_persistence)?;
    repo.enqueue_job(NewJobRecord {
        job_type: BULK_DELETE_JOB,
        payload,
        max_attempts: BULK_DELETE_MAX_ATTEMPTS,
    })
    .await
}

/// Drive a deletion job from its persisted step to the end.
///
/// A redelivered payload picks up at the saved cursor; one whose job already
/// finished is acknowledged without work.
#[instrument(skip(context), fields(job_id = %payload.job_id))]
pub async fn process_bulk_delete_job(
    payload: BulkDeleteJobPayload,
    context: Data<JobWorkerContext>,
) -> Result<(), ApalisError> {
    let ctx = &*context;
    let job = ctx
        .workflow
        .find(payload.job_id)
        .await
        .map_err(job_failed)?;

    if job.is_complete() {
        info!(job_id = %job.job_id, "Bulk delete already complete");
        return Ok(());
    }

    info!(
        job_id = %job.job_id,
        step = job.step.as_str(),
        cursor = job.cursor,
        "Bulk delete job picked up"
    );
    ctx.workflow.run(job).await.map_err(job_failed)?;
    Ok(())
}

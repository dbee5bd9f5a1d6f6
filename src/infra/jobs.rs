//! Job queue backends.
//!
//! With Postgres configured, bulk deletes go through apalis: producers push
//! rows with `apalis.push_job` and a worker pool claims them, re-enqueueing
//! jobs orphaned by a crashed worker. Without a database the same job
//! function runs on the local runtime.

use apalis::{
    layers::WorkerBuilderExt,
    prelude::{Data, Monitor, WorkerBuilder, WorkerFactoryFn},
};
use apalis_sql::{Config as ApalisSqlConfig, postgres::PostgresStorage};
use async_trait::async_trait;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tracing::{error, warn};
use uuid::Uuid;

use crate::application::jobs::{
    BULK_DELETE_JOB, BulkDeleteJobPayload, JobWorkerContext, process_bulk_delete_job,
};
use crate::application::repos::{JobsRepo, NewJobRecord, RepoError};

/// Start the apalis worker pool for bulk delete jobs.
pub fn spawn_job_monitor(
    pool: PgPool,
    context: JobWorkerContext,
    concurrency: usize,
) -> JoinHandle<()> {
    let storage: PostgresStorage<BulkDeleteJobPayload> =
        PostgresStorage::new_with_config(pool, ApalisSqlConfig::new(BULK_DELETE_JOB));

    let bulk_delete_worker = WorkerBuilder::new("bulk-delete-worker")
        .concurrency(concurrency)
        .data(context)
        .backend(storage)
        .build_fn(process_bulk_delete_job);

    let monitor = Monitor::new().register(bulk_delete_worker);

    tokio::spawn(async move {
        if let Err(err) = monitor.run().await {
            error!(error = %err, "job monitor stopped");
        }
    })
}

/// Runs queued jobs as tasks on the current runtime. Nothing is persisted,
/// so a job interrupted by a restart is not picked up again.
pub struct InlineJobRunner {
    context: JobWorkerContext,
}

impl InlineJobRunner {
    pub fn new(context: JobWorkerContext) -> Self {
        Self { context }
    }
}

#[async_trait]
impl JobsRepo for InlineJobRunner {
    async fn enqueue_job(&self, job: NewJobRecord) -> Result<String, RepoError> {
        if job.job_type != BULK_DELETE_JOB {
            return Err(RepoError::InvalidInput {
                message: format!("unknown job type `{}`", job.job_type),
            });
        }
        let payload: BulkDeleteJobPayload =
            serde_json::from_value(job.payload).map_err(|err| RepoError::InvalidInput {
                message: err.to_string(),
            })?;

        let queued = Uuid::new_v4().to_string();
        let context = Data::new(self.context.clone());
        let job_id = payload.job_id;
        tokio::spawn(async move {
            if let Err(err) = process_bulk_delete_job(payload, context).await {
                warn!(job_id = %job_id, error = %err, "Bulk delete job failed");
            }
        });
        Ok(queued)
    }
}

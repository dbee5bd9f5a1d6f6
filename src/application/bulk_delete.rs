//! Bulk delete workflow.
//!
//! Drives [`DeletionJob`]s to completion: snapshot the key index, delete the
//! snapshot block by block, then retire the cache name record unless the job
//! only flushes. The job is saved after every transition, so a run that the
//! job queue redelivers after a crash resumes where it stopped.

use std::num::NonZeroUsize;
use std::sync::Arc;

use futures::future::join_all;
use metrics::counter;
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::application::cache_names::{CacheNameError, CacheNameRegistry};
use crate::application::expiry::ExpiryScheduler;
use crate::application::repos::{DeletionJobRepo, KeyIndexRepo, RepoError};
use crate::application::store::{ChunkedCacheStore, StoreError};
use crate::domain::deletion::{DeletionJob, DeletionStep};
use crate::domain::entry::EntryId;

const METRIC_BULK_DELETE_BATCHES: &str = "keystash_bulk_delete_batches_total";

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("deletion job `{0}` not found")]
    NotFound(Uuid),
    #[error(transparent)]
    CacheName(#[from] CacheNameError),
    #[error(transparent)]
    Repo(#[from] RepoError),
}

#[derive(Debug, Clone, Copy)]
pub struct BulkDeleteConfig {
    pub block_size: NonZeroUsize,
    pub max_retries: u32,
}

impl Default for BulkDeleteConfig {
    fn default() -> Self {
        Self {
            block_size: NonZeroUsize::new(100).unwrap_or(NonZeroUsize::MIN),
            max_retries: 3,
        }
    }
}

impl From<&crate::config::BulkDeleteSettings> for BulkDeleteConfig {
    fn from(settings: &crate::config::BulkDeleteSettings) -> Self {
        Self {
            block_size: settings.block_size,
            max_retries: settings.max_retries.get(),
        }
    }
}

/// What one call to [`BulkDeleteWorkflow::step`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepOutcome {
    pub executed: DeletionStep,
    /// Keys handled by a `DeleteBatch` step, zero otherwise.
    pub processed: usize,
    pub failed: usize,
}

pub struct BulkDeleteWorkflow {
    jobs: Arc<dyn DeletionJobRepo>,
    index: Arc<dyn KeyIndexRepo>,
    store: Arc<ChunkedCacheStore>,
    expiry: Arc<ExpiryScheduler>,
    names: CacheNameRegistry,
    config: BulkDeleteConfig,
}

impl BulkDeleteWorkflow {
    pub fn new(
        jobs: Arc<dyn DeletionJobRepo>,
        index: Arc<dyn KeyIndexRepo>,
        store: Arc<ChunkedCacheStore>,
        expiry: Arc<ExpiryScheduler>,
        names: CacheNameRegistry,
        config: BulkDeleteConfig,
    ) -> Self {
        Self {
            jobs,
            index,
            store,
            expiry,
            names,
            config,
        }
    }

    /// Persist a new job without running it.
    pub async fn submit(
        &self,
        cache_name: &str,
        flush_only: bool,
    ) -> Result<DeletionJob, WorkflowError> {
        let job = DeletionJob::new(cache_name, flush_only);
        self.jobs.save(&job).await?;
        info!(
            job_id = %job.job_id,
            cache_name,
            flush_only,
            "Bulk delete submitted"
        );
        Ok(job)
    }

    pub async fn find(&self, job_id: Uuid) -> Result<DeletionJob, WorkflowError> {
        self.jobs
            .find(job_id)
            .await?
            .ok_or(WorkflowError::NotFound(job_id))
    }

    /// Step `job` until it completes.
    #[instrument(skip(self, job), fields(job_id = %job.job_id, cache_name = %job.cache_name))]
    pub async fn run(&self, mut job: DeletionJob) -> Result<DeletionJob, WorkflowError> {
        while !job.is_complete() {
            self.step(&mut job).await?;
        }
        info!(
            job_id = %job.job_id,
            keys = job.key_snapshot.len(),
            deleted = job.cursor,
            retries = job.retry_count,
            "Bulk delete complete"
        );
        Ok(job)
    }

    /// Execute the job's current step and persist the transition.
    pub async fn step(&self, job: &mut DeletionJob) -> Result<StepOutcome, WorkflowError> {
        let executed = job.step;
        let mut processed = 0;
        let mut failed = 0;

        match executed {
            DeletionStep::CollectKeys => {
                let keys = self.index.list_keys(&job.cache_name).await?;
                info!(job_id = %job.job_id, keys = keys.len(), "Key snapshot collected");
                job.keys_collected(keys);
            }
            DeletionStep::DeleteBatch => {
                let batch = job.next_batch(self.config.block_size.get()).to_vec();
                processed = batch.len();
                let cache_name = job.cache_name.as_str();
                let results = join_all(
                    batch
                        .iter()
                        .map(|key| self.delete_key(EntryId::new(cache_name, key.as_str()))),
                )
                .await;
                failed = results.iter().filter(|result| result.is_err()).count();

                if failed == 0 {
                    counter!(METRIC_BULK_DELETE_BATCHES, "outcome" => "ok").increment(1);
                    job.batch_succeeded(processed);
                } else {
                    counter!(METRIC_BULK_DELETE_BATCHES, "outcome" => "failed").increment(1);
                    job.batch_failed(self.config.max_retries);
                    warn!(
                        job_id = %job.job_id,
                        failed,
                        cursor = job.cursor,
                        retry_count = job.retry_count,
                        exhausted = job.retries_exhausted(self.config.max_retries),
                        "Bulk delete batch failed"
                    );
                }
            }
            DeletionStep::DeleteCacheNameRecord => {
                match self.names.delete(&job.cache_name).await {
                    Ok(()) => {}
                    Err(err) if err.is_not_found() => {}
                    Err(err) => return Err(err.into()),
                }
                job.name_record_deleted();
            }
            DeletionStep::End => job.finish(),
        }

        self.jobs.save(job).await?;
        Ok(StepOutcome {
            executed,
            processed,
            failed,
        })
    }

    async fn delete_key(&self, id: EntryId) -> Result<(), StoreError> {
        match self.store.delete(&id).await {
            Ok(_) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => {
                warn!(entry = %id, error = %err, "Bulk delete of key failed");
                return Err(err);
            }
        }
        self.expiry.cancel(&id);
        Ok(())
    }
}

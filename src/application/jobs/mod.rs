//! Background jobs run by the apalis worker pool.

mod bulk_delete;
mod context;

pub use bulk_delete::{
    BULK_DELETE_JOB, BulkDeleteJobPayload, enqueue_bulk_delete_job, process_bulk_delete_job,
};
pub use context::{JobWorkerContext, job_failed};

use std::sync::Arc;

use apalis::prelude::Error as ApalisError;

use crate::application::bulk_delete::BulkDeleteWorkflow;

/// State shared with every job worker.
#[derive(Clone)]
pub struct JobWorkerContext {
    pub workflow: Arc<BulkDeleteWorkflow>,
}

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Wrap `err` as a failed job attempt.
pub fn job_failed<E>(err: E) -> ApalisError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let boxed: BoxError = Box::new(err);
    ApalisError::Failed(Arc::new(boxed))
}

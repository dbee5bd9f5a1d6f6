//! Cache service.
//!
//! The operations the HTTP layer exposes, composed from the store, the
//! splitter, the expiry scheduler and the read models.

use std::convert::Infallible;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::future::join_all;
use futures::stream::{self, StreamExt, TryStreamExt};
use thiserror::Error;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use crate::application::bulk_delete::{BulkDeleteWorkflow, WorkflowError};
use crate::application::cache_names::{CacheNameError, CacheNameRegistry};
use crate::application::expiry::ExpiryScheduler;
use crate::application::jobs::enqueue_bulk_delete_job;
use crate::application::repos::{JobsRepo, KeyIndexRepo, RepoError};
use crate::application::splitter::{ChunkSplitter, SplitError, WriteRequest};
use crate::application::store::{ChunkedCacheStore, StoreError};
use crate::domain::cache_name::validate_segment;
use crate::domain::deletion::DeletionJob;
use crate::domain::entry::{EntryId, NewEntry};
use crate::domain::error::DomainError;
use crate::domain::usage::TenantUsage;
use crate::projection::UsageLedger;

#[derive(Debug, Error)]
pub enum CacheServiceError {
    #[error("cache entry `{0}` not found")]
    NotFound(String),
    #[error("cache name `{0}` not found")]
    CacheNameNotFound(String),
    #[error("{0}")]
    Invalid(String),
    #[error("tenant `{org}` has exceeded its allotment of {limit} cached bytes")]
    QuotaExceeded { org: String, limit: u64 },
    #[error("payload of `{id}` could not be reassembled: {reason}")]
    Incomplete { id: String, reason: String },
    #[error(transparent)]
    Split(SplitError),
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
    #[error(transparent)]
    Repo(#[from] RepoError),
}

impl CacheServiceError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            CacheServiceError::NotFound(_) | CacheServiceError::CacheNameNotFound(_)
        )
    }
}

impl From<StoreError> for CacheServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { id } => CacheServiceError::NotFound(id),
            StoreError::Invalid(message) => CacheServiceError::Invalid(message),
            StoreError::Repo(err) => CacheServiceError::Repo(err),
        }
    }
}

impl From<SplitError> for CacheServiceError {
    fn from(err: SplitError) -> Self {
        match err {
            SplitError::Store(err) => err.into(),
            other => CacheServiceError::Split(other),
        }
    }
}

impl From<CacheNameError> for CacheServiceError {
    fn from(err: CacheNameError) -> Self {
        match err {
            CacheNameError::NotFound(name) => CacheServiceError::CacheNameNotFound(name),
            CacheNameError::Domain(err) => err.into(),
            CacheNameError::Repo(err) => CacheServiceError::Repo(err),
        }
    }
}

impl From<DomainError> for CacheServiceError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::NotFound { id, .. } => CacheServiceError::NotFound(id),
            DomainError::Validation { message } | DomainError::Invariant { message } => {
                CacheServiceError::Invalid(message)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheServiceConfig {
    pub max_payload_size: NonZeroUsize,
    pub chunk_parallelism: NonZeroUsize,
    /// Applied when a write carries no TTL (or a TTL of zero).
    pub default_ttl: Option<Duration>,
    /// Reject writes under cache names that were never created.
    pub cache_name_needed_first: bool,
    /// Per-tenant byte allotment checked against the usage ledger.
    pub max_bytes_per_org: Option<u64>,
}

impl Default for CacheServiceConfig {
    fn default() -> Self {
        Self {
            max_payload_size: NonZeroUsize::new(500_000).unwrap_or(NonZeroUsize::MIN),
            chunk_parallelism: NonZeroUsize::new(4).unwrap_or(NonZeroUsize::MIN),
            default_ttl: None,
            cache_name_needed_first: false,
            max_bytes_per_org: None,
        }
    }
}

impl From<&crate::config::Settings> for CacheServiceConfig {
    fn from(settings: &crate::config::Settings) -> Self {
        Self {
            max_payload_size: settings.store.max_payload_size,
            chunk_parallelism: settings.store.chunk_parallelism,
            default_ttl: settings.store.default_ttl,
            cache_name_needed_first: settings.store.cache_name_needed_first,
            max_bytes_per_org: settings.usage.max_bytes_per_org.map(|limit| limit.get()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SetCommand {
    pub org: Option<String>,
    pub cache_name: String,
    pub key: String,
    pub ttl_seconds: Option<u32>,
    pub payload: Bytes,
}

/// Result of one item of a batch call.
#[derive(Debug)]
pub struct BatchItem<T> {
    pub id: EntryId,
    pub result: Result<T, CacheServiceError>,
}

impl<T> BatchItem<T> {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

pub struct CacheService {
    store: Arc<ChunkedCacheStore>,
    splitter: ChunkSplitter,
    expiry: Arc<ExpiryScheduler>,
    index: Arc<dyn KeyIndexRepo>,
    ledger: Arc<UsageLedger>,
    names: CacheNameRegistry,
    workflow: Arc<BulkDeleteWorkflow>,
    jobs: Arc<dyn JobsRepo>,
    config: CacheServiceConfig,
}

impl CacheService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<ChunkedCacheStore>,
        expiry: Arc<ExpiryScheduler>,
        index: Arc<dyn KeyIndexRepo>,
        ledger: Arc<UsageLedger>,
        names: CacheNameRegistry,
        workflow: Arc<BulkDeleteWorkflow>,
        jobs: Arc<dyn JobsRepo>,
        config: CacheServiceConfig,
    ) -> Self {
        let splitter = ChunkSplitter::new(
            store.clone(),
            expiry.clone(),
            config.max_payload_size,
            config.chunk_parallelism,
        );
        Self {
            store,
            splitter,
            expiry,
            index,
            ledger,
            names,
            workflow,
            jobs,
            config,
        }
    }

    pub fn names(&self) -> &CacheNameRegistry {
        &self.names
    }

    fn entry_id(cache_name: &str, key: &str) -> Result<EntryId, CacheServiceError> {
        validate_segment("cacheName", cache_name)?;
        validate_segment("key", key)?;
        Ok(EntryId::new(cache_name, key))
    }

    fn effective_ttl(&self, ttl_seconds: Option<u32>) -> Option<Duration> {
        match ttl_seconds {
            Some(seconds) if seconds > 0 => Some(Duration::from_secs(u64::from(seconds))),
            _ => self.config.default_ttl,
        }
    }

    async fn check_quota(&self, org: Option<&str>) -> Result<(), CacheServiceError> {
        let (Some(org), Some(limit)) = (org, self.config.max_bytes_per_org) else {
            return Ok(());
        };
        let usage = self.ledger.usage(org).await?;
        if usage.total_bytes_cached > i64::try_from(limit).unwrap_or(i64::MAX) {
            warn!(
                org,
                total_bytes_cached = usage.total_bytes_cached,
                limit,
                "Write rejected over tenant allotment"
            );
            return Err(CacheServiceError::QuotaExceeded {
                org: org.to_string(),
                limit,
            });
        }
        Ok(())
    }

    /// Store a payload. Returns the number of chunks written.
    #[instrument(skip(self, command), fields(cache_name = %command.cache_name, key = %command.key, bytes = command.payload.len()))]
    pub async fn set(&self, command: SetCommand) -> Result<u64, CacheServiceError> {
        let id = Self::entry_id(&command.cache_name, &command.key)?;
        if self.config.cache_name_needed_first && !self.names.exists(&command.cache_name).await? {
            return Err(CacheServiceError::CacheNameNotFound(command.cache_name));
        }
        self.check_quota(command.org.as_deref()).await?;

        let ttl = self.effective_ttl(command.ttl_seconds);
        let total_bytes = command.payload.len() as u64;

        // A pending timer belongs to the entry being replaced and must not
        // fire while the new one is written.
        self.expiry.cancel(&id);

        if command.payload.len() <= self.config.max_payload_size.get() {
            self.store
                .create(
                    &id,
                    NewEntry {
                        org: command.org,
                        ttl_seconds: ttl.map(|ttl| u32::try_from(ttl.as_secs()).unwrap_or(u32::MAX)),
                        total_bytes: total_bytes as i64,
                        first_chunk: command.payload,
                    },
                )
                .await?;
            if let Some(ttl) = ttl {
                self.expiry.schedule(id, ttl);
            }
            return Ok(1);
        }

        debug!(
            entry = %id,
            total_bytes,
            max_payload_size = self.config.max_payload_size.get(),
            "Large payload detected"
        );
        let source = stream::iter([Ok::<_, Infallible>(command.payload)]);
        let chunks = self
            .splitter
            .write(
                WriteRequest {
                    id,
                    org: command.org,
                    ttl,
                    total_bytes,
                },
                source,
            )
            .await?;
        Ok(chunks)
    }

    /// Read a payload, reassembling chunks in sequence order.
    pub async fn get(&self, cache_name: &str, key: &str) -> Result<Bytes, CacheServiceError> {
        let id = Self::entry_id(cache_name, key)?;
        let snapshot = self.store.get(&id).await?;
        let total = usize::try_from(snapshot.total_bytes).unwrap_or(0);
        if snapshot.chunk_count <= 1 {
            return Self::verify_length(&id, total, snapshot.first_chunk);
        }

        let store = &self.store;
        let id_ref = &id;
        let rest: Vec<_> = stream::iter(1..snapshot.chunk_count)
            .map(|sequence| store.get_chunk(id_ref, sequence))
            .buffered(self.config.chunk_parallelism.get())
            .try_collect()
            .await
            .map_err(|err| {
                error!(entry = %id, error = %err, "Chunk retrieval failed");
                CacheServiceError::Incomplete {
                    id: id.to_string(),
                    reason: err.to_string(),
                }
            })?;

        let mut payload = BytesMut::with_capacity(total);
        payload.extend_from_slice(&snapshot.first_chunk);
        for chunk in rest {
            payload.extend_from_slice(&chunk.payload);
        }
        Self::verify_length(&id, total, payload.freeze())
    }

    fn verify_length(id: &EntryId, total: usize, payload: Bytes) -> Result<Bytes, CacheServiceError> {
        if payload.len() == total {
            return Ok(payload);
        }
        error!(
            entry = %id,
            expected = total,
            actual = payload.len(),
            "Reassembled payload length mismatch"
        );
        Err(CacheServiceError::Incomplete {
            id: id.to_string(),
            reason: format!("expected {total} bytes, found {}", payload.len()),
        })
    }

    pub async fn delete(&self, cache_name: &str, key: &str) -> Result<(), CacheServiceError> {
        let id = Self::entry_id(cache_name, key)?;
        self.store.delete(&id).await?;
        self.expiry.cancel(&id);
        Ok(())
    }

    /// Indexed keys of `cache_name`. Lags the store.
    pub async fn keys(&self, cache_name: &str) -> Result<Vec<String>, CacheServiceError> {
        validate_segment("cacheName", cache_name)?;
        Ok(self.index.list_keys(cache_name).await?)
    }

    pub async fn batch_set(&self, commands: Vec<SetCommand>) -> Vec<BatchItem<u64>> {
        join_all(commands.into_iter().map(|command| async move {
            let id = EntryId::new(command.cache_name.as_str(), command.key.as_str());
            let result = self.set(command).await;
            if let Err(err) = &result {
                warn!(entry = %id, error = %err, "Batch set item failed");
            }
            BatchItem { id, result }
        }))
        .await
    }

    pub async fn batch_get(&self, ids: Vec<EntryId>) -> Vec<BatchItem<Bytes>> {
        join_all(ids.into_iter().map(|id| async move {
            let result = self.get(id.cache_name(), id.key()).await;
            BatchItem { id, result }
        }))
        .await
    }

    pub async fn batch_delete(&self, ids: Vec<EntryId>) -> Vec<BatchItem<()>> {
        join_all(ids.into_iter().map(|id| async move {
            let result = self.delete(id.cache_name(), id.key()).await;
            BatchItem { id, result }
        }))
        .await
    }

    /// Start deleting every entry and then the record of `cache_name`.
    pub async fn delete_all(&self, cache_name: &str) -> Result<Uuid, CacheServiceError> {
        validate_segment("cacheName", cache_name)?;
        self.start_bulk_delete(cache_name, false).await
    }

    /// Start deleting every entry of `cache_name`, keeping its record.
    pub async fn flush(&self, cache_name: &str) -> Result<Uuid, CacheServiceError> {
        validate_segment("cacheName", cache_name)?;
        self.start_bulk_delete(cache_name, true).await
    }

    async fn start_bulk_delete(
        &self,
        cache_name: &str,
        flush_only: bool,
    ) -> Result<Uuid, CacheServiceError> {
        let job = self.workflow.submit(cache_name, flush_only).await?;
        let queued = enqueue_bulk_delete_job(self.jobs.as_ref(), job.job_id).await?;
        debug!(job_id = %job.job_id, queued = %queued, "Bulk delete queued");
        Ok(job.job_id)
    }

    pub async fn deletion_job(&self, job_id: Uuid) -> Result<DeletionJob, CacheServiceError> {
        Ok(self.workflow.find(job_id).await?)
    }

    pub async fn usage(&self, org: &str) -> Result<TenantUsage, CacheServiceError> {
        Ok(self.ledger.usage(org).await?)
    }

    pub async fn reset_usage(&self, org: &str) -> Result<(), CacheServiceError> {
        self.ledger.reset(org).await?;
        Ok(())
    }
}

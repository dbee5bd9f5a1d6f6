//! Repository traits describing persistence adapters.

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::domain::cache_name::CacheNameRecord;
use crate::domain::deletion::DeletionJob;
use crate::domain::entry::{EntryEvent, EntryId};
use crate::domain::usage::{TenantUsage, UsageDelta};
use crate::projection::{Epoch, StoreEvent};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("duplicate record violates unique constraint `{constraint}`")]
    Duplicate { constraint: String },
    #[error("resource not found")]
    NotFound,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("integrity error: {message}")]
    Integrity { message: String },
    #[error("database timeout")]
    Timeout,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        Self::Integrity {
            message: message.into(),
        }
    }
}

/// Live entry created with a TTL, as recorded by the journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiryRecord {
    pub id: EntryId,
    pub ttl_seconds: u64,
    pub created_at: OffsetDateTime,
}

/// Append-only per-entry event log.
///
/// `Created` and `Deleted` supersede every earlier event of the same id, so
/// implementations drop the older history when one is appended. Appending
/// either also records a projection outbox row in the same write.
#[async_trait]
pub trait EntryJournal: Send + Sync {
    /// Events for `id` in append order.
    async fn load(&self, id: &EntryId) -> Result<Vec<EntryEvent>, RepoError>;

    /// Durably append `events` for `id`, all or nothing.
    async fn append(&self, id: &EntryId, events: &[EntryEvent]) -> Result<(), RepoError>;

    /// Entries whose latest boundary event is a `Created` carrying a TTL.
    async fn expiring(&self) -> Result<Vec<ExpiryRecord>, RepoError>;
}

/// Durable queue of store events the projection has not applied yet.
#[async_trait]
pub trait ProjectionOutbox: Send + Sync {
    /// Oldest unacknowledged events, at most `limit`, in epoch order.
    async fn pending(&self, limit: usize) -> Result<Vec<StoreEvent>, RepoError>;

    async fn acknowledge(&self, epochs: &[Epoch]) -> Result<(), RepoError>;

    async fn backlog(&self) -> Result<u64, RepoError>;
}

#[async_trait]
pub trait CacheNameRepo: Send + Sync {
    async fn find(&self, cache_name: &str) -> Result<Option<CacheNameRecord>, RepoError>;

    async fn upsert(&self, record: &CacheNameRecord) -> Result<(), RepoError>;
}

/// Read model listing the live keys of each cache name.
#[async_trait]
pub trait KeyIndexRepo: Send + Sync {
    async fn upsert_key(&self, cache_name: &str, key: &str) -> Result<(), RepoError>;

    async fn remove_key(&self, cache_name: &str, key: &str) -> Result<(), RepoError>;

    /// Keys currently indexed under `cache_name`, sorted.
    async fn list_keys(&self, cache_name: &str) -> Result<Vec<String>, RepoError>;
}

#[async_trait]
pub trait UsageRepo: Send + Sync {
    async fn apply_delta(&self, org: &str, delta: UsageDelta) -> Result<(), RepoError>;

    /// Counters for `org`; zero when nothing was recorded yet.
    async fn get(&self, org: &str) -> Result<TenantUsage, RepoError>;

    async fn reset(&self, org: &str) -> Result<(), RepoError>;
}

#[async_trait]
pub trait DeletionJobRepo: Send + Sync {
    async fn save(&self, job: &DeletionJob) -> Result<(), RepoError>;

    async fn find(&self, job_id: Uuid) -> Result<Option<DeletionJob>, RepoError>;
}

/// Background job handed to the worker queue.
#[derive(Debug, Clone)]
pub struct NewJobRecord {
    pub job_type: &'static str,
    pub payload: serde_json::Value,
    pub max_attempts: i32,
}

#[async_trait]
pub trait JobsRepo: Send + Sync {
    /// Queue `job` for a worker and return its queue id.
    async fn enqueue_job(&self, job: NewJobRecord) -> Result<String, RepoError>;
}

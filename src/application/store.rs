//! Chunked cache store.
//!
//! Owns the per-entry state machine. Commands for one [`EntryId`] run one at a
//! time behind that id's async mutex; the decided events are journaled before
//! they are folded into memory and the projection is woken. Lock cells live
//! only while a command holds or awaits them, and hydrated states sit in a
//! bounded LRU, so memory tracks active entries rather than every id seen.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex as StdMutex};

use bytes::Bytes;
use dashmap::DashMap;
use lru::LruCache;
use metrics::counter;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument};

use crate::application::repos::{EntryJournal, RepoError};
use crate::domain::entry::{Chunk, EntryEvent, EntryId, EntryState, NewEntry};
use crate::domain::error::DomainError;
use crate::projection::EventQueue;
use crate::util::lock::mutex_lock;

const SOURCE: &str = "application::store";
const METRIC_STORE_COMMANDS: &str = "keystash_store_commands_total";
pub const DEFAULT_STATE_CACHE_CAPACITY: NonZeroUsize = match NonZeroUsize::new(10_000) {
    Some(capacity) => capacity,
    None => NonZeroUsize::MIN,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache entry `{id}` not found")]
    NotFound { id: String },
    #[error("invalid command: {0}")]
    Invalid(String),
    #[error(transparent)]
    Repo(#[from] RepoError),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

impl From<DomainError> for StoreError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::NotFound { id, .. } => StoreError::NotFound { id },
            DomainError::Validation { message } | DomainError::Invariant { message } => {
                StoreError::Invalid(message)
            }
        }
    }
}

/// Read view of an active entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySnapshot {
    pub id: EntryId,
    pub org: Option<String>,
    pub ttl_seconds: Option<u32>,
    pub deleted: bool,
    pub total_bytes: i64,
    pub chunk_count: u32,
    pub first_chunk: Bytes,
}

/// What a delete retired, for callers that report it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletedEntry {
    pub org: Option<String>,
    pub total_bytes: i64,
}

/// Exclusive hold on one entry. Dropping it frees the lock cell once no other
/// command is waiting on it.
struct EntryLock<'a> {
    locks: &'a DashMap<EntryId, Arc<Mutex<()>>>,
    id: EntryId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for EntryLock<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(&self.id, |_, cell| Arc::strong_count(cell) == 1);
    }
}

pub struct ChunkedCacheStore {
    journal: Arc<dyn EntryJournal>,
    events: Arc<EventQueue>,
    locks: DashMap<EntryId, Arc<Mutex<()>>>,
    states: StdMutex<LruCache<EntryId, EntryState>>,
}

impl ChunkedCacheStore {
    pub fn new(journal: Arc<dyn EntryJournal>, events: Arc<EventQueue>) -> Self {
        Self::with_capacity(journal, events, DEFAULT_STATE_CACHE_CAPACITY)
    }

    pub fn with_capacity(
        journal: Arc<dyn EntryJournal>,
        events: Arc<EventQueue>,
        capacity: NonZeroUsize,
    ) -> Self {
        Self {
            journal,
            events,
            locks: DashMap::new(),
            states: StdMutex::new(LruCache::new(capacity)),
        }
    }

    /// Hydrated entries currently held in memory.
    pub fn resident(&self) -> usize {
        mutex_lock(&self.states, SOURCE, "resident").len()
    }

    /// Lock cells currently allocated.
    pub fn lock_cells(&self) -> usize {
        self.locks.len()
    }

    async fn lock(&self, id: &EntryId) -> EntryLock<'_> {
        let cell = self.locks.entry(id.clone()).or_default().clone();
        let guard = cell.lock_owned().await;
        EntryLock {
            locks: &self.locks,
            id: id.clone(),
            guard: Some(guard),
        }
    }

    /// Take the state of `id` out of the cache, replaying the journal on a miss.
    /// Callers hold the entry lock.
    async fn hydrate(&self, id: &EntryId) -> Result<EntryState, StoreError> {
        let cached = mutex_lock(&self.states, SOURCE, "hydrate").pop(id);
        if let Some(state) = cached {
            return Ok(state);
        }
        let events = self.journal.load(id).await?;
        debug!(entry = %id, journaled = events.len(), "Hydrating cache entry");
        Ok(EntryState::replay(&events))
    }

    /// Return `state` to the cache if it still holds a live entry.
    fn retain(&self, id: &EntryId, state: EntryState) {
        if state.active().is_some() {
            mutex_lock(&self.states, SOURCE, "retain").put(id.clone(), state);
        }
    }

    async fn commit(
        &self,
        id: &EntryId,
        state: &mut EntryState,
        events: Vec<EntryEvent>,
    ) -> Result<(), StoreError> {
        self.journal.append(id, &events).await?;
        for event in &events {
            state.apply(event);
        }
        self.events.published();
        Ok(())
    }

    /// Create or overwrite the entry with its first chunk.
    #[instrument(skip(self, new), fields(entry = %id, total_bytes = new.total_bytes))]
    pub async fn create(&self, id: &EntryId, new: NewEntry) -> Result<(), StoreError> {
        let _lock = self.lock(id).await;
        let mut state = self.hydrate(id).await?;

        let events = state.create(new)?;
        let overwrite = events.len() > 1;
        self.commit(id, &mut state, events).await?;
        self.retain(id, state);

        counter!(METRIC_STORE_COMMANDS, "op" => "create").increment(1);
        info!(entry = %id, overwrite, "Cache entry created");
        Ok(())
    }

    pub async fn append_chunk(&self, id: &EntryId, chunk: Chunk) -> Result<(), StoreError> {
        let _lock = self.lock(id).await;
        let mut state = self.hydrate(id).await?;

        let sequence = chunk.sequence;
        let event = state.append(id, chunk)?;
        self.commit(id, &mut state, vec![event]).await?;
        self.retain(id, state);

        counter!(METRIC_STORE_COMMANDS, "op" => "append_chunk").increment(1);
        debug!(entry = %id, sequence, "Chunk appended");
        Ok(())
    }

    pub async fn get(&self, id: &EntryId) -> Result<EntrySnapshot, StoreError> {
        let _lock = self.lock(id).await;
        let state = self.hydrate(id).await?;

        let snapshot = state.active().map(|entry| EntrySnapshot {
            id: id.clone(),
            org: entry.org.clone(),
            ttl_seconds: entry.ttl_seconds,
            deleted: entry.deleted,
            total_bytes: entry.total_bytes,
            chunk_count: entry.chunk_count(),
            first_chunk: entry.first_chunk(),
        });
        self.retain(id, state);
        snapshot.ok_or_else(|| StoreError::NotFound { id: id.to_string() })
    }

    pub async fn get_chunk(&self, id: &EntryId, sequence: u32) -> Result<Chunk, StoreError> {
        let _lock = self.lock(id).await;
        let state = self.hydrate(id).await?;

        let chunk = state
            .active()
            .and_then(|entry| entry.chunk(sequence))
            .map(|payload| Chunk::new(sequence, payload.clone()));
        self.retain(id, state);
        chunk.ok_or_else(|| StoreError::NotFound {
            id: format!("{id}#{sequence}"),
        })
    }

    #[instrument(skip(self), fields(entry = %id))]
    pub async fn delete(&self, id: &EntryId) -> Result<DeletedEntry, StoreError> {
        let _lock = self.lock(id).await;
        let mut state = self.hydrate(id).await?;

        let event = match state.delete(id) {
            Ok(event) => event,
            Err(err) => {
                self.retain(id, state);
                return Err(err.into());
            }
        };
        let EntryEvent::Deleted { org, total_bytes } = &event else {
            return Err(StoreError::Invalid(format!(
                "delete decided unexpected `{}` event",
                event.kind()
            )));
        };
        let deleted = DeletedEntry {
            org: org.clone(),
            total_bytes: *total_bytes,
        };
        self.commit(id, &mut state, vec![event]).await?;

        counter!(METRIC_STORE_COMMANDS, "op" => "delete").increment(1);
        info!(entry = %id, total_bytes = deleted.total_bytes, "Cache entry deleted");
        Ok(deleted)
    }
}

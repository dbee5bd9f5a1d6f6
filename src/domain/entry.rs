//! Cached entry aggregate.
//!
//! An entry is rebuilt by folding its journal of [`EntryEvent`]s through
//! [`EntryState::apply`]. Commands never touch state: they return the events
//! to journal, and the caller folds them once the journal write succeeded.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;

use super::error::DomainError;

const ENTITY: &str = "cache entry";

/// Compound identity of one cached object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId {
    cache_name: String,
    key: String,
}

impl EntryId {
    pub fn new(cache_name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            cache_name: cache_name.into(),
            key: key.into(),
        }
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.cache_name, self.key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub sequence: u32,
    pub payload: Bytes,
}

impl Chunk {
    pub fn new(sequence: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            sequence,
            payload: payload.into(),
        }
    }
}

/// Journaled facts about one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryEvent {
    Created {
        org: Option<String>,
        ttl_seconds: Option<u32>,
        total_bytes: i64,
        first_chunk: Bytes,
    },
    ChunkAppended {
        chunk: Chunk,
    },
    Deleted {
        org: Option<String>,
        total_bytes: i64,
    },
}

impl EntryEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            EntryEvent::Created { .. } => "created",
            EntryEvent::ChunkAppended { .. } => "chunk_appended",
            EntryEvent::Deleted { .. } => "deleted",
        }
    }

    /// `Created` and `Deleted` make every earlier event of the entry obsolete.
    pub fn is_boundary(&self) -> bool {
        matches!(self, EntryEvent::Created { .. } | EntryEvent::Deleted { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Absent,
    Active,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub org: Option<String>,
    pub ttl_seconds: Option<u32>,
    pub deleted: bool,
    pub total_bytes: i64,
    chunks: BTreeMap<u32, Bytes>,
}

impl CacheEntry {
    pub fn chunk_count(&self) -> u32 {
        u32::try_from(self.chunks.len()).unwrap_or(u32::MAX)
    }

    pub fn chunk(&self, sequence: u32) -> Option<&Bytes> {
        self.chunks.get(&sequence)
    }

    pub fn first_chunk(&self) -> Bytes {
        self.chunks.get(&0).cloned().unwrap_or_default()
    }

    /// Bytes currently held across all chunks.
    pub fn stored_bytes(&self) -> i64 {
        self.chunks.values().map(|chunk| chunk.len() as i64).sum()
    }
}

/// Parameters of a create command.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub org: Option<String>,
    pub ttl_seconds: Option<u32>,
    pub total_bytes: i64,
    pub first_chunk: Bytes,
}

#[derive(Debug, Clone, Default)]
pub struct EntryState {
    entry: Option<CacheEntry>,
}

impl EntryState {
    /// Rebuild state from a journal, starting at the most recent `Created`.
    pub fn replay(events: &[EntryEvent]) -> Self {
        let start = events
            .iter()
            .rposition(|event| matches!(event, EntryEvent::Created { .. }))
            .unwrap_or(0);
        let mut state = Self::default();
        for event in &events[start..] {
            state.apply(event);
        }
        state
    }

    pub fn apply(&mut self, event: &EntryEvent) {
        match event {
            EntryEvent::Created {
                org,
                ttl_seconds,
                total_bytes,
                first_chunk,
            } => {
                let mut chunks = BTreeMap::new();
                chunks.insert(0, first_chunk.clone());
                self.entry = Some(CacheEntry {
                    org: org.clone(),
                    ttl_seconds: *ttl_seconds,
                    deleted: false,
                    total_bytes: *total_bytes,
                    chunks,
                });
            }
            EntryEvent::ChunkAppended { chunk } => {
                if let Some(entry) = self.entry.as_mut().filter(|entry| !entry.deleted) {
                    entry.chunks.insert(chunk.sequence, chunk.payload.clone());
                }
            }
            EntryEvent::Deleted { .. } => {
                if let Some(entry) = self.entry.as_mut() {
                    entry.deleted = true;
                    entry.chunks.clear();
                }
            }
        }
    }

    pub fn status(&self) -> EntryStatus {
        match &self.entry {
            None => EntryStatus::Absent,
            Some(entry) if entry.deleted => EntryStatus::Deleted,
            Some(_) => EntryStatus::Active,
        }
    }

    pub fn active(&self) -> Option<&CacheEntry> {
        self.entry.as_ref().filter(|entry| !entry.deleted)
    }

    /// Decide the events for a create.
    ///
    /// Overwriting a live entry first retires it with a `Deleted` event carrying
    /// the old size and tenant, so usage is backed out before the new entry is
    /// counted.
    pub fn create(&self, new: NewEntry) -> Result<Vec<EntryEvent>, DomainError> {
        if new.total_bytes < 0 {
            return Err(DomainError::validation("total bytes must not be negative"));
        }
        if new.first_chunk.len() as i64 > new.total_bytes {
            return Err(DomainError::validation(format!(
                "first chunk of {} bytes exceeds declared total of {}",
                new.first_chunk.len(),
                new.total_bytes
            )));
        }

        let mut events = Vec::with_capacity(2);
        if let Some(current) = self.active() {
            events.push(EntryEvent::Deleted {
                org: current.org.clone(),
                total_bytes: current.total_bytes,
            });
        }
        events.push(EntryEvent::Created {
            org: new.org,
            ttl_seconds: new.ttl_seconds,
            total_bytes: new.total_bytes,
            first_chunk: new.first_chunk,
        });
        Ok(events)
    }

    /// Decide the event for an appended chunk.
    ///
    /// Sequences are not required to arrive in order; a repeated sequence
    /// replaces the earlier payload.
    pub fn append(&self, id: &EntryId, chunk: Chunk) -> Result<EntryEvent, DomainError> {
        let entry = self
            .active()
            .ok_or_else(|| DomainError::not_found(ENTITY, id.to_string()))?;
        if chunk.sequence == 0 {
            return Err(DomainError::validation(
                "chunk 0 is only accepted as part of a create",
            ));
        }

        let replaced = entry
            .chunk(chunk.sequence)
            .map(|existing| existing.len() as i64)
            .unwrap_or(0);
        let stored_after = entry.stored_bytes() - replaced + chunk.payload.len() as i64;
        if stored_after > entry.total_bytes {
            return Err(DomainError::validation(format!(
                "chunk {} would grow `{id}` to {stored_after} bytes, above the declared {}",
                chunk.sequence, entry.total_bytes
            )));
        }

        Ok(EntryEvent::ChunkAppended { chunk })
    }

    pub fn delete(&self, id: &EntryId) -> Result<EntryEvent, DomainError> {
        let entry = self
            .active()
            .ok_or_else(|| DomainError::not_found(ENTITY, id.to_string()))?;
        Ok(EntryEvent::Deleted {
            org: entry.org.clone(),
            total_bytes: entry.total_bytes,
        })
    }
}

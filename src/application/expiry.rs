//! TTL expiry scheduling.
//!
//! Each scheduled id owns one tokio timer task. A timer only acts if it is
//! still the registration on record for its id when it fires, so a cancelled
//! or replaced timer that already woke up does nothing.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use metrics::counter;
use time::OffsetDateTime;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::application::repos::{EntryJournal, RepoError};
use crate::application::store::{ChunkedCacheStore, StoreError};
use crate::domain::entry::EntryId;

const METRIC_EXPIRY_FIRED: &str = "keystash_expiry_fired_total";

/// Action run when a TTL elapses.
#[async_trait]
pub trait ExpiryHandler: Send + Sync {
    async fn expire(&self, id: &EntryId) -> Result<(), StoreError>;
}

#[async_trait]
impl ExpiryHandler for ChunkedCacheStore {
    async fn expire(&self, id: &EntryId) -> Result<(), StoreError> {
        self.delete(id).await.map(|_| ())
    }
}

struct Registration {
    generation: u64,
    handle: AbortHandle,
}

pub struct ExpiryScheduler {
    handler: Arc<dyn ExpiryHandler>,
    timers: Arc<DashMap<EntryId, Registration>>,
    generation: AtomicU64,
}

impl ExpiryScheduler {
    pub fn new(handler: Arc<dyn ExpiryHandler>) -> Self {
        Self {
            handler,
            timers: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Register a one-shot expiry for `id`, replacing any pending one.
    pub fn schedule(&self, id: EntryId, ttl: Duration) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let timers = self.timers.clone();
        let handler = self.handler.clone();
        let timer_id = id.clone();

        // The slot stays locked until the registration is in place, so even a
        // zero TTL cannot fire before it can be claimed.
        let slot = self.timers.entry(id);
        let task = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let claimed = timers
                .remove_if(&timer_id, |_, registration| {
                    registration.generation == generation
                })
                .is_some();
            if !claimed {
                return;
            }

            counter!(METRIC_EXPIRY_FIRED).increment(1);
            match handler.expire(&timer_id).await {
                Ok(()) => info!(entry = %timer_id, "Cache entry expired"),
                Err(err) if err.is_not_found() => {
                    debug!(entry = %timer_id, "Expiry found no live entry")
                }
                Err(err) => warn!(entry = %timer_id, error = %err, "Expiry delete failed"),
            }
        });

        let registration = Registration {
            generation,
            handle: task.abort_handle(),
        };
        match slot {
            Entry::Occupied(mut occupied) => occupied.insert(registration).handle.abort(),
            Entry::Vacant(vacant) => {
                vacant.insert(registration);
            }
        }
    }

    /// Re-arm timers for journaled entries that still carry a TTL, counting
    /// from their recorded creation time. Overdue entries expire at once.
    pub async fn restore(&self, journal: &dyn EntryJournal) -> Result<usize, RepoError> {
        let records = journal.expiring().await?;
        let now = OffsetDateTime::now_utc();
        let mut overdue = 0usize;
        for record in &records {
            let elapsed = Duration::try_from(now - record.created_at).unwrap_or(Duration::ZERO);
            let remaining = Duration::from_secs(record.ttl_seconds).saturating_sub(elapsed);
            if remaining.is_zero() {
                overdue += 1;
            }
            self.schedule(record.id.clone(), remaining);
        }
        info!(restored = records.len(), overdue, "Expiry timers restored");
        Ok(records.len())
    }

    /// Drop the pending expiry for `id`. Returns whether one existed.
    pub fn cancel(&self, id: &EntryId) -> bool {
        match self.timers.remove(id) {
            Some((_, registration)) => {
                registration.handle.abort();
                debug!(entry = %id, "Expiry cancelled");
                true
            }
            None => false,
        }
    }

    pub fn is_scheduled(&self, id: &EntryId) -> bool {
        self.timers.contains_key(id)
    }

    pub fn pending(&self) -> usize {
        self.timers.len()
    }
}

impl Drop for ExpiryScheduler {
    fn drop(&mut self) {
        for registration in self.timers.iter() {
            registration.handle.abort();
        }
    }
}

//! Store lifecycle events.
//!
//! The journal records an outbox row next to every `Created` and `Deleted`
//! event in the same write, so pending projection work survives a restart.
//! [`EventQueue`] reads that outbox for the consumer and wakes it when the
//! store commits. Delivery is at-least-once; nothing downstream deduplicates.

use std::sync::Arc;

use metrics::gauge;
use time::OffsetDateTime;
use tokio::sync::Notify;
use tracing::debug;

use crate::application::repos::{ProjectionOutbox, RepoError};
use crate::domain::entry::{EntryEvent, EntryId};

const METRIC_EVENT_QUEUE_LEN: &str = "keystash_event_queue_len";

/// Outbox sequence number. Increases with every recorded event.
pub type Epoch = u64;

#[derive(Debug, Clone)]
pub struct StoreEvent {
    pub epoch: Epoch,
    pub kind: EventKind,
    pub timestamp: OffsetDateTime,
}

impl StoreEvent {
    pub fn new(kind: EventKind, epoch: Epoch) -> Self {
        Self {
            epoch,
            kind,
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    EntryCreated {
        cache_name: String,
        key: String,
        org: Option<String>,
        total_bytes: i64,
    },
    EntryDeleted {
        cache_name: String,
        key: String,
        org: Option<String>,
        total_bytes: i64,
    },
}

impl EventKind {
    /// Outbox record for `event`; chunk appends change neither read model.
    pub fn from_entry_event(id: &EntryId, event: &EntryEvent) -> Option<Self> {
        let cache_name = id.cache_name().to_string();
        let key = id.key().to_string();
        match event {
            EntryEvent::Created {
                org, total_bytes, ..
            } => Some(EventKind::EntryCreated {
                cache_name,
                key,
                org: org.clone(),
                total_bytes: *total_bytes,
            }),
            EntryEvent::ChunkAppended { .. } => None,
            EntryEvent::Deleted { org, total_bytes } => Some(EventKind::EntryDeleted {
                cache_name,
                key,
                org: org.clone(),
                total_bytes: *total_bytes,
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::EntryCreated { .. } => "entry_created",
            EventKind::EntryDeleted { .. } => "entry_deleted",
        }
    }

    pub fn entry(&self) -> (&str, &str) {
        match self {
            EventKind::EntryCreated {
                cache_name, key, ..
            }
            | EventKind::EntryDeleted {
                cache_name, key, ..
            } => (cache_name, key),
        }
    }
}

/// Reader over the durable outbox of store events awaiting projection.
pub struct EventQueue {
    outbox: Arc<dyn ProjectionOutbox>,
    wake: Notify,
}

impl EventQueue {
    pub fn new(outbox: Arc<dyn ProjectionOutbox>) -> Self {
        Self {
            outbox,
            wake: Notify::new(),
        }
    }

    /// Signal that the journal recorded new events.
    pub fn published(&self) {
        self.wake.notify_one();
    }

    /// Resolve once [`published`](Self::published) was called since the last wait.
    pub async fn notified(&self) {
        self.wake.notified().await;
    }

    /// Oldest pending events, at most `limit`, in epoch order.
    pub async fn pending(&self, limit: usize) -> Result<Vec<StoreEvent>, RepoError> {
        let events = self.outbox.pending(limit).await?;
        debug!(count = events.len(), "Store events read from outbox");
        Ok(events)
    }

    /// Remove `events` from the outbox once they were projected.
    pub async fn acknowledge(&self, events: &[StoreEvent]) -> Result<(), RepoError> {
        let epochs: Vec<Epoch> = events.iter().map(|event| event.epoch).collect();
        self.outbox.acknowledge(&epochs).await?;
        let backlog = self.outbox.backlog().await?;
        gauge!(METRIC_EVENT_QUEUE_LEN).set(backlog as f64);
        Ok(())
    }

    /// Events recorded but not yet acknowledged.
    pub async fn len(&self) -> Result<u64, RepoError> {
        self.outbox.backlog().await
    }

    pub async fn is_empty(&self) -> Result<bool, RepoError> {
        Ok(self.len().await? == 0)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::application::repos::EntryJournal;
    use crate::domain::entry::Chunk;
    use crate::infra::memory::MemoryRepositories;

    fn created() -> EntryEvent {
        EntryEvent::Created {
            org: None,
            ttl_seconds: None,
            total_bytes: 1,
            first_chunk: Bytes::from_static(b"x"),
        }
    }

    #[tokio::test]
    async fn pending_is_ordered_and_bounded() {
        let repos = Arc::new(MemoryRepositories::new());
        let queue = EventQueue::new(repos.clone());
        for key in ["a", "b", "c"] {
            repos
                .append(&EntryId::new("sessions", key), &[created()])
                .await
                .expect("append");
        }

        let events = queue.pending(2).await.expect("pending");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind.entry(), ("sessions", "a"));
        assert_eq!(events[1].kind.entry(), ("sessions", "b"));
        assert!(events[0].epoch < events[1].epoch);

        queue.acknowledge(&events).await.expect("ack");
        assert_eq!(queue.len().await.expect("len"), 1);
        let rest = queue.pending(100).await.expect("pending");
        assert_eq!(rest[0].kind.entry(), ("sessions", "c"));
    }

    #[tokio::test]
    async fn unacknowledged_events_are_read_again() {
        let repos = Arc::new(MemoryRepositories::new());
        let queue = EventQueue::new(repos.clone());
        repos
            .append(&EntryId::new("sessions", "a"), &[created()])
            .await
            .expect("append");

        let first = queue.pending(10).await.expect("pending");
        let again = queue.pending(10).await.expect("pending");
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].epoch, again[0].epoch);
        assert!(!queue.is_empty().await.expect("is_empty"));
    }

    #[tokio::test]
    async fn published_wakes_a_waiting_consumer() {
        let repos = Arc::new(MemoryRepositories::new());
        let queue = Arc::new(EventQueue::new(repos));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.notified().await })
        };

        queue.published();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("woken")
            .expect("join");
    }

    #[test]
    fn chunk_appends_have_no_outbox_record() {
        let id = EntryId::new("sessions", "user-1");
        let appended = EntryEvent::ChunkAppended {
            chunk: Chunk::new(3, Bytes::from_static(b"xyz")),
        };
        assert_eq!(EventKind::from_entry_event(&id, &appended), None);

        let deleted = EntryEvent::Deleted {
            org: Some("acme".to_string()),
            total_bytes: 9,
        };
        assert_eq!(
            EventKind::from_entry_event(&id, &deleted),
            Some(EventKind::EntryDeleted {
                cache_name: "sessions".to_string(),
                key: "user-1".to_string(),
                org: Some("acme".to_string()),
                total_bytes: 9,
            })
        );
    }
}

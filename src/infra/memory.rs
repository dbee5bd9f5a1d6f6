//! In-process repository implementations.
//!
//! Used when no database URL is configured and throughout the test suite.
//! Nothing here survives a restart.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::application::repos::{
    CacheNameRepo, DeletionJobRepo, EntryJournal, ExpiryRecord, KeyIndexRepo, ProjectionOutbox,
    RepoError, UsageRepo,
};
use crate::domain::cache_name::CacheNameRecord;
use crate::domain::deletion::DeletionJob;
use crate::domain::entry::{EntryEvent, EntryId};
use crate::domain::usage::{TenantUsage, UsageDelta};
use crate::projection::{Epoch, EventKind, StoreEvent};
use crate::util::lock::mutex_lock;

const SOURCE: &str = "infra::memory";

#[derive(Debug, Clone)]
struct Recorded {
    event: EntryEvent,
    recorded_at: OffsetDateTime,
}

#[derive(Default)]
struct Outbox {
    next_epoch: Epoch,
    events: BTreeMap<Epoch, StoreEvent>,
}

#[derive(Default)]
pub struct MemoryRepositories {
    journal: Mutex<HashMap<EntryId, Vec<Recorded>>>,
    outbox: Mutex<Outbox>,
    cache_names: Mutex<HashMap<String, CacheNameRecord>>,
    key_index: Mutex<BTreeMap<String, BTreeSet<String>>>,
    usage: Mutex<HashMap<String, TenantUsage>>,
    deletion_jobs: Mutex<HashMap<Uuid, DeletionJob>>,
}

impl MemoryRepositories {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of journaled events held for `id`.
    pub fn journal_len(&self, id: &EntryId) -> usize {
        mutex_lock(&self.journal, SOURCE, "journal_len")
            .get(id)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl EntryJournal for MemoryRepositories {
    async fn load(&self, id: &EntryId) -> Result<Vec<EntryEvent>, RepoError> {
        Ok(mutex_lock(&self.journal, SOURCE, "journal.load")
            .get(id)
            .map(|log| log.iter().map(|recorded| recorded.event.clone()).collect())
            .unwrap_or_default())
    }

    async fn append(&self, id: &EntryId, events: &[EntryEvent]) -> Result<(), RepoError> {
        let recorded_at = OffsetDateTime::now_utc();
        let mut journal = mutex_lock(&self.journal, SOURCE, "journal.append");
        let mut outbox = mutex_lock(&self.outbox, SOURCE, "journal.append.outbox");

        let log = journal.entry(id.clone()).or_default();
        let kept = match events.iter().rposition(EntryEvent::is_boundary) {
            Some(boundary) => {
                log.clear();
                &events[boundary..]
            }
            None => events,
        };
        log.extend(kept.iter().map(|event| Recorded {
            event: event.clone(),
            recorded_at,
        }));

        for kind in events
            .iter()
            .filter_map(|event| EventKind::from_entry_event(id, event))
        {
            let epoch = outbox.next_epoch;
            outbox.next_epoch += 1;
            outbox.events.insert(epoch, StoreEvent::new(kind, epoch));
        }
        Ok(())
    }

    async fn expiring(&self) -> Result<Vec<ExpiryRecord>, RepoError> {
        let journal = mutex_lock(&self.journal, SOURCE, "journal.expiring");
        let mut records: Vec<_> = journal
            .iter()
            .filter_map(|(id, log)| match log.first() {
                Some(Recorded {
                    event:
                        EntryEvent::Created {
                            ttl_seconds: Some(ttl),
                            ..
                        },
                    recorded_at,
                }) => Some(ExpiryRecord {
                    id: id.clone(),
                    ttl_seconds: u64::from(*ttl),
                    created_at: *recorded_at,
                }),
                _ => None,
            })
            .collect();
        records.sort_by_key(|record| record.created_at);
        Ok(records)
    }
}

#[async_trait]
impl ProjectionOutbox for MemoryRepositories {
    async fn pending(&self, limit: usize) -> Result<Vec<StoreEvent>, RepoError> {
        Ok(mutex_lock(&self.outbox, SOURCE, "outbox.pending")
            .events
            .values()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn acknowledge(&self, epochs: &[Epoch]) -> Result<(), RepoError> {
        let mut outbox = mutex_lock(&self.outbox, SOURCE, "outbox.acknowledge");
        for epoch in epochs {
            outbox.events.remove(epoch);
        }
        Ok(())
    }

    async fn backlog(&self) -> Result<u64, RepoError> {
        Ok(mutex_lock(&self.outbox, SOURCE, "outbox.backlog").events.len() as u64)
    }
}

#[async_trait]
impl CacheNameRepo for MemoryRepositories {
    async fn find(&self, cache_name: &str) -> Result<Option<CacheNameRecord>, RepoError> {
        Ok(mutex_lock(&self.cache_names, SOURCE, "cache_names.find")
            .get(cache_name)
            .cloned())
    }

    async fn upsert(&self, record: &CacheNameRecord) -> Result<(), RepoError> {
        mutex_lock(&self.cache_names, SOURCE, "cache_names.upsert")
            .insert(record.cache_name.clone(), record.clone());
        Ok(())
    }
}

#[async_trait]
impl KeyIndexRepo for MemoryRepositories {
    async fn upsert_key(&self, cache_name: &str, key: &str) -> Result<(), RepoError> {
        mutex_lock(&self.key_index, SOURCE, "key_index.upsert")
            .entry(cache_name.to_string())
            .or_default()
            .insert(key.to_string());
        Ok(())
    }

    async fn remove_key(&self, cache_name: &str, key: &str) -> Result<(), RepoError> {
        let mut index = mutex_lock(&self.key_index, SOURCE, "key_index.remove");
        if let Some(keys) = index.get_mut(cache_name) {
            keys.remove(key);
            if keys.is_empty() {
                index.remove(cache_name);
            }
        }
        Ok(())
    }

    async fn list_keys(&self, cache_name: &str) -> Result<Vec<String>, RepoError> {
        Ok(mutex_lock(&self.key_index, SOURCE, "key_index.list")
            .get(cache_name)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl UsageRepo for MemoryRepositories {
    async fn apply_delta(&self, org: &str, delta: UsageDelta) -> Result<(), RepoError> {
        mutex_lock(&self.usage, SOURCE, "usage.apply_delta")
            .entry(org.to_string())
            .or_insert_with(|| TenantUsage::empty(org))
            .apply(delta);
        Ok(())
    }

    async fn get(&self, org: &str) -> Result<TenantUsage, RepoError> {
        Ok(mutex_lock(&self.usage, SOURCE, "usage.get")
            .get(org)
            .cloned()
            .unwrap_or_else(|| TenantUsage::empty(org)))
    }

    async fn reset(&self, org: &str) -> Result<(), RepoError> {
        mutex_lock(&self.usage, SOURCE, "usage.reset")
            .insert(org.to_string(), TenantUsage::empty(org));
        Ok(())
    }
}

#[async_trait]
impl DeletionJobRepo for MemoryRepositories {
    async fn save(&self, job: &DeletionJob) -> Result<(), RepoError> {
        mutex_lock(&self.deletion_jobs, SOURCE, "deletion_jobs.save").insert(job.job_id, job.clone());
        Ok(())
    }

    async fn find(&self, job_id: Uuid) -> Result<Option<DeletionJob>, RepoError> {
        Ok(mutex_lock(&self.deletion_jobs, SOURCE, "deletion_jobs.find")
            .get(&job_id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::domain::entry::Chunk;

    fn created(payload: &'static [u8]) -> EntryEvent {
        EntryEvent::Created {
            org: None,
            ttl_seconds: None,
            total_bytes: payload.len() as i64,
            first_chunk: Bytes::from_static(payload),
        }
    }

    fn ttl_created(ttl_seconds: u32) -> EntryEvent {
        EntryEvent::Created {
            org: None,
            ttl_seconds: Some(ttl_seconds),
            total_bytes: 1,
            first_chunk: Bytes::from_static(b"x"),
        }
    }

    fn deleted(total_bytes: i64) -> EntryEvent {
        EntryEvent::Deleted {
            org: None,
            total_bytes,
        }
    }

    #[tokio::test]
    async fn boundary_events_compact_history() {
        let repos = MemoryRepositories::new();
        let id = EntryId::new("sessions", "a");

        repos.append(&id, &[created(b"one")]).await.expect("append");
        repos
            .append(
                &id,
                &[EntryEvent::ChunkAppended {
                    chunk: Chunk::new(1, Bytes::from_static(b"two")),
                }],
            )
            .await
            .expect("append");
        assert_eq!(repos.journal_len(&id), 2);

        repos.append(&id, &[deleted(6)]).await.expect("append");
        assert_eq!(repos.journal_len(&id), 1);
        assert_eq!(
            repos.load(&id).await.expect("load"),
            vec![deleted(6)],
            "payloads are gone once the entry is deleted"
        );

        repos.append(&id, &[created(b"three")]).await.expect("append");
        assert_eq!(repos.journal_len(&id), 1);
    }

    #[tokio::test]
    async fn outbox_records_creates_and_deletes_only() {
        let repos = MemoryRepositories::new();
        let id = EntryId::new("sessions", "a");

        repos.append(&id, &[created(b"one")]).await.expect("append");
        repos
            .append(
                &id,
                &[EntryEvent::ChunkAppended {
                    chunk: Chunk::new(1, Bytes::from_static(b"two")),
                }],
            )
            .await
            .expect("append");
        repos.append(&id, &[deleted(6)]).await.expect("append");

        let pending = repos.pending(10).await.expect("pending");
        let kinds: Vec<_> = pending.iter().map(|event| event.kind.as_str()).collect();
        assert_eq!(kinds, vec!["entry_created", "entry_deleted"]);

        repos.acknowledge(&[pending[0].epoch]).await.expect("ack");
        assert_eq!(repos.backlog().await.expect("backlog"), 1);
    }

    #[tokio::test]
    async fn expiring_lists_live_entries_with_ttl() {
        let repos = MemoryRepositories::new();
        let live = EntryId::new("sessions", "live");
        let gone = EntryId::new("sessions", "gone");
        let forever = EntryId::new("sessions", "forever");

        repos.append(&live, &[ttl_created(30)]).await.expect("append");
        repos.append(&gone, &[ttl_created(30)]).await.expect("append");
        repos.append(&gone, &[deleted(1)]).await.expect("append");
        repos.append(&forever, &[created(b"x")]).await.expect("append");

        let records = repos.expiring().await.expect("expiring");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, live);
        assert_eq!(records[0].ttl_seconds, 30);
    }

    #[tokio::test]
    async fn key_index_lists_sorted_and_forgets_empty_names() {
        let repos = MemoryRepositories::new();
        repos.upsert_key("sessions", "b").await.expect("upsert");
        repos.upsert_key("sessions", "a").await.expect("upsert");
        repos.upsert_key("sessions", "a").await.expect("upsert");

        assert_eq!(
            repos.list_keys("sessions").await.expect("list"),
            vec!["a".to_string(), "b".to_string()]
        );

        repos.remove_key("sessions", "a").await.expect("remove");
        repos.remove_key("sessions", "b").await.expect("remove");
        assert!(repos.list_keys("sessions").await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn usage_defaults_to_zero_and_resets() {
        let repos = MemoryRepositories::new();
        assert_eq!(repos.get("acme").await.expect("get").cache_count, 0);

        repos
            .apply_delta("acme", UsageDelta::created(10))
            .await
            .expect("apply");
        assert_eq!(repos.get("acme").await.expect("get").total_bytes_cached, 10);

        repos.reset("acme").await.expect("reset");
        assert_eq!(repos.get("acme").await.expect("get"), TenantUsage::empty("acme"));
    }
}

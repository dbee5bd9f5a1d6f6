//! Projection consumer.
//!
//! Reads store events from the outbox and folds them into the key index and
//! the usage ledger. A batch is acknowledged once applied; failed read model
//! writes inside it are logged, not retried. A crash between applying and
//! acknowledging replays the batch.

use std::sync::Arc;
use std::time::Instant;

use metrics::histogram;
use tracing::{error, info, instrument, warn};

use crate::application::repos::{KeyIndexRepo, RepoError};

use super::config::ProjectionConfig;
use super::events::{EventQueue, StoreEvent};
use super::ledger::UsageLedger;
use super::planner::{IndexAction, ProjectionPlan};

const METRIC_PROJECTION_CONSUME_MS: &str = "keystash_projection_consume_ms";

pub struct ProjectionConsumer {
    config: ProjectionConfig,
    queue: Arc<EventQueue>,
    index: Arc<dyn KeyIndexRepo>,
    ledger: Arc<UsageLedger>,
}

impl ProjectionConsumer {
    pub fn new(
        config: ProjectionConfig,
        queue: Arc<EventQueue>,
        index: Arc<dyn KeyIndexRepo>,
        ledger: Arc<UsageLedger>,
    ) -> Self {
        Self {
            config,
            queue,
            index,
            ledger,
        }
    }

    /// Consume one batch of pending events.
    ///
    /// Returns the number of events applied.
    #[instrument(skip(self))]
    pub async fn consume(&self) -> Result<usize, RepoError> {
        let events = self.queue.pending(self.config.consume_batch_limit).await?;
        if events.is_empty() {
            return Ok(0);
        }
        self.apply(&events).await;
        self.queue.acknowledge(&events).await?;
        Ok(events.len())
    }

    /// Consume until the outbox is empty or unreadable. Returns the number of
    /// batches applied.
    pub async fn consume_all(&self) -> usize {
        let mut batches = 0;
        loop {
            match self.consume().await {
                Ok(0) => break,
                Ok(_) => batches += 1,
                Err(err) => {
                    error!(error = %err, "Projection outbox unavailable");
                    break;
                }
            }
        }
        batches
    }

    /// Fold an already-drained batch into the read models.
    pub async fn apply(&self, events: &[StoreEvent]) {
        let started_at = Instant::now();
        let plan = ProjectionPlan::from_events(events, self.config.usage_enabled);
        info!(event_count = events.len(), plan = %plan, "Projection starting");

        let mut index_failures = 0usize;
        for ((cache_name, key), action) in &plan.index {
            let result = match action {
                IndexAction::Upsert => self.index.upsert_key(cache_name, key).await,
                IndexAction::Remove => self.index.remove_key(cache_name, key).await,
            };
            if let Err(err) = result {
                index_failures += 1;
                warn!(
                    cache_name = %cache_name,
                    key = %key,
                    action = ?action,
                    error = %err,
                    "Key index update lost"
                );
            }
        }

        let tenants = self.ledger.apply(&plan.usage).await;

        info!(
            event_count = events.len(),
            index_writes = plan.index.len() - index_failures,
            index_failures,
            tenants,
            "Projection complete"
        );
        histogram!(METRIC_PROJECTION_CONSUME_MS)
            .record(started_at.elapsed().as_secs_f64() * 1000.0);
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    pub fn config(&self) -> &ProjectionConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::application::repos::UsageRepo;
    use crate::application::store::ChunkedCacheStore;
    use crate::domain::entry::{EntryId, NewEntry};
    use crate::infra::memory::MemoryRepositories;
    use crate::projection::EventKind;

    struct Harness {
        repos: Arc<MemoryRepositories>,
        store: ChunkedCacheStore,
        consumer: ProjectionConsumer,
    }

    fn harness(config: ProjectionConfig) -> Harness {
        let repos = Arc::new(MemoryRepositories::new());
        let queue = Arc::new(EventQueue::new(repos.clone()));
        let store = ChunkedCacheStore::new(repos.clone(), queue.clone());
        let ledger = Arc::new(UsageLedger::new(repos.clone()));
        let consumer = ProjectionConsumer::new(config, queue, repos.clone(), ledger);
        Harness {
            repos,
            store,
            consumer,
        }
    }

    fn entry(org: &str, len: usize) -> NewEntry {
        NewEntry {
            org: Some(org.to_string()),
            ttl_seconds: None,
            total_bytes: len as i64,
            first_chunk: Bytes::from(vec![7u8; len]),
        }
    }

    #[tokio::test]
    async fn consume_empty_outbox_applies_nothing() {
        let h = harness(ProjectionConfig::default());
        assert_eq!(h.consumer.consume().await.expect("consume"), 0);
    }

    #[tokio::test]
    async fn create_and_delete_maintain_index_and_usage() {
        let h = harness(ProjectionConfig::default());
        let a = EntryId::new("sessions", "a");
        let b = EntryId::new("sessions", "b");

        h.store.create(&a, entry("acme", 10)).await.expect("create a");
        h.store.create(&b, entry("acme", 5)).await.expect("create b");
        h.consumer.consume_all().await;

        assert_eq!(
            h.repos.list_keys("sessions").await.expect("keys"),
            vec!["a".to_string(), "b".to_string()]
        );
        let usage = h.repos.get("acme").await.expect("usage");
        assert_eq!((usage.cache_count, usage.total_bytes_cached), (2, 15));

        h.store.delete(&a).await.expect("delete");
        h.consumer.consume_all().await;

        assert_eq!(
            h.repos.list_keys("sessions").await.expect("keys"),
            vec!["b".to_string()]
        );
        let usage = h.repos.get("acme").await.expect("usage");
        assert_eq!((usage.cache_count, usage.total_bytes_cached), (1, 5));
    }

    #[tokio::test]
    async fn overwrite_changes_usage_by_size_difference() {
        let h = harness(ProjectionConfig::default());
        let id = EntryId::new("sessions", "a");

        h.store.create(&id, entry("acme", 100)).await.expect("create");
        h.consumer.consume_all().await;
        let before = h.repos.get("acme").await.expect("usage");

        h.store.create(&id, entry("acme", 40)).await.expect("overwrite");
        h.consumer.consume_all().await;
        let after = h.repos.get("acme").await.expect("usage");

        assert_eq!(after.total_bytes_cached - before.total_bytes_cached, -60);
        assert_eq!(after.cache_count, before.cache_count);
    }

    #[tokio::test]
    async fn duplicate_delivery_double_counts() {
        let h = harness(ProjectionConfig::default());
        let events = vec![StoreEvent::new(
            EventKind::EntryCreated {
                cache_name: "sessions".to_string(),
                key: "a".to_string(),
                org: Some("acme".to_string()),
                total_bytes: 10,
            },
            0,
        )];

        h.consumer.apply(&events).await;
        h.consumer.apply(&events).await;

        let usage = h.repos.get("acme").await.expect("usage");
        assert_eq!((usage.cache_count, usage.total_bytes_cached), (2, 20));
        assert_eq!(h.repos.list_keys("sessions").await.expect("keys").len(), 1);
    }

    #[tokio::test]
    async fn disabled_ledger_still_maintains_index() {
        let h = harness(ProjectionConfig {
            usage_enabled: false,
            ..ProjectionConfig::default()
        });
        let id = EntryId::new("sessions", "a");

        h.store.create(&id, entry("acme", 10)).await.expect("create");
        h.consumer.consume_all().await;

        assert_eq!(h.repos.get("acme").await.expect("usage").cache_count, 0);
        assert_eq!(h.repos.list_keys("sessions").await.expect("keys").len(), 1);
    }

    #[tokio::test]
    async fn consume_respects_batch_limit() {
        let h = harness(ProjectionConfig {
            consume_batch_limit: 2,
            ..ProjectionConfig::default()
        });
        for key in ["a", "b", "c", "d", "e"] {
            h.store
                .create(&EntryId::new("sessions", key), entry("acme", 1))
                .await
                .expect("create");
        }

        assert_eq!(h.consumer.queue().len().await.expect("len"), 5);
        assert_eq!(h.consumer.consume().await.expect("consume"), 2);
        assert_eq!(h.consumer.queue().len().await.expect("len"), 3);
    }

    #[tokio::test]
    async fn pending_work_survives_a_consumer_restart() {
        let repos = Arc::new(MemoryRepositories::new());
        {
            let queue = Arc::new(EventQueue::new(repos.clone()));
            let store = ChunkedCacheStore::new(repos.clone(), queue);
            store
                .create(&EntryId::new("sessions", "a"), entry("acme", 10))
                .await
                .expect("create");
        }

        let queue = Arc::new(EventQueue::new(repos.clone()));
        let ledger = Arc::new(UsageLedger::new(repos.clone()));
        let consumer =
            ProjectionConsumer::new(ProjectionConfig::default(), queue, repos.clone(), ledger);
        assert_eq!(consumer.consume_all().await, 1);

        assert_eq!(
            repos.list_keys("sessions").await.expect("keys"),
            vec!["a".to_string()]
        );
        assert_eq!(repos.get("acme").await.expect("usage").total_bytes_cached, 10);
        assert!(consumer.queue().is_empty().await.expect("is_empty"));
    }
}

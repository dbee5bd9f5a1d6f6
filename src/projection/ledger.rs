//! Tenant usage ledger.
//!
//! Turns entry lifecycle events into signed counter changes per tenant.
//! Deliveries are not deduplicated: an event seen twice is counted twice.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, error};

use crate::application::repos::{RepoError, UsageRepo};
use crate::domain::usage::{TenantUsage, UsageDelta};

use super::events::EventKind;

/// Usage change implied by one event, if it names a tenant.
pub fn usage_delta(kind: &EventKind) -> Option<(&str, UsageDelta)> {
    match kind {
        EventKind::EntryCreated {
            org: Some(org),
            total_bytes,
            ..
        } => Some((org.as_str(), UsageDelta::created(*total_bytes))),
        EventKind::EntryDeleted {
            org: Some(org),
            total_bytes,
            ..
        } => Some((org.as_str(), UsageDelta::deleted(*total_bytes))),
        EventKind::EntryCreated { org: None, .. } | EventKind::EntryDeleted { org: None, .. } => {
            None
        }
    }
}

pub struct UsageLedger {
    repo: Arc<dyn UsageRepo>,
}

impl UsageLedger {
    pub fn new(repo: Arc<dyn UsageRepo>) -> Self {
        Self { repo }
    }

    /// Apply per-tenant deltas. Failures are logged and dropped.
    ///
    /// Returns the number of tenants updated.
    pub async fn apply(&self, deltas: &BTreeMap<String, UsageDelta>) -> usize {
        let mut applied = 0;
        for (org, delta) in deltas {
            if delta.is_zero() {
                continue;
            }
            match self.repo.apply_delta(org, *delta).await {
                Ok(()) => {
                    applied += 1;
                    debug!(
                        org = %org,
                        cache_count = delta.cache_count,
                        total_bytes = delta.total_bytes,
                        "Tenant usage updated"
                    );
                }
                Err(err) => error!(
                    org = %org,
                    cache_count = delta.cache_count,
                    total_bytes = delta.total_bytes,
                    error = %err,
                    "Tenant usage update lost"
                ),
            }
        }
        applied
    }

    pub async fn usage(&self, org: &str) -> Result<TenantUsage, RepoError> {
        self.repo.get(org).await
    }

    pub async fn reset(&self, org: &str) -> Result<(), RepoError> {
        self.repo.reset(org).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::memory::MemoryRepositories;

    #[test]
    fn deltas_follow_event_kind() {
        let created = EventKind::EntryCreated {
            cache_name: "c".to_string(),
            key: "k".to_string(),
            org: Some("acme".to_string()),
            total_bytes: 42,
        };
        assert_eq!(
            usage_delta(&created),
            Some(("acme", UsageDelta::created(42)))
        );

        let anonymous = EventKind::EntryDeleted {
            cache_name: "c".to_string(),
            key: "k".to_string(),
            org: None,
            total_bytes: 42,
        };
        assert_eq!(usage_delta(&anonymous), None);
    }

    #[tokio::test]
    async fn zero_deltas_are_skipped() {
        let repos = Arc::new(MemoryRepositories::new());
        let ledger = UsageLedger::new(repos);

        let mut deltas = BTreeMap::new();
        deltas.insert("acme".to_string(), UsageDelta::default());
        deltas.insert("globex".to_string(), UsageDelta::created(5));

        assert_eq!(ledger.apply(&deltas).await, 1);
        assert_eq!(
            ledger.usage("globex").await.expect("usage").total_bytes_cached,
            5
        );
    }
}

//! Projection plan generation.
//!
//! Folds a drained batch of store events into the index writes and usage
//! deltas that bring the read models up to date.

use std::collections::BTreeMap;
use std::fmt;

use crate::domain::usage::UsageDelta;

use super::events::{Epoch, EventKind, StoreEvent};
use super::ledger::usage_delta;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexAction {
    Upsert,
    Remove,
}

/// Writes derived from one batch of events.
#[derive(Debug, Default)]
pub struct ProjectionPlan {
    /// Final index action per `(cache_name, key)`; the highest epoch wins.
    pub index: BTreeMap<(String, String), IndexAction>,
    /// Summed usage delta per tenant. Every event counts, repeated ones included.
    pub usage: BTreeMap<String, UsageDelta>,
}

impl fmt::Display for ProjectionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let removals = self
            .index
            .values()
            .filter(|action| **action == IndexAction::Remove)
            .count();
        write!(
            f,
            "ProjectionPlan {{ index_upserts: {}, index_removals: {}, tenants: {} }}",
            self.index.len() - removals,
            removals,
            self.usage.len(),
        )
    }
}

impl ProjectionPlan {
    pub fn from_events(events: &[StoreEvent], usage_enabled: bool) -> Self {
        let mut plan = Self::default();
        let mut latest: BTreeMap<(String, String), (Epoch, IndexAction)> = BTreeMap::new();

        for event in events {
            let action = match &event.kind {
                EventKind::EntryCreated { .. } => IndexAction::Upsert,
                EventKind::EntryDeleted { .. } => IndexAction::Remove,
            };
            let (cache_name, key) = event.kind.entry();
            latest
                .entry((cache_name.to_string(), key.to_string()))
                .and_modify(|(epoch, current)| {
                    if event.epoch > *epoch {
                        *epoch = event.epoch;
                        *current = action;
                    }
                })
                .or_insert((event.epoch, action));

            if usage_enabled && let Some((org, delta)) = usage_delta(&event.kind) {
                let merged = plan.usage.entry(org.to_string()).or_default();
                *merged = merged.merge(delta);
            }
        }

        plan.index = latest
            .into_iter()
            .map(|(id, (_, action))| (id, action))
            .collect();
        plan
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty() && self.usage.is_empty()
    }
}

//! Bulk deletion job state machine.
//!
//! A job walks `CollectKeys -> DeleteBatch* -> DeleteCacheNameRecord -> End`.
//! Every method here is a pure transition; persisting the job between steps
//! is the driver's concern.

use std::fmt;
use std::str::FromStr;

use time::OffsetDateTime;
use uuid::Uuid;

use super::error::DomainError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeletionStep {
    CollectKeys,
    DeleteBatch,
    DeleteCacheNameRecord,
    End,
}

impl DeletionStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeletionStep::CollectKeys => "collect_keys",
            DeletionStep::DeleteBatch => "delete_batch",
            DeletionStep::DeleteCacheNameRecord => "delete_cache_name_record",
            DeletionStep::End => "end",
        }
    }
}

impl fmt::Display for DeletionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeletionStep {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "collect_keys" => Ok(DeletionStep::CollectKeys),
            "delete_batch" => Ok(DeletionStep::DeleteBatch),
            "delete_cache_name_record" => Ok(DeletionStep::DeleteCacheNameRecord),
            "end" => Ok(DeletionStep::End),
            other => Err(DomainError::validation(format!(
                "unknown deletion step `{other}`"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeletionStatus {
    Empty,
    InProgress,
    Complete,
}

impl DeletionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeletionStatus::Empty => "empty",
            DeletionStatus::InProgress => "in_progress",
            DeletionStatus::Complete => "complete",
        }
    }
}

impl FromStr for DeletionStatus {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "empty" => Ok(DeletionStatus::Empty),
            "in_progress" => Ok(DeletionStatus::InProgress),
            "complete" => Ok(DeletionStatus::Complete),
            other => Err(DomainError::validation(format!(
                "unknown deletion status `{other}`"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionJob {
    pub job_id: Uuid,
    pub cache_name: String,
    pub flush_only: bool,
    pub key_snapshot: Vec<String>,
    /// Offset of the next unprocessed key in `key_snapshot`.
    pub cursor: usize,
    pub retry_count: u32,
    pub step: DeletionStep,
    pub status: DeletionStatus,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl DeletionJob {
    pub fn new(cache_name: impl Into<String>, flush_only: bool) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            job_id: Uuid::new_v4(),
            cache_name: cache_name.into(),
            flush_only,
            key_snapshot: Vec::new(),
            cursor: 0,
            retry_count: 0,
            step: DeletionStep::CollectKeys,
            status: DeletionStatus::Empty,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == DeletionStatus::Complete
    }

    pub fn remaining(&self) -> usize {
        self.key_snapshot.len().saturating_sub(self.cursor)
    }

    /// Record a fresh key snapshot and rewind the cursor.
    pub fn keys_collected(&mut self, keys: Vec<String>) {
        self.key_snapshot = keys;
        self.cursor = 0;
        self.status = DeletionStatus::InProgress;
        self.step = if self.key_snapshot.is_empty() {
            self.after_last_batch()
        } else {
            DeletionStep::DeleteBatch
        };
        self.touch();
    }

    /// Keys of the batch the next `DeleteBatch` step works on.
    pub fn next_batch(&self, block_size: usize) -> &[String] {
        let start = self.cursor.min(self.key_snapshot.len());
        let end = start + block_size.min(self.remaining());
        &self.key_snapshot[start..end]
    }

    pub fn batch_succeeded(&mut self, deleted: usize) {
        self.cursor = (self.cursor + deleted).min(self.key_snapshot.len());
        if self.remaining() == 0 {
            self.step = self.after_last_batch();
        }
        self.touch();
    }

    /// Record a failed batch. The cursor stays put; the job either restarts
    /// from key collection or, once retries are used up, ends without
    /// touching the cache name record.
    pub fn batch_failed(&mut self, max_retries: u32) {
        self.retry_count += 1;
        self.step = if self.retry_count >= max_retries {
            DeletionStep::End
        } else {
            DeletionStep::CollectKeys
        };
        self.touch();
    }

    pub fn retries_exhausted(&self, max_retries: u32) -> bool {
        self.retry_count >= max_retries
    }

    pub fn name_record_deleted(&mut self) {
        self.step = DeletionStep::End;
        self.touch();
    }

    pub fn finish(&mut self) {
        self.step = DeletionStep::End;
        self.status = DeletionStatus::Complete;
        self.touch();
    }

    fn after_last_batch(&self) -> DeletionStep {
        if self.flush_only {
            DeletionStep::End
        } else {
            DeletionStep::DeleteCacheNameRecord
        }
    }

    fn touch(&mut self) {
        self.updated_at = OffsetDateTime::now_utc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(count: usize) -> Vec<String> {
        (0..count).map(|i| format!("key-{i}")).collect()
    }

    #[test]
    fn batches_walk_the_snapshot_in_blocks() {
        let mut job = DeletionJob::new("sessions", false);
        job.keys_collected(keys(22));

        let mut sizes = Vec::new();
        while job.step == DeletionStep::DeleteBatch {
            let size = job.next_batch(7).len();
            sizes.push(size);
            job.batch_succeeded(size);
        }

        assert_eq!(sizes, vec![7, 7, 7, 1]);
        assert_eq!(job.step, DeletionStep::DeleteCacheNameRecord);
    }

    #[test]
    fn flush_skips_name_record() {
        let mut job = DeletionJob::new("sessions", true);
        job.keys_collected(keys(3));
        let size = job.next_batch(10).len();
        job.batch_succeeded(size);
        assert_eq!(job.step, DeletionStep::End);
    }

    #[test]
    fn empty_snapshot_skips_batches() {
        let mut job = DeletionJob::new("sessions", false);
        job.keys_collected(Vec::new());
        assert_eq!(job.status, DeletionStatus::InProgress);
        assert_eq!(job.step, DeletionStep::DeleteCacheNameRecord);
    }

    #[test]
    fn failure_keeps_cursor_and_restarts_collection() {
        let mut job = DeletionJob::new("sessions", false);
        job.keys_collected(keys(10));
        job.batch_succeeded(4);
        job.batch_failed(3);

        assert_eq!(job.cursor, 4);
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.step, DeletionStep::CollectKeys);
    }

    #[test]
    fn exhausted_retries_end_without_name_record() {
        let mut job = DeletionJob::new("sessions", false);
        job.keys_collected(keys(2));
        job.batch_failed(2);
        assert_eq!(job.step, DeletionStep::CollectKeys);
        job.keys_collected(keys(2));
        job.batch_failed(2);

        assert_eq!(job.step, DeletionStep::End);
        assert!(job.retries_exhausted(2));
    }

    #[test]
    fn step_names_round_trip_through_storage_strings() {
        for step in [
            DeletionStep::CollectKeys,
            DeletionStep::DeleteBatch,
            DeletionStep::DeleteCacheNameRecord,
            DeletionStep::End,
        ] {
            assert_eq!(step.as_str().parse::<DeletionStep>().expect("parse"), step);
        }
        assert!("unknown".parse::<DeletionStatus>().is_err());
    }
}

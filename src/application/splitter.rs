//! Payload chunking.
//!
//! A payload larger than the configured maximum is cut into `ceil(S / max)`
//! pieces of `floor(S / count) + 1` bytes (the last piece may be shorter).
//! Chunk 0 is committed through a create; the rest are appended with bounded
//! concurrency once it has landed.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_stream::try_stream;
use bytes::{Bytes, BytesMut};
use futures::stream::{Stream, StreamExt, TryStreamExt};
use metrics::counter;
use thiserror::Error;
use tracing::{debug, info};

use crate::application::expiry::ExpiryScheduler;
use crate::application::store::{ChunkedCacheStore, StoreError};
use crate::domain::entry::{Chunk, EntryId, NewEntry};

const METRIC_CHUNKS_COMMITTED: &str = "keystash_chunks_committed_total";

#[derive(Debug, Error)]
pub enum SplitError {
    #[error("payload source failed: {0}")]
    Source(String),
    #[error("payload produced {actual} bytes but {expected} were declared")]
    LengthMismatch { expected: u64, actual: u64 },
    #[error("payload of {0} bytes is too large")]
    TooLarge(u64),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Chunk geometry for one payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    pub total_bytes: u64,
    pub chunk_count: u64,
    pub chunk_size: usize,
}

impl ChunkPlan {
    pub fn new(total_bytes: u64, max_payload_size: NonZeroUsize) -> Self {
        let max = max_payload_size.get() as u64;
        let chunk_count = total_bytes.div_ceil(max).max(1);
        let chunk_size = (total_bytes / chunk_count + 1) as usize;
        Self {
            total_bytes,
            chunk_count,
            chunk_size,
        }
    }

    pub fn is_single(&self) -> bool {
        self.chunk_count == 1
    }
}

/// Cut a byte stream into sequenced chunks of exactly `chunk_size` bytes.
///
/// At most one chunk plus one source frame is buffered. An empty source still
/// yields an empty chunk 0.
pub fn chunk_stream<S, E>(source: S, chunk_size: usize) -> impl Stream<Item = Result<Chunk, E>>
where
    S: Stream<Item = Result<Bytes, E>>,
{
    try_stream! {
        let mut buffer = BytesMut::with_capacity(chunk_size);
        let mut sequence: u32 = 0;
        futures::pin_mut!(source);

        while let Some(frame) = source.next().await {
            buffer.extend_from_slice(&frame?);
            while buffer.len() >= chunk_size {
                let payload = buffer.split_to(chunk_size).freeze();
                yield Chunk::new(sequence, payload);
                sequence += 1;
            }
        }

        if !buffer.is_empty() || sequence == 0 {
            yield Chunk::new(sequence, buffer.freeze());
        }
    }
}

/// Parameters of one write.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub id: EntryId,
    pub org: Option<String>,
    pub ttl: Option<Duration>,
    pub total_bytes: u64,
}

pub struct ChunkSplitter {
    store: Arc<ChunkedCacheStore>,
    expiry: Arc<ExpiryScheduler>,
    max_payload_size: NonZeroUsize,
    parallelism: NonZeroUsize,
}

impl ChunkSplitter {
    pub fn new(
        store: Arc<ChunkedCacheStore>,
        expiry: Arc<ExpiryScheduler>,
        max_payload_size: NonZeroUsize,
        parallelism: NonZeroUsize,
    ) -> Self {
        Self {
            store,
            expiry,
            max_payload_size,
            parallelism,
        }
    }

    pub fn plan(&self, total_bytes: u64) -> ChunkPlan {
        ChunkPlan::new(total_bytes, self.max_payload_size)
    }

    /// Commit `source` under `request.id` and arm its TTL once every chunk
    /// has been stored. Returns the number of chunks written.
    pub async fn write<S, E>(&self, request: WriteRequest, source: S) -> Result<u64, SplitError>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: std::fmt::Display + Send,
    {
        let plan = self.plan(request.total_bytes);
        let total_bytes =
            i64::try_from(plan.total_bytes).map_err(|_| SplitError::TooLarge(plan.total_bytes))?;
        let ttl_seconds = request
            .ttl
            .map(|ttl| u32::try_from(ttl.as_secs()).unwrap_or(u32::MAX));
        debug!(
            entry = %request.id,
            total_bytes = plan.total_bytes,
            chunk_count = plan.chunk_count,
            chunk_size = plan.chunk_size,
            "Writing payload"
        );

        let chunks = chunk_stream(source, plan.chunk_size)
            .map_err(|err| SplitError::Source(err.to_string()));
        futures::pin_mut!(chunks);

        let first = chunks
            .try_next()
            .await?
            .ok_or_else(|| SplitError::Source("payload produced no chunks".to_string()))?;
        let mut written = first.payload.len() as u64;
        self.store
            .create(
                &request.id,
                NewEntry {
                    org: request.org.clone(),
                    ttl_seconds,
                    total_bytes,
                    first_chunk: first.payload,
                },
            )
            .await?;

        let appended = AtomicU64::new(0);
        let store = &self.store;
        let id = &request.id;
        let appended_ref = &appended;
        chunks
            .try_for_each_concurrent(Some(self.parallelism.get()), move |chunk| async move {
                let size = chunk.payload.len() as u64;
                store.append_chunk(id, chunk).await?;
                appended_ref.fetch_add(size, Ordering::Relaxed);
                Ok(())
            })
            .await?;
        written += appended.load(Ordering::Relaxed);

        if written != plan.total_bytes {
            return Err(SplitError::LengthMismatch {
                expected: plan.total_bytes,
                actual: written,
            });
        }

        counter!(METRIC_CHUNKS_COMMITTED).increment(plan.chunk_count);
        if let Some(ttl) = request.ttl {
            self.expiry.schedule(request.id.clone(), ttl);
        }
        info!(
            entry = %request.id,
            chunks = plan.chunk_count,
            total_bytes = plan.total_bytes,
            ttl_seconds = ttl_seconds.unwrap_or(0),
            "Payload committed"
        );
        Ok(plan.chunk_count)
    }
}

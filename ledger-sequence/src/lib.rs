//! Monotonic, gapless-per-stream sequence allocation.
//!
//! Mirrors the locking granularity the rest of the in-memory kernel uses
//! (a single `Mutex` guarding a `HashMap`, same shape as
//! `codex-ledger::memory::State`): one exclusive critical section per
//! `next()` call, held only long enough to read-increment-write the
//! counter for the requested stream.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

pub const STREAM_AUDIT_EVENT: &str = "AUDIT_EVENT";
pub const STREAM_JOURNAL_ENTRY: &str = "JOURNAL_ENTRY";

#[derive(Debug, thiserror::Error)]
pub enum SequenceError {
    #[error("sequence counter overflowed for stream {0}")]
    Overflow(String),
}

#[async_trait]
pub trait SequenceAllocator: Send + Sync {
    /// Allocates and returns the next value for `stream_name`. Counters
    /// start at 1; 0 is never returned.
    async fn next(&self, stream_name: &str) -> Result<u64, SequenceError>;

    /// Current value without allocating, or `None` if the stream has never
    /// been used. Read-only; does not participate in the write lock path.
    async fn current(&self, stream_name: &str) -> Option<u64>;
}

#[derive(Debug, Default)]
pub struct InMemorySequenceAllocator {
    counters: Mutex<HashMap<String, u64>>,
}

impl InMemorySequenceAllocator {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SequenceAllocator for InMemorySequenceAllocator {
    async fn next(&self, stream_name: &str) -> Result<u64, SequenceError> {
        let mut counters = self.counters.lock().await;
        let counter = counters.entry(stream_name.to_string()).or_insert(0);
        *counter = counter
            .checked_add(1)
            .ok_or_else(|| SequenceError::Overflow(stream_name.to_string()))?;
        tracing::debug!(stream = stream_name, value = *counter, "sequence_allocated");
        Ok(*counter)
    }

    async fn current(&self, stream_name: &str) -> Option<u64> {
        let counters = self.counters.lock().await;
        counters.get(stream_name).copied()
    }
}

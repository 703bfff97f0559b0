//! # Op Store
//!
//! Durable, append-only CRDT op history, partitioned by room id. The store
//! assigns the per-room monotonic sequence under a contention-safe
//! uniqueness constraint; callers never fabricate it. The pod applies an op
//! to the in-memory document only after `append` returns, which keeps the
//! store the source of truth under a pod crash.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub mod memory;
pub mod postgres;

pub use memory::MemoryOpStore;
pub use postgres::PgOpStore;

/// Op store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend is unreachable or errored; retried with backoff.
    #[error("op store unavailable: {0}")]
    Unavailable(String),

    /// The pod is shutting down; new appends are refused.
    #[error("op store shutting down")]
    Shutdown,
}

/// One durably stored CRDT op. Never mutated after append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpRecord {
    /// Room the op belongs to.
    pub room_id: String,
    /// Store-assigned per-room sequence, gap-free per room.
    pub seq: i64,
    /// Originating pod, for audit only.
    pub site_id: String,
    /// Opaque CRDT update bytes.
    pub bytes: Vec<u8>,
    /// Append time.
    pub ts: DateTime<Utc>,
}

/// Durable append-only op history.
#[async_trait]
pub trait OpStore: Send + Sync {
    /// Append an op, returning the assigned per-room sequence. Returns only
    /// after the record is durable.
    async fn append(&self, room_id: &str, site_id: &str, bytes: &[u8])
        -> Result<i64, StoreError>;

    /// All ops with `seq > from_seq`, in sequence order. Read-your-writes
    /// per room is required.
    async fn range_scan(&self, room_id: &str, from_seq: i64)
        -> Result<Vec<OpRecord>, StoreError>;

    /// Drop ops with `seq < seq` for compaction. Returns the removed count.
    async fn truncate_before(&self, room_id: &str, seq: i64) -> Result<u64, StoreError>;

    /// Cheap reachability probe for health checks.
    async fn ping(&self) -> Result<(), StoreError>;
}

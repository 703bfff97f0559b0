//! # Replicated Per-Room Stream
//!
//! A named append-only log per room carries presence diffs and storage ops
//! between pods. Entry ids are totally ordered; history is bounded by entry
//! count and age, so a consumer that falls behind the cap must full-sync
//! instead of advancing through a gap.
//!
//! - `bridge`: the per-room producer/consumer tasks
//! - `redis`: Redis Streams backend
//! - `memory`: in-process backend for tests

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub mod bridge;
pub mod memory;
pub mod redis;

pub use self::bridge::StreamPublisher;
pub use self::memory::MemoryStreamLog;
pub use self::redis::RedisStreamLog;

/// Stream failures.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The backend is unreachable or errored; retried with backoff.
    #[error("stream unavailable: {0}")]
    Unavailable(String),

    /// An entry's fields could not be interpreted.
    #[error("undecodable stream entry: {0}")]
    Decode(String),
}

/// Totally ordered stream entry id, `millis-seq` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EntryId {
    /// Millisecond component.
    pub ms: u64,
    /// Sequence component within the millisecond.
    pub seq: u64,
}

impl EntryId {
    /// The id before every real entry; reading from here yields everything.
    pub const ZERO: EntryId = EntryId { ms: 0, seq: 0 };
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ms, seq) = s
            .split_once('-')
            .ok_or_else(|| StreamError::Decode(format!("bad entry id {s:?}")))?;
        Ok(Self {
            ms: ms
                .parse()
                .map_err(|_| StreamError::Decode(format!("bad entry id {s:?}")))?,
            seq: seq
                .parse()
                .map_err(|_| StreamError::Decode(format!("bad entry id {s:?}")))?,
        })
    }
}

/// What an entry carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// A stamped presence diff (or tombstone).
    Presence,
    /// An opaque CRDT update already durable in the op store.
    Storage,
}

impl RecordKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Presence => "presence",
            Self::Storage => "storage",
        }
    }
}

/// One replicated entry. `pod` + `seq` identify the origin; `seq` is
/// contiguous per `(pod, room)`, which is how consumers detect trimmed-away
/// entries they never saw.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRecord {
    /// Origin pod id.
    pub pod: String,
    /// Origin-local publish sequence, contiguous per pod per room.
    pub seq: u64,
    /// Payload class.
    pub kind: RecordKind,
    /// Encoded presence diff, or raw CRDT update bytes.
    pub payload: Bytes,
    /// Op store sequence for storage entries.
    pub op_seq: Option<i64>,
}

impl StreamRecord {
    /// Flatten into backend field/value pairs.
    pub fn to_fields(&self) -> Vec<(String, Vec<u8>)> {
        let mut fields = vec![
            ("pod".to_string(), self.pod.as_bytes().to_vec()),
            ("seq".to_string(), self.seq.to_string().into_bytes()),
            ("kind".to_string(), self.kind.as_str().as_bytes().to_vec()),
            ("payload".to_string(), self.payload.to_vec()),
        ];
        if let Some(op_seq) = self.op_seq {
            fields.push(("op_seq".to_string(), op_seq.to_string().into_bytes()));
        }
        fields
    }

    /// Rebuild from backend field/value pairs.
    pub fn from_fields(fields: &[(String, Vec<u8>)]) -> Result<Self, StreamError> {
        let find = |name: &str| {
            fields
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_slice())
        };
        let text = |name: &str| -> Result<String, StreamError> {
            String::from_utf8(
                find(name)
                    .ok_or_else(|| StreamError::Decode(format!("missing field {name}")))?
                    .to_vec(),
            )
            .map_err(|_| StreamError::Decode(format!("non-utf8 field {name}")))
        };

        let kind = match text("kind")?.as_str() {
            "presence" => RecordKind::Presence,
            "storage" => RecordKind::Storage,
            other => return Err(StreamError::Decode(format!("unknown kind {other:?}"))),
        };
        let seq: u64 = text("seq")?
            .parse()
            .map_err(|_| StreamError::Decode("bad seq field".to_string()))?;
        let op_seq = match find("op_seq") {
            Some(raw) => Some(
                std::str::from_utf8(raw)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| StreamError::Decode("bad op_seq field".to_string()))?,
            ),
            None => None,
        };

        Ok(Self {
            pod: text("pod")?,
            seq,
            kind,
            payload: Bytes::copy_from_slice(
                find("payload").ok_or_else(|| StreamError::Decode("missing payload".into()))?,
            ),
            op_seq,
        })
    }
}

/// The append-only replicated log the pod produces into and consumes from.
/// The pod depends on nothing beyond these operations.
#[async_trait]
pub trait StreamLog: Send + Sync {
    /// Append an entry, trimming history to roughly `max_len` entries.
    async fn append(
        &self,
        stream: &str,
        record: &StreamRecord,
        max_len: usize,
    ) -> Result<EntryId, StreamError>;

    /// Entries with id greater than `from`, blocking up to `timeout` when
    /// none are available yet.
    async fn read_blocking(
        &self,
        stream: &str,
        from: EntryId,
        max_count: usize,
        timeout: Duration,
    ) -> Result<Vec<(EntryId, StreamRecord)>, StreamError>;

    /// Entries with id greater than `from`, non-blocking, up to `max_count`.
    async fn range(
        &self,
        stream: &str,
        from: EntryId,
        max_count: usize,
    ) -> Result<Vec<(EntryId, StreamRecord)>, StreamError>;

    /// Id of the newest entry ever appended (`ZERO` for a fresh stream).
    async fn head_id(&self, stream: &str) -> Result<EntryId, StreamError>;

    /// Id of the oldest retained entry, if any.
    async fn oldest_id(&self, stream: &str) -> Result<Option<EntryId>, StreamError>;

    /// Drop entries older than `min` (age-based bound).
    async fn trim_before(&self, stream: &str, min: EntryId) -> Result<(), StreamError>;

    /// Cheap reachability probe for health checks.
    async fn ping(&self) -> Result<(), StreamError>;
}

/// Stream name for a room.
pub fn room_stream_name(room_id: &str) -> String {
    format!("podsync:room:{room_id}")
}

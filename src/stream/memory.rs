//! In-memory stream log for tests and development.
//!
//! Ids are `millis-counter` with a single global counter; the millisecond
//! component never goes backward, so ids are totally ordered the way a
//! single backend instance would order them and age-based trims behave
//! like the real backend.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use super::{EntryId, StreamError, StreamLog, StreamRecord};

#[derive(Default)]
struct Shared {
    streams: Mutex<HashMap<String, Vec<(EntryId, StreamRecord)>>>,
}

/// Shared in-process stream log. Clones see the same data, so several pods
/// in one test can exchange entries through it.
#[derive(Clone)]
pub struct MemoryStreamLog {
    shared: Arc<Shared>,
    counter: Arc<AtomicU64>,
    last_ms: Arc<AtomicU64>,
    notify: Arc<Notify>,
    available: Arc<AtomicBool>,
}

impl MemoryStreamLog {
    /// Empty log.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            counter: Arc::new(AtomicU64::new(0)),
            last_ms: Arc::new(AtomicU64::new(0)),
            notify: Arc::new(Notify::new()),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate an outage; every call fails until restored.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Drop the oldest `count` entries of a stream, as a cap trim would.
    /// Lets tests manufacture a gap ahead of a lagging consumer.
    pub fn drop_oldest(&self, stream: &str, count: usize) {
        let mut streams = self.shared.streams.lock();
        if let Some(entries) = streams.get_mut(stream) {
            entries.drain(..count.min(entries.len()));
        }
    }

    fn check(&self) -> Result<(), StreamError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StreamError::Unavailable("simulated outage".to_string()))
        }
    }

    fn collect_after(
        &self,
        stream: &str,
        from: EntryId,
        max_count: usize,
    ) -> Vec<(EntryId, StreamRecord)> {
        let streams = self.shared.streams.lock();
        streams
            .get(stream)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(id, _)| *id > from)
                    .take(max_count)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl StreamLog for MemoryStreamLog {
    async fn append(
        &self,
        stream: &str,
        record: &StreamRecord,
        max_len: usize,
    ) -> Result<EntryId, StreamError> {
        self.check()?;
        let now_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
        self.last_ms.fetch_max(now_ms, Ordering::SeqCst);
        let id = EntryId {
            ms: self.last_ms.load(Ordering::SeqCst),
            seq: self.counter.fetch_add(1, Ordering::SeqCst) + 1,
        };
        {
            let mut streams = self.shared.streams.lock();
            let entries = streams.entry(stream.to_string()).or_default();
            entries.push((id, record.clone()));
            if entries.len() > max_len {
                let excess = entries.len() - max_len;
                entries.drain(..excess);
            }
        }
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn read_blocking(
        &self,
        stream: &str,
        from: EntryId,
        max_count: usize,
        timeout: Duration,
    ) -> Result<Vec<(EntryId, StreamRecord)>, StreamError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            self.check()?;
            let batch = self.collect_after(stream, from, max_count);
            if !batch.is_empty() {
                return Ok(batch);
            }
            let notified = self.notify.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn range(
        &self,
        stream: &str,
        from: EntryId,
        max_count: usize,
    ) -> Result<Vec<(EntryId, StreamRecord)>, StreamError> {
        self.check()?;
        Ok(self.collect_after(stream, from, max_count))
    }

    async fn head_id(&self, stream: &str) -> Result<EntryId, StreamError> {
        self.check()?;
        let streams = self.shared.streams.lock();
        Ok(streams
            .get(stream)
            .and_then(|entries| entries.last().map(|(id, _)| *id))
            .unwrap_or(EntryId::ZERO))
    }

    async fn oldest_id(&self, stream: &str) -> Result<Option<EntryId>, StreamError> {
        self.check()?;
        let streams = self.shared.streams.lock();
        Ok(streams
            .get(stream)
            .and_then(|entries| entries.first().map(|(id, _)| *id)))
    }

    async fn trim_before(&self, stream: &str, min: EntryId) -> Result<(), StreamError> {
        self.check()?;
        let mut streams = self.shared.streams.lock();
        if let Some(entries) = streams.get_mut(stream) {
            entries.retain(|(id, _)| *id >= min);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), StreamError> {
        self.check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::RecordKind;
    use bytes::Bytes;

    fn record(pod: &str, seq: u64) -> StreamRecord {
        StreamRecord {
            pod: pod.to_string(),
            seq,
            kind: RecordKind::Presence,
            payload: Bytes::from_static(b"\x80"),
            op_seq: None,
        }
    }

    #[tokio::test]
    async fn test_append_and_range() {
        let log = MemoryStreamLog::new();
        let first = log.append("s", &record("p", 1), 100).await.unwrap();
        let second = log.append("s", &record("p", 2), 100).await.unwrap();
        assert!(second > first);

        let all = log.range("s", EntryId::ZERO, 10).await.unwrap();
        assert_eq!(all.len(), 2);
        let tail = log.range("s", first, 10).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].1.seq, 2);
    }

    #[tokio::test]
    async fn test_max_len_trims_oldest() {
        let log = MemoryStreamLog::new();
        for seq in 1..=5 {
            log.append("s", &record("p", seq), 3).await.unwrap();
        }
        let all = log.range("s", EntryId::ZERO, 10).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].1.seq, 3);
        assert!(log.oldest_id("s").await.unwrap().unwrap() > EntryId::ZERO);
    }

    #[tokio::test]
    async fn test_read_blocking_wakes_on_append() {
        let log = MemoryStreamLog::new();
        let reader = log.clone();
        let handle = tokio::spawn(async move {
            reader
                .read_blocking("s", EntryId::ZERO, 10, Duration::from_secs(5))
                .await
                .unwrap()
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        log.append("s", &record("p", 1), 100).await.unwrap();
        let batch = handle.await.unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_read_blocking_times_out_empty() {
        let log = MemoryStreamLog::new();
        let batch = log
            .read_blocking("s", EntryId::ZERO, 10, Duration::from_millis(30))
            .await
            .unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_head_id_tracks_latest() {
        let log = MemoryStreamLog::new();
        assert_eq!(log.head_id("s").await.unwrap(), EntryId::ZERO);
        let id = log.append("s", &record("p", 1), 100).await.unwrap();
        assert_eq!(log.head_id("s").await.unwrap(), id);
    }
}

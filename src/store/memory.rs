//! In-memory op store for tests and development.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use super::{OpRecord, OpStore, StoreError};

/// Keeps op history in process memory. Sequence assignment matches the
/// durable backend: per-room, monotonic, gap-free, assigned under the map
/// lock.
pub struct MemoryOpStore {
    rooms: Mutex<HashMap<String, Vec<OpRecord>>>,
    available: AtomicBool,
}

impl MemoryOpStore {
    /// Empty store.
    pub fn new() -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage; every call fails until restored.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of ops stored for a room.
    pub fn len(&self, room_id: &str) -> usize {
        self.rooms.lock().get(room_id).map(Vec::len).unwrap_or(0)
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("simulated outage".to_string()))
        }
    }
}

#[async_trait]
impl OpStore for MemoryOpStore {
    async fn append(
        &self,
        room_id: &str,
        site_id: &str,
        bytes: &[u8],
    ) -> Result<i64, StoreError> {
        self.check()?;
        let mut rooms = self.rooms.lock();
        let ops = rooms.entry(room_id.to_string()).or_default();
        let seq = ops.last().map(|r| r.seq).unwrap_or(0) + 1;
        ops.push(OpRecord {
            room_id: room_id.to_string(),
            seq,
            site_id: site_id.to_string(),
            bytes: bytes.to_vec(),
            ts: Utc::now(),
        });
        Ok(seq)
    }

    async fn range_scan(
        &self,
        room_id: &str,
        from_seq: i64,
    ) -> Result<Vec<OpRecord>, StoreError> {
        self.check()?;
        let rooms = self.rooms.lock();
        Ok(rooms
            .get(room_id)
            .map(|ops| {
                ops.iter()
                    .filter(|r| r.seq > from_seq)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn truncate_before(&self, room_id: &str, seq: i64) -> Result<u64, StoreError> {
        self.check()?;
        let mut rooms = self.rooms.lock();
        let Some(ops) = rooms.get_mut(room_id) else {
            return Ok(0);
        };
        let before = ops.len();
        ops.retain(|r| r.seq >= seq);
        Ok((before - ops.len()) as u64)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check()
    }
}

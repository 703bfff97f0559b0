//! Room Registry
//!
//! A pod-global actor serializing room creation and destruction. Creation
//! is racy-safe because only this task mutates the map; destruction is
//! scheduled when a room reports an empty session set and cancelled by any
//! newer attach through an epoch counter. The room itself is the cache
//! entry: the registry's cap and idle eviction are the only bounds.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::PodConfig;
use crate::error::PodError;
use crate::metrics::PodMetrics;
use crate::room::coordinator::{spawn_room, RoomHandle};
use crate::store::OpStore;
use crate::stream::{bridge, StreamLog};

enum RegistryMsg {
    Attach {
        room_id: String,
        reply: oneshot::Sender<Result<RoomHandle, PodError>>,
    },
    DestroyIfIdle {
        room_id: String,
        epoch: u64,
    },
    Count {
        reply: oneshot::Sender<usize>,
    },
    DrainAll {
        reply: oneshot::Sender<()>,
    },
}

/// Clonable handle to the registry actor.
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::UnboundedSender<RegistryMsg>,
}

impl RegistryHandle {
    /// Get (or lazily create) the room, bumping its liveness epoch.
    pub async fn attach(&self, room_id: &str) -> Result<RoomHandle, PodError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RegistryMsg::Attach {
                room_id: room_id.to_string(),
                reply,
            })
            .map_err(|_| PodError::Shutdown)?;
        rx.await.map_err(|_| PodError::Shutdown)?
    }

    /// Number of live rooms; `None` when the registry does not answer
    /// within the deadline (health probe).
    pub async fn room_count(&self, deadline: Duration) -> Option<usize> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(RegistryMsg::Count { reply }).ok()?;
        tokio::time::timeout(deadline, rx).await.ok()?.ok()
    }

    /// Broadcast drain notices to every room's sessions.
    pub async fn drain_all(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(RegistryMsg::DrainAll { reply }).is_ok() {
            let _ = rx.await;
        }
    }
}

struct RoomEntry {
    handle: RoomHandle,
    epoch: u64,
}

/// Spawn the registry actor.
pub fn spawn_registry(
    cfg: Arc<PodConfig>,
    metrics: Arc<PodMetrics>,
    op_store: Arc<dyn OpStore>,
    stream_log: Arc<dyn StreamLog>,
) -> RegistryHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let (idle_tx, idle_rx) = mpsc::unbounded_channel();
    let registry = Registry {
        cfg,
        metrics,
        op_store,
        stream_log,
        rooms: HashMap::new(),
        tx: tx.clone(),
        idle_tx,
    };
    tokio::spawn(registry.run(rx, idle_rx));
    RegistryHandle { tx }
}

struct Registry {
    cfg: Arc<PodConfig>,
    metrics: Arc<PodMetrics>,
    op_store: Arc<dyn OpStore>,
    stream_log: Arc<dyn StreamLog>,
    rooms: HashMap<String, RoomEntry>,
    tx: mpsc::UnboundedSender<RegistryMsg>,
    idle_tx: mpsc::UnboundedSender<String>,
}

impl Registry {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<RegistryMsg>,
        mut idle_rx: mpsc::UnboundedReceiver<String>,
    ) {
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(msg) => self.handle(msg).await,
                        None => break,
                    }
                }
                Some(room_id) = idle_rx.recv() => {
                    self.schedule_destroy(room_id);
                }
            }
        }
    }

    async fn handle(&mut self, msg: RegistryMsg) {
        match msg {
            RegistryMsg::Attach { room_id, reply } => {
                let _ = reply.send(self.attach(room_id));
            }
            RegistryMsg::DestroyIfIdle { room_id, epoch } => {
                self.destroy_if_idle(&room_id, epoch).await;
            }
            RegistryMsg::Count { reply } => {
                let _ = reply.send(self.rooms.len());
            }
            RegistryMsg::DrainAll { reply } => {
                for entry in self.rooms.values() {
                    entry.handle.drain();
                }
                let _ = reply.send(());
            }
        }
    }

    fn attach(&mut self, room_id: String) -> Result<RoomHandle, PodError> {
        if let Some(entry) = self.rooms.get_mut(&room_id) {
            if entry.handle.is_alive() {
                entry.epoch += 1;
                return Ok(entry.handle.clone());
            }
            // The coordinator died (internal bug path); the room is
            // recreated below and recovers via cold replay.
            warn!(room = %room_id, "room coordinator gone, recreating");
            self.remove_room(&room_id);
        }

        if self.rooms.len() >= self.cfg.max_rooms {
            return Err(PodError::TooManyRooms(self.cfg.max_rooms));
        }

        let publisher = bridge::spawn_publisher(
            &room_id,
            self.stream_log.clone(),
            self.cfg.clone(),
            self.metrics.clone(),
        );
        let handle = spawn_room(
            room_id.clone(),
            self.cfg.clone(),
            self.metrics.clone(),
            self.op_store.clone(),
            publisher,
            self.idle_tx.clone(),
        );
        bridge::spawn_consumer(
            &room_id,
            handle.clone(),
            self.stream_log.clone(),
            self.cfg.clone(),
            self.metrics.clone(),
        );

        info!(room = %room_id, rooms = self.rooms.len() + 1, "room created");
        self.rooms.insert(
            room_id,
            RoomEntry {
                handle: handle.clone(),
                epoch: 0,
            },
        );
        self.metrics.active_rooms.set(self.rooms.len() as i64);
        Ok(handle)
    }

    fn schedule_destroy(&mut self, room_id: String) {
        let Some(entry) = self.rooms.get(&room_id) else {
            return;
        };
        let epoch = entry.epoch;
        let grace = self.cfg.idle_room_grace;
        let tx = self.tx.clone();
        debug!(room = %room_id, grace_ms = grace.as_millis() as u64, "room idle, destruction scheduled");
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = tx.send(RegistryMsg::DestroyIfIdle { room_id, epoch });
        });
    }

    async fn destroy_if_idle(&mut self, room_id: &str, epoch: u64) {
        let Some(entry) = self.rooms.get(room_id) else {
            return;
        };
        if entry.epoch != epoch {
            // A newer attach cancelled this destruction.
            return;
        }
        if entry.handle.stop_if_idle().await {
            info!(room = %room_id, "idle room destroyed");
            self.remove_room(room_id);
        }
    }

    fn remove_room(&mut self, room_id: &str) {
        self.rooms.remove(room_id);
        self.metrics.active_rooms.set(self.rooms.len() as i64);
        self.metrics.active_sessions.remove(room_id);
        self.metrics.stream_lag_entries.remove(room_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::hub::Seat;
    use crate::session::egress::EgressQueue;
    use crate::store::MemoryOpStore;
    use crate::stream::MemoryStreamLog;
    use uuid::Uuid;

    fn setup(max_rooms: usize) -> RegistryHandle {
        let mut cfg = PodConfig::for_tests();
        cfg.max_rooms = max_rooms;
        spawn_registry(
            Arc::new(cfg),
            Arc::new(PodMetrics::new()),
            Arc::new(MemoryOpStore::new()),
            Arc::new(MemoryStreamLog::new()),
        )
    }

    fn seat(user: &str) -> Seat {
        Seat {
            session_id: Uuid::new_v4(),
            user_id: user.to_string(),
            egress: EgressQueue::new(64 * 1024, 256),
        }
    }

    #[tokio::test]
    async fn test_attach_creates_once() {
        let registry = setup(8);
        let first = registry.attach("r1").await.unwrap();
        let second = registry.attach("r1").await.unwrap();
        assert_eq!(first.room_id, second.room_id);
        assert_eq!(
            registry.room_count(Duration::from_secs(1)).await,
            Some(1)
        );
    }

    #[tokio::test]
    async fn test_too_many_rooms() {
        let registry = setup(2);
        registry.attach("r1").await.unwrap();
        registry.attach("r2").await.unwrap();
        match registry.attach("r3").await {
            Err(PodError::TooManyRooms(cap)) => assert_eq!(cap, 2),
            other => panic!("expected TooManyRooms, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_idle_room_destroyed_after_grace() {
        let registry = setup(8);
        let room = registry.attach("r1").await.unwrap();

        let seat = seat("u1");
        let session_id = seat.session_id;
        room.attach(seat).await.unwrap();
        room.detach(session_id);

        // Test grace is 200ms; wait past it.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(
            registry.room_count(Duration::from_secs(1)).await,
            Some(0)
        );
    }

    #[tokio::test]
    async fn test_reattach_cancels_destruction() {
        let registry = setup(8);
        let room = registry.attach("r1").await.unwrap();

        let first = seat("u1");
        let first_id = first.session_id;
        room.attach(first).await.unwrap();
        room.detach(first_id);

        // Before the grace elapses, a new session arrives.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let room = registry.attach("r1").await.unwrap();
        room.attach(seat("u2")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(
            registry.room_count(Duration::from_secs(1)).await,
            Some(1)
        );
    }

    #[tokio::test]
    async fn test_registry_responsive_probe() {
        let registry = setup(8);
        assert!(registry
            .room_count(Duration::from_millis(500))
            .await
            .is_some());
    }
}

//! Room Coordinator
//!
//! One task owns each room's presence table, CRDT document, and session
//! set; every mutation arrives as a message. The inbox has two rate-bearing
//! lanes (presence and storage) drained under a weighted fair policy, plus
//! a control lane for attach/detach/sync that is never starved.
//!
//! Storage ordering: an update is durably appended to the op store before
//! it is applied in memory or broadcast, so a peer that observes a
//! broadcast can always fetch the op from the store.

use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::PodConfig;
use crate::error::{ErrorCode, PodError};
use crate::metrics::PodMetrics;
use crate::protocol::frame::FrameType;
use crate::protocol::presence::FieldBag;
use crate::protocol::{Frame, PresenceDiffWire, PresenceSyncWire};
use crate::room::document::CrdtDoc;
use crate::room::hub::{RoomHub, Seat};
use crate::room::presence::{PeerApply, PresenceTable};
use crate::store::OpStore;
use crate::stream::StreamPublisher;

/// Presence messages drained per scheduling quantum (40% share).
const PRESENCE_QUANTUM: usize = 4;
/// Storage messages drained per scheduling quantum (60% share).
const STORAGE_QUANTUM: usize = 6;

/// Bound on each rate-bearing inbox lane.
const LANE_CAPACITY: usize = 512;

/// Deadline for one durable append before the room goes read-only.
const APPEND_DEADLINE: Duration = Duration::from_secs(5);

/// Cold replay connection attempts before the room gives up starting.
const REPLAY_ATTEMPTS: u32 = 3;

/// Control lane messages: session lifecycle and sync.
pub enum ControlMsg {
    /// Seat a session and deliver its initial sync.
    Attach {
        /// The session to seat.
        seat: Seat,
        /// Attach outcome.
        reply: oneshot::Sender<Result<(), PodError>>,
    },
    /// Remove a session.
    Detach {
        /// Session to remove.
        session_id: Uuid,
    },
    /// Re-send both sync frames to one session.
    Resync {
        /// Session asking for the sync.
        session_id: Uuid,
    },
    /// Recover from a stream gap: replay missed ops from the op store.
    FullSync {
        /// Completion signal for the bridge.
        reply: oneshot::Sender<Result<(), PodError>>,
    },
    /// Broadcast a drain notice to every session (pod shutdown).
    Drain,
    /// Stop the coordinator if no sessions remain (idle destruction).
    StopIfIdle {
        /// `true` when the room stopped.
        reply: oneshot::Sender<bool>,
    },
}

/// Presence lane messages.
pub enum PresenceMsg {
    /// A diff from a local session.
    LocalDiff {
        /// Originating session (excluded from fan-out).
        session_id: Uuid,
        /// Authenticated user.
        user_id: String,
        /// Field overwrites.
        fields: FieldBag,
    },
    /// An explicit removal (`null` diff) from a local session.
    LocalLeave {
        /// Originating session.
        session_id: Uuid,
        /// User to remove.
        user_id: String,
    },
    /// A diff consumed from a peer pod.
    PeerDiff {
        /// User the entry applies to.
        user_id: String,
        /// Overwrites, or `None` for a tombstone.
        fields: Option<FieldBag>,
        /// Origin server stamp for dedupe.
        source_ts: i64,
    },
}

/// Storage lane messages.
pub enum StorageMsg {
    /// An opaque CRDT update from a local session.
    LocalUpdate {
        /// Originating session (excluded from fan-out, receives errors).
        session_id: Uuid,
        /// Update bytes.
        bytes: Bytes,
    },
    /// An update consumed from a peer pod, already durable at its origin.
    PeerUpdate {
        /// Update bytes.
        bytes: Bytes,
        /// Op store sequence, for the replay high-water mark.
        op_seq: Option<i64>,
    },
}

/// Clonable handle to a room's inbox lanes.
#[derive(Clone, Debug)]
pub struct RoomHandle {
    /// Room id.
    pub room_id: String,
    control_tx: mpsc::UnboundedSender<ControlMsg>,
    presence_tx: mpsc::Sender<PresenceMsg>,
    storage_tx: mpsc::Sender<StorageMsg>,
}

impl RoomHandle {
    /// Seat a session; resolves once the initial sync is enqueued.
    pub async fn attach(&self, seat: Seat) -> Result<(), PodError> {
        let (reply, rx) = oneshot::channel();
        self.control_tx
            .send(ControlMsg::Attach { seat, reply })
            .map_err(|_| PodError::Shutdown)?;
        rx.await.map_err(|_| PodError::Shutdown)?
    }

    /// Remove a session.
    pub fn detach(&self, session_id: Uuid) {
        let _ = self.control_tx.send(ControlMsg::Detach { session_id });
    }

    /// Ask for a fresh sync for one session.
    pub fn resync(&self, session_id: Uuid) {
        let _ = self.control_tx.send(ControlMsg::Resync { session_id });
    }

    /// Replay missed ops from the op store after a stream gap.
    pub async fn full_sync(&self) -> Result<(), PodError> {
        let (reply, rx) = oneshot::channel();
        self.control_tx
            .send(ControlMsg::FullSync { reply })
            .map_err(|_| PodError::Shutdown)?;
        rx.await.map_err(|_| PodError::Shutdown)?
    }

    /// Broadcast a drain notice to the room's sessions.
    pub fn drain(&self) {
        let _ = self.control_tx.send(ControlMsg::Drain);
    }

    /// Stop the room if it has no sessions.
    pub async fn stop_if_idle(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .control_tx
            .send(ControlMsg::StopIfIdle { reply })
            .is_err()
        {
            // Coordinator already gone.
            return true;
        }
        rx.await.unwrap_or(true)
    }

    /// Offer a presence message; presence is lossy, so a full lane drops.
    pub fn offer_presence(&self, msg: PresenceMsg) -> bool {
        self.presence_tx.try_send(msg).is_ok()
    }

    /// Queue a storage message, waiting up to `deadline` for lane space.
    pub async fn send_storage(&self, msg: StorageMsg, deadline: Duration) -> bool {
        tokio::time::timeout(deadline, self.storage_tx.send(msg))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    /// Whether the coordinator is still running.
    pub fn is_alive(&self) -> bool {
        !self.control_tx.is_closed()
    }
}

/// Spawn a room: cold replay from the op store, then the serve loop.
/// `idle_tx` is notified whenever the session set becomes empty.
pub fn spawn_room(
    room_id: String,
    cfg: Arc<PodConfig>,
    metrics: Arc<PodMetrics>,
    op_store: Arc<dyn OpStore>,
    publisher: StreamPublisher,
    idle_tx: mpsc::UnboundedSender<String>,
) -> RoomHandle {
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (presence_tx, presence_rx) = mpsc::channel(LANE_CAPACITY);
    let (storage_tx, storage_rx) = mpsc::channel(LANE_CAPACITY);

    let handle = RoomHandle {
        room_id: room_id.clone(),
        control_tx,
        presence_tx,
        storage_tx,
    };

    let coordinator = Coordinator {
        room_id,
        cfg,
        metrics,
        op_store,
        publisher,
        idle_tx,
        hub: RoomHub::new(),
        presence: PresenceTable::new(),
        doc: CrdtDoc::new(),
        applied_seq: 0,
        read_only_until: None,
        store_backoff: crate::error::Backoff::new(),
    };
    tokio::spawn(coordinator.run(control_rx, presence_rx, storage_rx));

    handle
}

struct Coordinator {
    room_id: String,
    cfg: Arc<PodConfig>,
    metrics: Arc<PodMetrics>,
    op_store: Arc<dyn OpStore>,
    publisher: StreamPublisher,
    idle_tx: mpsc::UnboundedSender<String>,
    hub: RoomHub,
    presence: PresenceTable,
    doc: CrdtDoc,
    /// High-water mark of op store sequences applied to `doc`.
    applied_seq: i64,
    read_only_until: Option<Instant>,
    store_backoff: crate::error::Backoff,
}

impl Coordinator {
    async fn run(
        mut self,
        mut control_rx: mpsc::UnboundedReceiver<ControlMsg>,
        mut presence_rx: mpsc::Receiver<PresenceMsg>,
        mut storage_rx: mpsc::Receiver<StorageMsg>,
    ) {
        if !self.cold_replay().await {
            error!(room = %self.room_id, "cold replay failed, room not starting");
            return;
        }
        info!(room = %self.room_id, applied_seq = self.applied_seq, "room started");

        let mut sweep = tokio::time::interval(Duration::from_secs(1));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                maybe = control_rx.recv() => {
                    match maybe {
                        Some(msg) => {
                            if self.handle_control(msg).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = sweep.tick() => {
                    self.sweep_presence().await;
                    continue;
                }
                Some(msg) = presence_rx.recv() => {
                    self.handle_presence(msg).await;
                }
                Some(msg) = storage_rx.recv() => {
                    self.handle_storage(msg).await;
                }
            }

            // Weighted fair drain: neither class can starve the other, and
            // control stays responsive between quanta.
            let mut stop = false;
            loop {
                let mut progressed = false;
                for _ in 0..PRESENCE_QUANTUM {
                    match presence_rx.try_recv() {
                        Ok(msg) => {
                            self.handle_presence(msg).await;
                            progressed = true;
                        }
                        Err(_) => break,
                    }
                }
                for _ in 0..STORAGE_QUANTUM {
                    match storage_rx.try_recv() {
                        Ok(msg) => {
                            self.handle_storage(msg).await;
                            progressed = true;
                        }
                        Err(_) => break,
                    }
                }
                while let Ok(msg) = control_rx.try_recv() {
                    if self.handle_control(msg).await {
                        stop = true;
                        break;
                    }
                }
                if stop || !progressed {
                    break;
                }
            }
            if stop {
                break;
            }
        }
        info!(room = %self.room_id, "room stopped");
    }

    async fn cold_replay(&mut self) -> bool {
        for attempt in 0..REPLAY_ATTEMPTS {
            match self.op_store.range_scan(&self.room_id, 0).await {
                Ok(records) => {
                    for record in records {
                        match self.doc.apply(&record.bytes) {
                            Ok(()) => {
                                self.metrics.storage_ops_applied.inc();
                                self.applied_seq = record.seq;
                            }
                            Err(e) => {
                                warn!(
                                    room = %self.room_id,
                                    seq = record.seq,
                                    error = %e,
                                    "skipping unreadable op during replay"
                                );
                                self.applied_seq = record.seq;
                            }
                        }
                    }
                    return true;
                }
                Err(e) => {
                    warn!(
                        room = %self.room_id,
                        attempt,
                        error = %e,
                        "cold replay scan failed"
                    );
                    tokio::time::sleep(self.store_backoff.next_delay()).await;
                }
            }
        }
        false
    }

    /// Returns `true` when the coordinator should stop.
    async fn handle_control(&mut self, msg: ControlMsg) -> bool {
        match msg {
            ControlMsg::Attach { seat, reply } => {
                let result = self.attach(seat);
                let _ = reply.send(result);
            }
            ControlMsg::Detach { session_id } => {
                self.detach(&session_id);
            }
            ControlMsg::Resync { session_id } => {
                self.send_sync(&session_id);
            }
            ControlMsg::FullSync { reply } => {
                let _ = reply.send(self.replay_missed_ops().await);
            }
            ControlMsg::Drain => {
                let now = Instant::now();
                let frame = Frame::control(crate::protocol::ControlKind::Drain);
                for seat in self.hub.seats() {
                    let _ = seat.egress.push(frame.clone(), None, now);
                }
            }
            ControlMsg::StopIfIdle { reply } => {
                if self.hub.is_empty() {
                    let _ = reply.send(true);
                    return true;
                }
                let _ = reply.send(false);
            }
        }
        false
    }

    fn attach(&mut self, seat: Seat) -> Result<(), PodError> {
        if self.hub.len() >= self.cfg.max_sessions_per_room {
            return Err(PodError::RoomCapacityExceeded(self.room_id.clone()));
        }
        let session_id = seat.session_id;
        self.hub.insert(seat);
        self.metrics.active_sessions.add(&self.room_id, 1);
        // Initial sync goes out before any frame published after this
        // point; the single-task inbox makes that ordering airtight.
        self.send_sync(&session_id);
        Ok(())
    }

    fn detach(&mut self, session_id: &Uuid) {
        let Some(seat) = self.hub.remove(session_id) else {
            return;
        };
        self.metrics.active_sessions.add(&self.room_id, -1);

        if !self.hub.user_has_other_session(&seat.user_id, session_id) {
            self.remove_user(&seat.user_id, chrono::Utc::now().timestamp_millis());
        }
        if self.hub.is_empty() {
            let _ = self.idle_tx.send(self.room_id.clone());
        }
    }

    fn send_sync(&mut self, session_id: &Uuid) {
        let now = Instant::now();

        let presence = PresenceSyncWire {
            entries: self.presence.snapshot(),
        };
        let presence_frame = match presence
            .encode()
            .map_err(|e| e.to_string())
            .and_then(|b| {
                Frame::new(FrameType::PresenceSync, Bytes::from(b)).map_err(|e| e.to_string())
            }) {
            Ok(frame) => frame,
            Err(e) => {
                error!(room = %self.room_id, error = %e, "presence sync encode failed");
                return;
            }
        };

        let storage_frame = match self.doc.snapshot().map_err(|e| e.to_string()).and_then(|b| {
            Frame::new(FrameType::StorageSync, Bytes::from(b)).map_err(|e| e.to_string())
        }) {
            Ok(frame) => frame,
            Err(e) => {
                error!(room = %self.room_id, error = %e, "storage snapshot failed");
                self.hub.send_to(
                    session_id,
                    Frame::error(ErrorCode::Internal, "snapshot failed"),
                    now,
                );
                return;
            }
        };

        self.hub.send_to(session_id, presence_frame, now);
        self.hub.send_to(session_id, storage_frame, now);
    }

    async fn handle_presence(&mut self, msg: PresenceMsg) {
        match msg {
            PresenceMsg::LocalDiff {
                session_id,
                user_id,
                fields,
            } => {
                let now_ms = chrono::Utc::now().timestamp_millis();
                if let Err(e) = self.presence.apply_diff(&user_id, &fields, now_ms) {
                    debug!(room = %self.room_id, user = %user_id, error = %e, "presence diff rejected");
                    self.hub.send_to(
                        &session_id,
                        Frame::error(ErrorCode::MalformedFrame, "presence fields too large"),
                        Instant::now(),
                    );
                    return;
                }

                let wire = PresenceDiffWire::stamped(&user_id, fields, now_ms);
                self.broadcast_presence(&wire, Some(&session_id));
                self.publisher.publish_presence(&wire);
            }
            PresenceMsg::LocalLeave {
                session_id,
                user_id,
            } => {
                if self.hub.user_has_other_session(&user_id, &session_id) {
                    return;
                }
                self.remove_user(&user_id, chrono::Utc::now().timestamp_millis());
            }
            PresenceMsg::PeerDiff {
                user_id,
                fields,
                source_ts,
            } => {
                let verdict = self
                    .presence
                    .apply_peer_diff(&user_id, fields.as_ref(), source_ts);
                if verdict == PeerApply::Stale {
                    self.metrics.presence_diffs_dedup_dropped.inc();
                    return;
                }
                let wire = match fields {
                    Some(fields) => PresenceDiffWire::stamped(&user_id, fields, source_ts),
                    None => PresenceDiffWire::tombstone(&user_id, source_ts),
                };
                self.broadcast_presence(&wire, None);
            }
        }
    }

    /// Remove a user locally and announce the tombstone everywhere, exactly
    /// once per transition.
    fn remove_user(&mut self, user_id: &str, source_ts: i64) {
        if !self.presence.remove(user_id) {
            return;
        }
        let wire = PresenceDiffWire::tombstone(user_id, source_ts);
        self.broadcast_presence(&wire, None);
        self.publisher.publish_presence(&wire);
    }

    fn broadcast_presence(&self, wire: &PresenceDiffWire, origin: Option<&Uuid>) {
        let user = wire.user.clone().unwrap_or_default();
        let frame = match wire.encode().map_err(|e| e.to_string()).and_then(|b| {
            Frame::new(FrameType::PresenceDiff, Bytes::from(b)).map_err(|e| e.to_string())
        }) {
            Ok(frame) => frame,
            Err(e) => {
                error!(room = %self.room_id, error = %e, "presence encode failed");
                return;
            }
        };
        self.hub
            .publish_local(origin, &frame, Some(user.as_str()), &self.metrics, Instant::now());
    }

    async fn handle_storage(&mut self, msg: StorageMsg) {
        match msg {
            StorageMsg::LocalUpdate { session_id, bytes } => {
                self.local_storage_update(session_id, bytes).await;
            }
            StorageMsg::PeerUpdate { bytes, op_seq } => {
                match self.doc.apply(&bytes) {
                    Ok(()) => {
                        self.metrics.storage_ops_applied.inc();
                        if let Some(seq) = op_seq {
                            self.applied_seq = self.applied_seq.max(seq);
                        }
                        self.broadcast_storage(&bytes, None);
                    }
                    Err(e) => {
                        warn!(room = %self.room_id, error = %e, "peer update rejected by kernel");
                    }
                }
            }
        }
    }

    async fn local_storage_update(&mut self, session_id: Uuid, bytes: Bytes) {
        let now = Instant::now();
        if let Some(until) = self.read_only_until {
            if now < until {
                self.hub.send_to(
                    &session_id,
                    Frame::error(ErrorCode::TemporarilyReadOnly, "op store unavailable"),
                    now,
                );
                return;
            }
            self.read_only_until = None;
        }

        let append = tokio::time::timeout(
            APPEND_DEADLINE,
            self.op_store
                .append(&self.room_id, &self.cfg.pod_id, &bytes),
        )
        .await;

        let seq = match append {
            Ok(Ok(seq)) => seq,
            Ok(Err(e)) => {
                self.enter_read_only(&session_id, &e.to_string());
                return;
            }
            Err(_) => {
                self.enter_read_only(&session_id, "append deadline exceeded");
                return;
            }
        };
        self.store_backoff.reset();
        self.metrics.storage_ops_persisted.inc();

        // Durable first; only now may the bytes reach the document.
        if let Err(e) = self.doc.apply(&bytes) {
            warn!(room = %self.room_id, seq, error = %e, "kernel rejected stored update");
            self.hub.send_to(
                &session_id,
                Frame::error(ErrorCode::MalformedFrame, "unreadable storage update"),
                Instant::now(),
            );
            return;
        }
        self.metrics.storage_ops_applied.inc();
        self.applied_seq = self.applied_seq.max(seq);

        self.broadcast_storage(&bytes, Some(&session_id));
        self.publisher.publish_storage(bytes, seq).await;
    }

    fn enter_read_only(&mut self, session_id: &Uuid, reason: &str) {
        let delay = self.store_backoff.next_delay();
        self.read_only_until = Some(Instant::now() + delay);
        warn!(
            room = %self.room_id,
            session = %session_id,
            backoff_ms = delay.as_millis() as u64,
            error = %reason,
            "op store append failed, room temporarily read-only"
        );
        self.hub.send_to(
            session_id,
            Frame::error(ErrorCode::TemporarilyReadOnly, "op store unavailable"),
            Instant::now(),
        );
    }

    fn broadcast_storage(&self, bytes: &Bytes, origin: Option<&Uuid>) {
        let frame = Frame {
            frame_type: FrameType::StorageUpdate,
            payload: bytes.clone(),
        };
        self.hub
            .publish_local(origin, &frame, None, &self.metrics, Instant::now());
    }

    async fn replay_missed_ops(&mut self) -> Result<(), PodError> {
        let records = self
            .op_store
            .range_scan(&self.room_id, self.applied_seq)
            .await
            .map_err(|e| PodError::OpStoreUnavailable(e.to_string()))?;
        for record in records {
            match self.doc.apply(&record.bytes) {
                Ok(()) => {
                    self.metrics.storage_ops_applied.inc();
                    self.broadcast_storage(&Bytes::from(record.bytes), None);
                }
                Err(e) => {
                    warn!(room = %self.room_id, seq = record.seq, error = %e, "skipping unreadable op");
                }
            }
            self.applied_seq = record.seq;
        }
        Ok(())
    }

    async fn sweep_presence(&mut self) {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let ttl_ms = self.cfg.presence_ttl.as_millis() as i64;
        for (user_id, horizon) in self.presence.expire_stale(now_ms, ttl_ms) {
            debug!(room = %self.room_id, user = %user_id, "presence entry expired");
            let wire = PresenceDiffWire::tombstone(&user_id, horizon);
            self.broadcast_presence(&wire, None);
            self.publisher.publish_presence(&wire);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::egress::EgressQueue;
    use crate::store::MemoryOpStore;
    use crate::stream::{bridge, MemoryStreamLog};

    struct TestRoom {
        handle: RoomHandle,
        store: Arc<MemoryOpStore>,
        metrics: Arc<PodMetrics>,
    }

    fn spawn_test_room() -> TestRoom {
        let cfg = Arc::new(PodConfig::for_tests());
        let metrics = Arc::new(PodMetrics::new());
        let store = Arc::new(MemoryOpStore::new());
        let log = Arc::new(MemoryStreamLog::new());
        let publisher =
            bridge::spawn_publisher("R", log, cfg.clone(), metrics.clone());
        let (idle_tx, _idle_rx) = mpsc::unbounded_channel();
        let handle = spawn_room(
            "R".to_string(),
            cfg,
            metrics.clone(),
            store.clone(),
            publisher,
            idle_tx,
        );
        TestRoom {
            handle,
            store,
            metrics,
        }
    }

    fn seat(user: &str) -> Seat {
        Seat {
            session_id: Uuid::new_v4(),
            user_id: user.to_string(),
            egress: EgressQueue::new(64 * 1024, 256),
        }
    }

    async fn next_frame(queue: &EgressQueue, timeout: Duration) -> Option<Frame> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(frame) = queue.pop(Instant::now()) {
                return Some(frame);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn drain_initial_sync(queue: &EgressQueue) {
        let first = next_frame(queue, Duration::from_secs(1)).await.unwrap();
        assert_eq!(first.frame_type, FrameType::PresenceSync);
        let second = next_frame(queue, Duration::from_secs(1)).await.unwrap();
        assert_eq!(second.frame_type, FrameType::StorageSync);
    }

    fn loro_update(text: &str) -> Bytes {
        let doc = loro::LoroDoc::new();
        doc.get_text("content").insert(0, text).unwrap();
        Bytes::from(doc.export(loro::ExportMode::all_updates()).unwrap())
    }

    #[tokio::test]
    async fn test_storage_refused_while_store_down_presence_still_flows() {
        let room = spawn_test_room();
        let a = seat("u1");
        let b = seat("u2");
        room.handle.attach(a.clone()).await.unwrap();
        room.handle.attach(b.clone()).await.unwrap();
        drain_initial_sync(&a.egress).await;
        drain_initial_sync(&b.egress).await;

        room.store.set_available(false);

        assert!(
            room.handle
                .send_storage(
                    StorageMsg::LocalUpdate {
                        session_id: a.session_id,
                        bytes: loro_update("lost"),
                    },
                    Duration::from_secs(1),
                )
                .await
        );

        // The origin hears it is temporarily read-only.
        let err = next_frame(&a.egress, Duration::from_secs(2)).await.unwrap();
        assert_eq!(err.frame_type, FrameType::Error);
        let (code, _) = err.error_parts().unwrap();
        assert_eq!(code, ErrorCode::TemporarilyReadOnly.as_u16());
        assert_eq!(room.metrics.storage_ops_persisted.get(), 0);

        // Presence keeps applying locally while storage is refused.
        let mut fields = FieldBag::new();
        fields.insert("status".to_string(), rmpv::Value::from("here"));
        assert!(room.handle.offer_presence(PresenceMsg::LocalDiff {
            session_id: a.session_id,
            user_id: "u1".to_string(),
            fields,
        }));
        let diff = next_frame(&b.egress, Duration::from_secs(2)).await.unwrap();
        assert_eq!(diff.frame_type, FrameType::PresenceDiff);
    }

    #[tokio::test]
    async fn test_storage_recovers_after_backoff() {
        let room = spawn_test_room();
        let a = seat("u1");
        let b = seat("u2");
        room.handle.attach(a.clone()).await.unwrap();
        room.handle.attach(b.clone()).await.unwrap();
        drain_initial_sync(&a.egress).await;
        drain_initial_sync(&b.egress).await;

        room.store.set_available(false);
        room.handle
            .send_storage(
                StorageMsg::LocalUpdate {
                    session_id: a.session_id,
                    bytes: loro_update("first try"),
                },
                Duration::from_secs(1),
            )
            .await;
        next_frame(&a.egress, Duration::from_secs(2)).await.unwrap();

        room.store.set_available(true);
        // Past the first backoff window (base 100ms +/- jitter).
        tokio::time::sleep(Duration::from_millis(300)).await;

        room.handle
            .send_storage(
                StorageMsg::LocalUpdate {
                    session_id: a.session_id,
                    bytes: loro_update("landed"),
                },
                Duration::from_secs(1),
            )
            .await;

        // The peer session observes the broadcast, and the op is durable
        // with the store-assigned sequence.
        let update = next_frame(&b.egress, Duration::from_secs(2)).await.unwrap();
        assert_eq!(update.frame_type, FrameType::StorageUpdate);
        assert_eq!(room.metrics.storage_ops_persisted.get(), 1);
        assert_eq!(room.store.len("R"), 1);
    }

    #[tokio::test]
    async fn test_attach_enforces_room_capacity() {
        let mut cfg = PodConfig::for_tests();
        cfg.max_sessions_per_room = 1;
        let metrics = Arc::new(PodMetrics::new());
        let store = Arc::new(MemoryOpStore::new());
        let log = Arc::new(MemoryStreamLog::new());
        let publisher = bridge::spawn_publisher("R", log, Arc::new(cfg.clone()), metrics.clone());
        let (idle_tx, _idle_rx) = mpsc::unbounded_channel();
        let handle = spawn_room(
            "R".to_string(),
            Arc::new(cfg),
            metrics,
            store,
            publisher,
            idle_tx,
        );

        handle.attach(seat("u1")).await.unwrap();
        match handle.attach(seat("u2")).await {
            Err(PodError::RoomCapacityExceeded(room)) => assert_eq!(room, "R"),
            other => panic!("expected capacity error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_last_detach_notifies_idle() {
        let cfg = Arc::new(PodConfig::for_tests());
        let metrics = Arc::new(PodMetrics::new());
        let store = Arc::new(MemoryOpStore::new());
        let log = Arc::new(MemoryStreamLog::new());
        let publisher = bridge::spawn_publisher("R", log, cfg.clone(), metrics.clone());
        let (idle_tx, mut idle_rx) = mpsc::unbounded_channel();
        let handle = spawn_room(
            "R".to_string(),
            cfg,
            metrics,
            store,
            publisher,
            idle_tx,
        );

        let s = seat("u1");
        let session_id = s.session_id;
        handle.attach(s).await.unwrap();
        handle.detach(session_id);

        let room_id = tokio::time::timeout(Duration::from_secs(1), idle_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(room_id, "R");
        assert!(handle.stop_if_idle().await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_alive());
    }
}


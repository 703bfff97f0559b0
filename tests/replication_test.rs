//! Cross-pod replication tests: storage convergence through the shared
//! stream, cold replay from the op store, and gap-forced full sync. Two
//! "pods" are two registries sharing one in-memory stream log and one
//! in-memory op store, which is exactly the production topology in
//! miniature.

use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use podsync::config::PodConfig;
use podsync::metrics::PodMetrics;
use podsync::protocol::frame::FrameType;
use podsync::protocol::Frame;
use podsync::room::coordinator::StorageMsg;
use podsync::room::{spawn_registry, RegistryHandle, Seat};
use podsync::session::egress::EgressQueue;
use podsync::store::{MemoryOpStore, OpStore};
use podsync::stream::{
    room_stream_name, MemoryStreamLog, RecordKind, StreamLog, StreamRecord,
};

struct TestPod {
    registry: RegistryHandle,
    metrics: Arc<PodMetrics>,
}

fn spawn_pod(
    pod_id: &str,
    store: Arc<MemoryOpStore>,
    log: MemoryStreamLog,
) -> TestPod {
    let mut cfg = PodConfig::for_tests();
    cfg.pod_id = pod_id.to_string();
    let metrics = Arc::new(PodMetrics::new());
    let registry = spawn_registry(
        Arc::new(cfg),
        metrics.clone(),
        store,
        Arc::new(log),
    );
    TestPod { registry, metrics }
}

fn seat(user: &str) -> Seat {
    Seat {
        session_id: Uuid::new_v4(),
        user_id: user.to_string(),
        egress: EgressQueue::new(64 * 1024, 256),
    }
}

fn update_inserting(text: &str) -> Vec<u8> {
    let doc = loro::LoroDoc::new();
    doc.get_text("content").insert(0, text).unwrap();
    doc.export(loro::ExportMode::all_updates()).unwrap()
}

fn text_of(snapshot: &[u8]) -> String {
    let doc = loro::LoroDoc::new();
    doc.import(snapshot).unwrap();
    doc.get_text("content").to_string()
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
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn drain_initial_sync(queue: &EgressQueue) -> Vec<u8> {
    let first = next_frame(queue, Duration::from_secs(1)).await.unwrap();
    assert_eq!(first.frame_type, FrameType::PresenceSync);
    let second = next_frame(queue, Duration::from_secs(1)).await.unwrap();
    assert_eq!(second.frame_type, FrameType::StorageSync);
    second.payload.to_vec()
}

async fn wait_for_storage_frame(queue: &EgressQueue, timeout: Duration) -> Frame {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match next_frame(queue, Duration::from_millis(50)).await {
            Some(frame) if frame.frame_type == FrameType::StorageUpdate => return frame,
            Some(_) => continue,
            None => assert!(
                tokio::time::Instant::now() < deadline,
                "no storage frame within deadline"
            ),
        }
    }
}

async fn resync_snapshot(
    room: &podsync::room::RoomHandle,
    queue: &EgressQueue,
    session_id: Uuid,
) -> Vec<u8> {
    room.resync(session_id);
    loop {
        let frame = next_frame(queue, Duration::from_secs(2))
            .await
            .expect("resync frames");
        if frame.frame_type == FrameType::StorageSync {
            return frame.payload.to_vec();
        }
    }
}

#[tokio::test]
async fn test_storage_converges_across_pods() {
    let store = Arc::new(MemoryOpStore::new());
    let log = MemoryStreamLog::new();
    let p1 = spawn_pod("pod-1", store.clone(), log.clone());
    let p2 = spawn_pod("pod-2", store.clone(), log.clone());

    let room1 = p1.registry.attach("R").await.unwrap();
    let room2 = p2.registry.attach("R").await.unwrap();
    let s1 = seat("u1");
    let s2 = seat("u2");
    room1.attach(s1.clone()).await.unwrap();
    room2.attach(s2.clone()).await.unwrap();
    drain_initial_sync(&s1.egress).await;
    drain_initial_sync(&s2.egress).await;

    let u1 = update_inserting("from pod one ");
    let u2 = update_inserting("from pod two ");

    assert!(
        room1
            .send_storage(
                StorageMsg::LocalUpdate {
                    session_id: s1.session_id,
                    bytes: Bytes::from(u1.clone()),
                },
                Duration::from_secs(1),
            )
            .await
    );
    assert!(
        room2
            .send_storage(
                StorageMsg::LocalUpdate {
                    session_id: s2.session_id,
                    bytes: Bytes::from(u2.clone()),
                },
                Duration::from_secs(1),
            )
            .await
    );

    // Each pod's local session observes the other pod's update through the
    // stream bridge.
    wait_for_storage_frame(&s1.egress, Duration::from_secs(5)).await;
    wait_for_storage_frame(&s2.egress, Duration::from_secs(5)).await;

    let snap1 = resync_snapshot(&room1, &s1.egress, s1.session_id).await;
    let snap2 = resync_snapshot(&room2, &s2.egress, s2.session_id).await;

    // Both replicas converged to the same merged state, and that state is
    // the one produced by applying both updates (in either order) to an
    // empty document.
    let reference = loro::LoroDoc::new();
    reference.import(&u1).unwrap();
    reference.import(&u2).unwrap();
    let expected = reference.get_text("content").to_string();

    assert_eq!(text_of(&snap1), expected);
    assert_eq!(text_of(&snap2), expected);

    // Durable-before-broadcast: every observed update is in the op store.
    assert_eq!(store.len("R"), 2);
    let ops = store.range_scan("R", 0).await.unwrap();
    assert_eq!(ops[0].seq, 1);
    assert_eq!(ops[1].seq, 2);
}

#[tokio::test]
async fn test_cold_replay_reconstructs_room() {
    let store = Arc::new(MemoryOpStore::new());
    let log = MemoryStreamLog::new();

    // Op history exists before this pod ever hosts the room.
    let o1 = update_inserting("alpha ");
    let o2 = update_inserting("beta ");
    let o3 = update_inserting("gamma ");
    for op in [&o1, &o2, &o3] {
        store.append("R", "pod-old", op).await.unwrap();
    }
    let reference = loro::LoroDoc::new();
    for op in [&o1, &o2, &o3] {
        reference.import(op).unwrap();
    }
    let expected = reference.get_text("content").to_string();

    let pod = spawn_pod("pod-new", store.clone(), log);
    let room = pod.registry.attach("R").await.unwrap();
    let s = seat("u1");
    room.attach(s.clone()).await.unwrap();

    // The very first storage sync reflects the replayed history.
    let snapshot = drain_initial_sync(&s.egress).await;
    assert_eq!(text_of(&snapshot), expected);
}

#[tokio::test]
async fn test_stream_gap_forces_full_sync() {
    let store = Arc::new(MemoryOpStore::new());
    let log = MemoryStreamLog::new();
    let pod = spawn_pod("pod-1", store.clone(), log.clone());

    let room = pod.registry.attach("R").await.unwrap();
    let s = seat("u1");
    room.attach(s.clone()).await.unwrap();
    drain_initial_sync(&s.egress).await;

    // Give the consumer a beat to park its cursor at the head.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stream = room_stream_name("R");
    let x1 = update_inserting("one ");
    let x2 = update_inserting("two ");
    let x3 = update_inserting("three ");

    // A peer pod publishes normally...
    let seq1 = store.append("R", "pod-peer", &x1).await.unwrap();
    log.append(
        &stream,
        &StreamRecord {
            pod: "pod-peer".to_string(),
            seq: 1,
            kind: RecordKind::Storage,
            payload: Bytes::from(x1.clone()),
            op_seq: Some(seq1),
        },
        1000,
    )
    .await
    .unwrap();
    wait_for_storage_frame(&s.egress, Duration::from_secs(5)).await;

    // ...then keeps appending to the op store, but its stream entry for
    // the second op is trimmed away before this pod reads it.
    let _seq2 = store.append("R", "pod-peer", &x2).await.unwrap();
    let seq3 = store.append("R", "pod-peer", &x3).await.unwrap();
    log.append(
        &stream,
        &StreamRecord {
            pod: "pod-peer".to_string(),
            seq: 3,
            kind: RecordKind::Storage,
            payload: Bytes::from(x3.clone()),
            op_seq: Some(seq3),
        },
        1000,
    )
    .await
    .unwrap();

    // The sequence jump forces a full sync instead of advancing through
    // the gap.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while pod.metrics.stream_full_syncs.get() == 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "gap never triggered a full sync"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Post-sync state contains every durable op, including the one whose
    // stream entry was never seen.
    let reference = loro::LoroDoc::new();
    for op in [&x1, &x2, &x3] {
        reference.import(op).unwrap();
    }
    let expected = reference.get_text("content").to_string();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let snapshot = resync_snapshot(&room, &s.egress, s.session_id).await;
        if text_of(&snapshot) == expected {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "replica never converged after full sync"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Lag settles back to zero once the consumer is at the head again.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while pod.metrics.stream_lag_entries.get("R") != 0 {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

//! Stream Bridge
//!
//! Per-room producer and consumer connecting a pod to the replicated log.
//!
//! Producer: the coordinator hands stamped presence diffs and durably
//! appended storage ops to a writer task. Presence is lossy and gets one
//! append attempt; storage is at-least-once and retries until it lands.
//! Origin-local sequence numbers advance only on a successful append, so a
//! consumer seeing a jump in a pod's sequence knows entries were trimmed
//! away before it read them.
//!
//! Consumer: reads forward from a cursor, skips this pod's own echoes,
//! applies peer entries through the room coordinator, and falls back to a
//! full op-store replay when it detects a gap.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::PodConfig;
use crate::error::Backoff;
use crate::metrics::PodMetrics;
use crate::protocol::PresenceDiffWire;
use crate::room::coordinator::{PresenceMsg, RoomHandle, StorageMsg};
use crate::stream::{room_stream_name, EntryId, RecordKind, StreamLog, StreamRecord};

/// Writer inbox bound.
const PUBLISH_CAPACITY: usize = 256;

/// How long the coordinator waits to hand a storage entry to the writer.
const PUBLISH_DEADLINE: Duration = Duration::from_secs(5);

/// How long the coordinator waits to hand a peer storage entry over.
const PEER_APPLY_DEADLINE: Duration = Duration::from_secs(5);

/// Block timeout for one stream read.
const READ_BLOCK: Duration = Duration::from_secs(2);

/// Entries fetched per read.
const READ_BATCH: usize = 128;

/// Age-trim cadence.
const TRIM_INTERVAL: Duration = Duration::from_secs(10);

enum PublishCmd {
    Presence(Bytes),
    Storage { bytes: Bytes, op_seq: i64 },
}

/// Producer handle the coordinator publishes through.
#[derive(Clone)]
pub struct StreamPublisher {
    tx: mpsc::Sender<PublishCmd>,
}

impl StreamPublisher {
    /// Offer a presence entry. Lossy: a full writer inbox drops it.
    pub fn publish_presence(&self, wire: &PresenceDiffWire) -> bool {
        match wire.encode() {
            Ok(encoded) => self
                .tx
                .try_send(PublishCmd::Presence(Bytes::from(encoded)))
                .is_ok(),
            Err(_) => false,
        }
    }

    /// Queue a durably appended storage op for replication.
    pub async fn publish_storage(&self, bytes: Bytes, op_seq: i64) -> bool {
        tokio::time::timeout(
            PUBLISH_DEADLINE,
            self.tx.send(PublishCmd::Storage { bytes, op_seq }),
        )
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false)
    }
}

/// Spawn the producer task for a room. The returned publisher keeps the
/// task alive; the task drains and exits once every publisher clone drops.
pub fn spawn_publisher(
    room_id: &str,
    log: Arc<dyn StreamLog>,
    cfg: Arc<PodConfig>,
    metrics: Arc<PodMetrics>,
) -> StreamPublisher {
    let (tx, rx) = mpsc::channel(PUBLISH_CAPACITY);
    let stream = room_stream_name(room_id);
    tokio::spawn(publisher_task(stream, log, cfg, metrics, rx));
    StreamPublisher { tx }
}

async fn publisher_task(
    stream: String,
    log: Arc<dyn StreamLog>,
    cfg: Arc<PodConfig>,
    metrics: Arc<PodMetrics>,
    mut rx: mpsc::Receiver<PublishCmd>,
) {
    let mut next_seq: u64 = 1;
    let mut backoff = Backoff::new();
    let mut trim = tokio::time::interval(TRIM_INTERVAL);
    trim.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let cmd = tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(cmd) => cmd,
                None => break,
            },
            _ = trim.tick() => {
                let horizon_ms = (chrono::Utc::now()
                    - chrono::Duration::from_std(cfg.stream_max_age).unwrap_or_default())
                .timestamp_millis()
                .max(0) as u64;
                let min = EntryId { ms: horizon_ms, seq: 0 };
                if let Err(e) = log.trim_before(&stream, min).await {
                    debug!(stream = %stream, error = %e, "age trim failed");
                }
                continue;
            }
        };

        match cmd {
            PublishCmd::Presence(payload) => {
                let record = StreamRecord {
                    pod: cfg.pod_id.clone(),
                    seq: next_seq,
                    kind: RecordKind::Presence,
                    payload,
                    op_seq: None,
                };
                match log.append(&stream, &record, cfg.stream_max_entries).await {
                    Ok(_) => {
                        next_seq += 1;
                        backoff.reset();
                    }
                    Err(e) => {
                        // Presence is lossy; the sequence does not advance,
                        // so peers see no gap from this drop.
                        metrics.egress_drops.inc("stream_presence");
                        debug!(stream = %stream, error = %e, "presence append dropped");
                    }
                }
            }
            PublishCmd::Storage { bytes, op_seq } => {
                let record = StreamRecord {
                    pod: cfg.pod_id.clone(),
                    seq: next_seq,
                    kind: RecordKind::Storage,
                    payload: bytes,
                    op_seq: Some(op_seq),
                };
                // At-least-once: peers must be able to observe every
                // durable op, so keep trying until the backend takes it.
                loop {
                    match log.append(&stream, &record, cfg.stream_max_entries).await {
                        Ok(_) => {
                            next_seq += 1;
                            backoff.reset();
                            break;
                        }
                        Err(e) => {
                            warn!(stream = %stream, op_seq, error = %e, "storage append retrying");
                            tokio::time::sleep(backoff.next_delay()).await;
                        }
                    }
                }
            }
        }
    }
}

/// Spawn the consumer task for a room. It exits when the room's
/// coordinator goes away.
pub fn spawn_consumer(
    room_id: &str,
    handle: RoomHandle,
    log: Arc<dyn StreamLog>,
    cfg: Arc<PodConfig>,
    metrics: Arc<PodMetrics>,
) -> tokio::task::JoinHandle<()> {
    let room_id = room_id.to_string();
    tokio::spawn(consumer_task(room_id, handle, log, cfg, metrics))
}

async fn consumer_task(
    room_id: String,
    handle: RoomHandle,
    log: Arc<dyn StreamLog>,
    cfg: Arc<PodConfig>,
    metrics: Arc<PodMetrics>,
) {
    let stream = room_stream_name(&room_id);
    let mut backoff = Backoff::new();

    // Live traffic starts at the head; everything older was covered by the
    // coordinator's cold replay from the op store.
    let mut cursor = loop {
        match log.head_id(&stream).await {
            Ok(id) => break id,
            Err(e) => {
                if !handle.is_alive() {
                    return;
                }
                warn!(room = %room_id, error = %e, "stream head probe failed");
                tokio::time::sleep(backoff.next_delay()).await;
            }
        }
    };

    // Last seen origin sequence per peer pod; a jump means the stream
    // trimmed entries we never read.
    let mut peer_seqs: HashMap<String, u64> = HashMap::new();

    while handle.is_alive() {
        let batch = match log
            .read_blocking(&stream, cursor, READ_BATCH, READ_BLOCK)
            .await
        {
            Ok(batch) => {
                backoff.reset();
                batch
            }
            Err(e) => {
                warn!(room = %room_id, error = %e, "stream read failed");
                tokio::time::sleep(backoff.next_delay()).await;
                continue;
            }
        };

        if batch.is_empty() {
            metrics.stream_lag_entries.set(&room_id, 0);
            continue;
        }
        let full_batch = batch.len() == READ_BATCH;

        for (id, record) in batch {
            if record.pod == cfg.pod_id {
                cursor = id;
                continue;
            }

            let last = peer_seqs.get(&record.pod).copied();
            if let Some(last) = last {
                if record.seq <= last {
                    // At-least-once redelivery.
                    cursor = id;
                    continue;
                }
                if record.seq > last + 1 {
                    // Entries from this pod were trimmed before we read
                    // them. Do not advance through the gap; recover from
                    // the op store instead.
                    metrics.stream_full_syncs.inc();
                    warn!(
                        room = %room_id,
                        pod = %record.pod,
                        expected = last + 1,
                        got = record.seq,
                        "stream gap detected, full sync"
                    );
                    match handle.full_sync().await {
                        Ok(()) => {
                            cursor = log.head_id(&stream).await.unwrap_or(cursor);
                            peer_seqs.clear();
                            metrics.stream_lag_entries.set(&room_id, 0);
                        }
                        Err(e) => {
                            warn!(room = %room_id, error = %e, "full sync failed, will retry");
                            tokio::time::sleep(backoff.next_delay()).await;
                        }
                    }
                    break;
                }
            }

            if apply_peer_record(&handle, &record).await {
                peer_seqs.insert(record.pod.clone(), record.seq);
                cursor = id;
            } else if !handle.is_alive() {
                return;
            } else {
                // Storage lane stalled; retry the same entry.
                tokio::time::sleep(backoff.next_delay()).await;
                break;
            }
        }

        if full_batch {
            if let Ok(pending) = log.range(&stream, cursor, cfg.stream_max_entries).await {
                metrics
                    .stream_lag_entries
                    .set(&room_id, pending.len() as i64);
            }
        } else {
            metrics.stream_lag_entries.set(&room_id, 0);
        }
    }
}

/// Apply one peer entry through the coordinator. Returns `false` when the
/// entry could not be handed over and should be retried.
async fn apply_peer_record(handle: &RoomHandle, record: &StreamRecord) -> bool {
    match record.kind {
        RecordKind::Presence => {
            let wire = match PresenceDiffWire::decode(&record.payload) {
                Ok(wire) => wire,
                Err(e) => {
                    debug!(pod = %record.pod, error = %e, "undecodable peer presence entry");
                    return true;
                }
            };
            let (Some(user_id), Some(source_ts)) = (wire.user, wire.source_ts) else {
                debug!(pod = %record.pod, "peer presence entry missing identity");
                return true;
            };
            // Presence is lossy; a full lane drops the entry.
            handle.offer_presence(PresenceMsg::PeerDiff {
                user_id,
                fields: wire.fields,
                source_ts,
            });
            true
        }
        RecordKind::Storage => {
            handle
                .send_storage(
                    StorageMsg::PeerUpdate {
                        bytes: record.payload.clone(),
                        op_seq: record.op_seq,
                    },
                    PEER_APPLY_DEADLINE,
                )
                .await
        }
    }
}

//! # Sessions
//!
//! One client connection to the pod in one room. A session runs two tasks:
//! the ingress loop (this module) decoding and dispatching frames through
//! an admission pipeline composed at construction, and an egress writer
//! draining the bounded outbound queue. State machine:
//!
//! ```text
//! Opening --(auth ok, attach ok)--> Live
//! Opening --(auth fail | attach fail)--> Closed
//! Live --(drain signal | keepalive timeout)--> Draining
//! Live --(fatal error)--> Closed
//! Draining --(egress flushed | timeout)--> Closed
//! ```

pub mod egress;
pub mod pipeline;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::TokenVerifier;
use crate::config::PodConfig;
use crate::error::{ErrorCode, PodError};
use crate::metrics::PodMetrics;
use crate::protocol::{ControlKind, Frame, FrameType, PresenceDiffWire};
use crate::room::coordinator::{PresenceMsg, RoomHandle, StorageMsg};
use crate::room::hub::Seat;
use crate::room::registry::RegistryHandle;
use egress::EgressQueue;
use pipeline::{Admission, IngressPipeline};

/// Pod-to-client liveness probe cadence.
const PING_INTERVAL: Duration = Duration::from_secs(20);
/// A client that stays silent this long is drained.
const PONG_TIMEOUT: Duration = Duration::from_secs(40);
/// Deadline for one transport write.
const WRITE_DEADLINE: Duration = Duration::from_secs(10);
/// Deadline for handing a storage frame to the room coordinator.
const STORAGE_DISPATCH_DEADLINE: Duration = Duration::from_secs(5);
/// Cadence of the slow-consumer check.
const SLOW_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Authenticating and attaching.
    Opening,
    /// Serving traffic.
    Live,
    /// Flushing egress before close.
    Draining,
    /// Done.
    Closed,
}

/// Why a session ended. Becomes the `session_closes` metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Token failed the signature, expiry, or room re-check.
    Unauthorized,
    /// Room attach was refused.
    AttachFailed,
    /// Malformed-frame budget exhausted, or a server-only frame arrived.
    ProtocolViolation,
    /// Sustained rate violation.
    RateLimited,
    /// Egress queue stayed full past the slow-client timeout.
    SlowConsumer,
    /// No pong within the keepalive window.
    KeepaliveTimeout,
    /// Pod shutdown drain.
    Drain,
    /// Client closed the connection.
    ClientClosed,
    /// Transport read or write failed.
    TransportError,
    /// The room coordinator stopped answering within its deadline.
    InboxTimeout,
}

impl CloseReason {
    /// Metrics label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::AttachFailed => "attach_failed",
            Self::ProtocolViolation => "protocol_violation",
            Self::RateLimited => "rate_limited",
            Self::SlowConsumer => "slow_consumer",
            Self::KeepaliveTimeout => "keepalive_timeout",
            Self::Drain => "drain",
            Self::ClientClosed => "client_closed",
            Self::TransportError => "transport_error",
            Self::InboxTimeout => "inbox_timeout",
        }
    }
}

/// Everything a session needs from the pod.
#[derive(Clone)]
pub struct SessionContext {
    /// Pod configuration.
    pub cfg: Arc<PodConfig>,
    /// Pod metrics.
    pub metrics: Arc<PodMetrics>,
    /// Room registry.
    pub registry: RegistryHandle,
    /// Session token verifier.
    pub verifier: TokenVerifier,
    /// Flipped to `true` when the pod drains for shutdown.
    pub shutdown: watch::Receiver<bool>,
}

/// Serve one client connection end to end.
pub async fn run(socket: WebSocket, room_id: String, token: String, ctx: SessionContext) {
    let session_id = Uuid::new_v4();
    let mut state = SessionState::Opening;

    // Opening: the edge is trusted for identity, the pod re-checks the
    // signature.
    let claims = match ctx.verifier.verify(&token, &room_id, chrono::Utc::now()) {
        Ok(claims) => claims,
        Err(e) => {
            debug!(session = %session_id, room = %room_id, state = ?state, error = %e, "session rejected");
            close_unattached(socket, ErrorCode::Unauthorized, "invalid session token").await;
            ctx.metrics
                .session_closes
                .inc(CloseReason::Unauthorized.label());
            return;
        }
    };
    let user_id = claims.user_id;

    if *ctx.shutdown.borrow() {
        close_unattached(socket, ErrorCode::Shutdown, "pod is draining").await;
        ctx.metrics.session_closes.inc(CloseReason::Drain.label());
        return;
    }

    let queue = EgressQueue::new(ctx.cfg.egress_bytes, ctx.cfg.egress_frames);
    let seat = Seat {
        session_id,
        user_id: user_id.clone(),
        egress: queue.clone(),
    };

    // Attach, retrying once: the room can be mid-destruction when we looked
    // it up, in which case the registry recreates it.
    let mut room: Option<RoomHandle> = None;
    let mut attach_err = PodError::Shutdown;
    for _ in 0..2 {
        match ctx.registry.attach(&room_id).await {
            Ok(handle) => match handle.attach(seat.clone()).await {
                Ok(()) => {
                    room = Some(handle);
                    break;
                }
                Err(PodError::Shutdown) => {
                    attach_err = PodError::Shutdown;
                    continue;
                }
                Err(e) => {
                    attach_err = e;
                    break;
                }
            },
            Err(e) => {
                attach_err = e;
                break;
            }
        }
    }
    let Some(room) = room else {
        warn!(session = %session_id, room = %room_id, error = %attach_err, "attach failed");
        close_unattached(socket, attach_err.wire_code(), &attach_err.to_string()).await;
        ctx.metrics
            .session_closes
            .inc(CloseReason::AttachFailed.label());
        return;
    };

    state = SessionState::Live;
    info!(session = %session_id, room = %room_id, user = %user_id, state = ?state, "session live");

    let (ws_tx, ws_rx) = socket.split();
    let writer = tokio::spawn(egress_writer(ws_tx, queue.clone(), ctx.metrics.clone()));

    let reason = ingress_loop(
        ws_rx,
        &ctx,
        &room,
        session_id,
        &user_id,
        &queue,
    )
    .await;

    state = SessionState::Draining;
    debug!(session = %session_id, room = %room_id, state = ?state, reason = reason.label(), "session draining");

    // Goodbye frame for reasons the client should hear about.
    let now = Instant::now();
    match reason {
        CloseReason::ProtocolViolation => {
            let _ = queue.push(
                Frame::error(ErrorCode::ProtocolViolation, "malformed frame budget exhausted"),
                None,
                now,
            );
        }
        CloseReason::RateLimited => {
            let _ = queue.push(
                Frame::error(ErrorCode::RateLimited, "sustained rate violation"),
                None,
                now,
            );
        }
        CloseReason::SlowConsumer => {
            let _ = queue.push(
                Frame::error(ErrorCode::SlowConsumer, "egress queue overflow"),
                None,
                now,
            );
        }
        CloseReason::Drain => {
            let _ = queue.push(Frame::control(ControlKind::Drain), None, now);
        }
        _ => {}
    }

    room.detach(session_id);
    queue.close_input();

    // Draining -> Closed once egress flushes or the drain timeout fires.
    if tokio::time::timeout(ctx.cfg.drain_timeout, writer).await.is_err() {
        debug!(session = %session_id, "drain timeout, forcing close");
    }

    state = SessionState::Closed;
    ctx.metrics.session_closes.inc(reason.label());
    info!(session = %session_id, room = %room_id, state = ?state, reason = reason.label(), "session closed");
}

/// Send one error frame on a not-yet-attached socket and close it.
async fn close_unattached(mut socket: WebSocket, code: ErrorCode, message: &str) {
    let frame = Frame::error(code, message);
    let _ = tokio::time::timeout(
        WRITE_DEADLINE,
        socket.send(Message::Binary(frame.encode().to_vec())),
    )
    .await;
    let _ = socket.close().await;
}

async fn ingress_loop(
    mut ws_rx: SplitStream<WebSocket>,
    ctx: &SessionContext,
    room: &RoomHandle,
    session_id: Uuid,
    user_id: &str,
    queue: &EgressQueue,
) -> CloseReason {
    let mut pipeline = IngressPipeline::new(Instant::now());
    let mut shutdown = ctx.shutdown.clone();

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut slow_check = tokio::time::interval(SLOW_CHECK_INTERVAL);
    slow_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                // A dropped sender means the pod is going away too.
                if changed.is_err() || *shutdown.borrow() {
                    return CloseReason::Drain;
                }
            }
            _ = slow_check.tick() => {
                if let Some(slow) = queue.slow_for(Instant::now()) {
                    if slow >= ctx.cfg.slow_client_timeout {
                        return CloseReason::SlowConsumer;
                    }
                }
            }
            _ = ping.tick() => {
                if last_pong.elapsed() >= PONG_TIMEOUT {
                    return CloseReason::KeepaliveTimeout;
                }
                let _ = queue.push(Frame::control(ControlKind::Ping), None, Instant::now());
            }
            maybe = ws_rx.next() => {
                let message = match maybe {
                    None => return CloseReason::ClientClosed,
                    Some(Err(e)) => {
                        debug!(session = %session_id, error = %e, "transport read failed");
                        return CloseReason::TransportError;
                    }
                    Some(Ok(message)) => message,
                };
                let data = match message {
                    Message::Binary(data) => data,
                    Message::Close(_) => return CloseReason::ClientClosed,
                    // Transport-level ping/pong and text are outside the
                    // protocol; ignore them.
                    _ => continue,
                };

                let now = Instant::now();
                let frame = match Frame::decode(&data) {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!(session = %session_id, error = %e, "malformed frame");
                        ctx.metrics.malformed_frames.inc();
                        if pipeline.record_malformed(now) {
                            return CloseReason::ProtocolViolation;
                        }
                        continue;
                    }
                };
                ctx.metrics.frames_in.inc(frame.frame_type.label());

                match pipeline.admit(&frame, now) {
                    Admission::Forward => {}
                    Admission::RateLimited => {
                        ctx.metrics.rate_limited_frames.inc();
                        continue;
                    }
                    Admission::SustainedViolation => {
                        return CloseReason::RateLimited;
                    }
                }

                match frame.frame_type {
                    FrameType::PresenceDiff => {
                        let wire = match PresenceDiffWire::decode(&frame.payload) {
                            Ok(wire) => wire,
                            Err(e) => {
                                debug!(session = %session_id, error = %e, "undecodable presence diff");
                                ctx.metrics.malformed_frames.inc();
                                if pipeline.record_malformed(now) {
                                    return CloseReason::ProtocolViolation;
                                }
                                continue;
                            }
                        };
                        // The session identity wins over anything the
                        // client wrote into the record.
                        let msg = match wire.fields {
                            Some(fields) => PresenceMsg::LocalDiff {
                                session_id,
                                user_id: user_id.to_string(),
                                fields,
                            },
                            None => PresenceMsg::LocalLeave {
                                session_id,
                                user_id: user_id.to_string(),
                            },
                        };
                        if !room.offer_presence(msg) {
                            // Presence is lossy under coordinator pressure.
                            ctx.metrics.egress_drops.inc("presence_inbox");
                        }
                    }
                    FrameType::StorageUpdate => {
                        let delivered = room
                            .send_storage(
                                StorageMsg::LocalUpdate {
                                    session_id,
                                    bytes: frame.payload.clone(),
                                },
                                STORAGE_DISPATCH_DEADLINE,
                            )
                            .await;
                        if !delivered {
                            warn!(session = %session_id, "storage dispatch deadline exceeded");
                            return CloseReason::InboxTimeout;
                        }
                    }
                    FrameType::Control => match frame.control_kind() {
                        Ok(ControlKind::Pong) => {
                            last_pong = Instant::now();
                        }
                        Ok(ControlKind::Ping) => {
                            let _ = queue.push(Frame::control(ControlKind::Pong), None, now);
                        }
                        Ok(ControlKind::Resync) => {
                            room.resync(session_id);
                        }
                        Ok(ControlKind::Drain) => {
                            return CloseReason::ClientClosed;
                        }
                        Err(e) => {
                            debug!(session = %session_id, error = %e, "bad control frame");
                            ctx.metrics.malformed_frames.inc();
                            if pipeline.record_malformed(now) {
                                return CloseReason::ProtocolViolation;
                            }
                        }
                    },
                    // Server-to-client only.
                    FrameType::PresenceSync | FrameType::StorageSync => {
                        ctx.metrics.malformed_frames.inc();
                        if pipeline.record_malformed(now) {
                            return CloseReason::ProtocolViolation;
                        }
                    }
                    FrameType::Error => {
                        if let Ok((code, message)) = frame.error_parts() {
                            debug!(session = %session_id, code, message = %message, "client error frame");
                        }
                    }
                }
            }
        }
    }
}

async fn egress_writer(
    mut sink: SplitSink<WebSocket, Message>,
    queue: EgressQueue,
    metrics: Arc<PodMetrics>,
) {
    loop {
        let now = Instant::now();
        if let Some(frame) = queue.pop(now) {
            let label = frame.frame_type.label();
            let write = tokio::time::timeout(
                WRITE_DEADLINE,
                sink.send(Message::Binary(frame.encode().to_vec())),
            )
            .await;
            match write {
                Ok(Ok(())) => metrics.frames_out.inc(label),
                _ => break,
            }
        } else {
            if queue.input_closed() {
                break;
            }
            tokio::select! {
                _ = queue.ready() => {}
                _ = tokio::time::sleep(Duration::from_millis(250)) => {}
            }
        }
    }
    let _ = sink.close().await;
}

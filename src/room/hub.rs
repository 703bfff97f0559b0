//! Room Hub
//!
//! The in-process broadcast point for a room's sessions. Only the room
//! coordinator calls into it, so frames published here reach every session's
//! egress queue in publish order (FIFO per publisher).

use std::collections::HashMap;
use std::time::Instant;
use uuid::Uuid;

use crate::metrics::PodMetrics;
use crate::protocol::Frame;
use crate::session::egress::{EgressQueue, PushOutcome};

/// One attached session as the hub sees it.
#[derive(Clone)]
pub struct Seat {
    /// Session id.
    pub session_id: Uuid,
    /// Authenticated user.
    pub user_id: String,
    /// The session's bounded egress queue.
    pub egress: EgressQueue,
}

/// Per-room broadcast state.
#[derive(Default)]
pub struct RoomHub {
    seats: HashMap<Uuid, Seat>,
}

impl RoomHub {
    /// Empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session.
    pub fn insert(&mut self, seat: Seat) {
        self.seats.insert(seat.session_id, seat);
    }

    /// Remove a session. Returns the seat if it was present.
    pub fn remove(&mut self, session_id: &Uuid) -> Option<Seat> {
        self.seats.remove(session_id)
    }

    /// Look up a seat.
    pub fn get(&self, session_id: &Uuid) -> Option<&Seat> {
        self.seats.get(session_id)
    }

    /// Number of attached sessions.
    pub fn len(&self) -> usize {
        self.seats.len()
    }

    /// Whether the room has no sessions.
    pub fn is_empty(&self) -> bool {
        self.seats.is_empty()
    }

    /// Whether any other session belongs to `user_id`.
    pub fn user_has_other_session(&self, user_id: &str, excluding: &Uuid) -> bool {
        self.seats
            .values()
            .any(|s| s.user_id == user_id && s.session_id != *excluding)
    }

    /// Enqueue a frame on every live session except `origin`. Presence
    /// frames pass the user id as `coalesce_key` so slow sessions keep only
    /// the latest diff per user.
    pub fn publish_local(
        &self,
        origin: Option<&Uuid>,
        frame: &Frame,
        coalesce_key: Option<&str>,
        metrics: &PodMetrics,
        now: Instant,
    ) {
        for seat in self.seats.values() {
            if Some(&seat.session_id) == origin {
                continue;
            }
            match seat
                .egress
                .push(frame.clone(), coalesce_key.map(str::to_string), now)
            {
                PushOutcome::Queued { shed } => {
                    if shed > 0 {
                        metrics.egress_drops.add("presence_shed", shed as u64);
                    }
                }
                PushOutcome::Coalesced { shed } => {
                    metrics.egress_drops.inc("presence_coalesce");
                    if shed > 0 {
                        metrics.egress_drops.add("presence_shed", shed as u64);
                    }
                }
                PushOutcome::RejectedFull => {
                    metrics.egress_drops.inc("storage_full");
                }
                PushOutcome::Closed => {}
            }
        }
    }

    /// Enqueue a frame on one session only (sync frames, error frames).
    pub fn send_to(&self, session_id: &Uuid, frame: Frame, now: Instant) -> bool {
        match self.seats.get(session_id) {
            Some(seat) => !matches!(
                seat.egress.push(frame, None, now),
                PushOutcome::RejectedFull | PushOutcome::Closed
            ),
            None => false,
        }
    }

    /// All seats, for drain broadcasts.
    pub fn seats(&self) -> impl Iterator<Item = &Seat> {
        self.seats.values()
    }
}

//! Egress Queue
//!
//! Each session's outbound queue is bounded by total bytes and by frame
//! count. Presence frames coalesce per user (latest wins) and are shed
//! first under pressure; a queue that stays full of storage frames past the
//! slow-client timeout marks the session a slow consumer.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use crate::protocol::Frame;

/// Result of offering a frame to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Frame enqueued.
    Queued {
        /// Older presence frames shed to make room.
        shed: usize,
    },
    /// Frame replaced a queued frame with the same coalesce key.
    Coalesced {
        /// Older presence frames shed when the replacement grew the queue.
        shed: usize,
    },
    /// Bounds left no room even after shedding presence; frame dropped.
    RejectedFull,
    /// Queue is no longer accepting input.
    Closed,
}

struct Inner {
    frames: VecDeque<(Frame, Option<String>)>,
    buffered_bytes: usize,
    full_since: Option<Instant>,
    input_closed: bool,
}

impl Inner {
    fn frame_cost(frame: &Frame) -> usize {
        1 + frame.payload.len()
    }

    fn over_bounds(&self, max_bytes: usize, max_frames: usize) -> bool {
        self.buffered_bytes > max_bytes || self.frames.len() > max_frames
    }

    fn shed_oldest_presence(&mut self) -> bool {
        if let Some(pos) = self.frames.iter().position(|(_, key)| key.is_some()) {
            let (frame, _) = self.frames.remove(pos).expect("position just found");
            self.buffered_bytes -= Self::frame_cost(&frame);
            true
        } else {
            false
        }
    }

    fn shed_until_fits(&mut self, max_bytes: usize, max_frames: usize) -> usize {
        let mut shed = 0;
        while self.over_bounds(max_bytes, max_frames) {
            if !self.shed_oldest_presence() {
                break;
            }
            shed += 1;
        }
        shed
    }
}

/// Handle to a session's bounded egress queue. Cloned by the room hub
/// (producer side) and the egress writer task (consumer side).
#[derive(Clone)]
pub struct EgressQueue {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
    max_bytes: usize,
    max_frames: usize,
}

impl EgressQueue {
    /// Queue bounded by `max_bytes` total and `max_frames` entries.
    pub fn new(max_bytes: usize, max_frames: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                frames: VecDeque::new(),
                buffered_bytes: 0,
                full_since: None,
                input_closed: false,
            })),
            notify: Arc::new(Notify::new()),
            max_bytes,
            max_frames,
        }
    }

    /// Offer a frame. `coalesce_key` is set for presence diffs (the user
    /// id): a queued frame with the same key is replaced in place, keeping
    /// its position, so per-user latest-wins holds under pressure.
    pub fn push(&self, frame: Frame, coalesce_key: Option<String>, now: Instant) -> PushOutcome {
        let mut inner = self.inner.lock();
        if inner.input_closed {
            return PushOutcome::Closed;
        }

        if let Some(key) = &coalesce_key {
            if let Some(pos) = inner
                .frames
                .iter()
                .position(|(_, k)| k.as_deref() == Some(key.as_str()))
            {
                let cost = Inner::frame_cost(&frame);
                let old_cost = Inner::frame_cost(&inner.frames[pos].0);
                inner.frames[pos].0 = frame;
                inner.buffered_bytes = inner.buffered_bytes - old_cost + cost;
                // A larger replacement can put the queue over its byte
                // bound; shed oldest presence the same way the append path
                // does. The grown frame is itself sheddable presence, so
                // this always lands back under the bound.
                let shed = inner.shed_until_fits(self.max_bytes, self.max_frames);
                drop(inner);
                self.notify.notify_one();
                return PushOutcome::Coalesced { shed };
            }
        }

        let cost = Inner::frame_cost(&frame);
        inner.frames.push_back((frame, coalesce_key));
        inner.buffered_bytes += cost;

        let shed = inner.shed_until_fits(self.max_bytes, self.max_frames);

        if inner.over_bounds(self.max_bytes, self.max_frames) {
            // Only storage and sync frames remain; take the new frame back
            // out to keep the bound an invariant, and start the slow clock.
            let (frame, _) = inner.frames.pop_back().expect("frame just pushed");
            inner.buffered_bytes -= Inner::frame_cost(&frame);
            if inner.full_since.is_none() {
                inner.full_since = Some(now);
            }
            return PushOutcome::RejectedFull;
        }

        drop(inner);
        self.notify.notify_one();
        PushOutcome::Queued { shed }
    }

    /// Take the next frame to write, if any.
    pub fn pop(&self, _now: Instant) -> Option<Frame> {
        let mut inner = self.inner.lock();
        let (frame, _) = inner.frames.pop_front()?;
        inner.buffered_bytes -= Inner::frame_cost(&frame);
        if !inner.over_bounds(self.max_bytes, self.max_frames) {
            inner.full_since = None;
        }
        Some(frame)
    }

    /// How long the queue has been rejecting storage frames, if it is.
    pub fn slow_for(&self, now: Instant) -> Option<Duration> {
        let inner = self.inner.lock();
        inner.full_since.map(|since| now.saturating_duration_since(since))
    }

    /// Stop accepting new frames; queued frames can still be drained.
    pub fn close_input(&self) {
        self.inner.lock().input_closed = true;
        self.notify.notify_one();
    }

    /// Whether input has been closed.
    pub fn input_closed(&self) -> bool {
        self.inner.lock().input_closed
    }

    /// Wait until a frame may be available.
    pub async fn ready(&self) {
        self.notify.notified().await;
    }

    /// Queued frame count.
    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().frames.is_empty()
    }

    /// Bytes currently buffered.
    pub fn buffered_bytes(&self) -> usize {
        self.inner.lock().buffered_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::FrameType;
    use crate::protocol::presence::{FieldBag, PresenceDiffWire};
    use bytes::Bytes;

    fn presence_frame(user: &str, x: f64) -> Frame {
        let mut bag = FieldBag::new();
        bag.insert("x".to_string(), rmpv::Value::F64(x));
        let wire = PresenceDiffWire::stamped(user, bag, 0);
        Frame::new(FrameType::PresenceDiff, Bytes::from(wire.encode().unwrap())).unwrap()
    }

    fn presence_padded(user: &str, pad: usize) -> Frame {
        let mut bag = FieldBag::new();
        bag.insert("pad".to_string(), rmpv::Value::from("p".repeat(pad)));
        let wire = PresenceDiffWire::stamped(user, bag, 0);
        Frame::new(FrameType::PresenceDiff, Bytes::from(wire.encode().unwrap())).unwrap()
    }

    fn storage_frame(len: usize) -> Frame {
        Frame::new(FrameType::StorageUpdate, Bytes::from(vec![0u8; len])).unwrap()
    }

    #[test]
    fn test_fifo_order_preserved() {
        let queue = EgressQueue::new(64 * 1024, 256);
        let now = Instant::now();
        queue.push(storage_frame(4), None, now);
        queue.push(storage_frame(8), None, now);

        assert_eq!(queue.pop(now).unwrap().payload.len(), 4);
        assert_eq!(queue.pop(now).unwrap().payload.len(), 8);
        assert!(queue.pop(now).is_none());
    }

    #[test]
    fn test_presence_coalesces_per_user() {
        let queue = EgressQueue::new(64 * 1024, 256);
        let now = Instant::now();
        assert!(matches!(
            queue.push(presence_frame("u1", 0.0), Some("u1".into()), now),
            PushOutcome::Queued { shed: 0 }
        ));

        let mut coalesced = 0;
        for i in 1..1000 {
            match queue.push(presence_frame("u1", i as f64), Some("u1".into()), now) {
                PushOutcome::Coalesced { shed: 0 } => coalesced += 1,
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!(coalesced, 999);
        assert_eq!(queue.len(), 1);

        // The surviving frame carries the final value.
        let frame = queue.pop(now).unwrap();
        let wire = PresenceDiffWire::decode(&frame.payload).unwrap();
        let x = wire.fields.unwrap().remove("x").unwrap();
        assert_eq!(x.as_f64(), Some(999.0));
    }

    #[test]
    fn test_distinct_users_do_not_coalesce() {
        let queue = EgressQueue::new(64 * 1024, 256);
        let now = Instant::now();
        queue.push(presence_frame("u1", 1.0), Some("u1".into()), now);
        queue.push(presence_frame("u2", 2.0), Some("u2".into()), now);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_bounds_hold_at_every_instant() {
        let max_bytes = 512;
        let max_frames = 8;
        let queue = EgressQueue::new(max_bytes, max_frames);
        let now = Instant::now();

        for i in 0..100 {
            queue.push(presence_frame(&format!("u{i}"), 0.0), Some(format!("u{i}")), now);
            queue.push(storage_frame(64), None, now);
            assert!(queue.buffered_bytes() <= max_bytes);
            assert!(queue.len() <= max_frames);
        }
    }

    #[test]
    fn test_presence_shed_before_storage() {
        let queue = EgressQueue::new(64 * 1024, 4);
        let now = Instant::now();
        queue.push(presence_frame("u1", 0.0), Some("u1".into()), now);
        queue.push(presence_frame("u2", 0.0), Some("u2".into()), now);
        queue.push(storage_frame(4), None, now);
        queue.push(storage_frame(4), None, now);

        // Queue is at capacity; new storage frame sheds the oldest presence.
        let outcome = queue.push(storage_frame(4), None, now);
        assert_eq!(outcome, PushOutcome::Queued { shed: 1 });

        // u1 was shed, u2 survives.
        let remaining: Vec<FrameType> = std::iter::from_fn(|| queue.pop(now))
            .map(|f| f.frame_type)
            .collect();
        assert_eq!(
            remaining,
            vec![
                FrameType::PresenceDiff,
                FrameType::StorageUpdate,
                FrameType::StorageUpdate,
                FrameType::StorageUpdate
            ]
        );
    }

    #[test]
    fn test_coalesce_growth_sheds_to_hold_bound() {
        let cost = |frame: &Frame| 1 + frame.payload.len();
        let small = presence_padded("u1", 10);
        let big = presence_padded("u1", 300);
        let storage = storage_frame(100);

        // Fits the small diff plus the storage frame, not the grown diff.
        let max_bytes = cost(&small) + cost(&storage) + 50;
        let queue = EgressQueue::new(max_bytes, 8);
        let now = Instant::now();
        queue.push(small, Some("u1".into()), now);
        queue.push(storage, None, now);

        // The replacement grows past the byte bound and, being the only
        // presence frame, sheds itself.
        let outcome = queue.push(big, Some("u1".into()), now);
        assert_eq!(outcome, PushOutcome::Coalesced { shed: 1 });
        assert!(queue.buffered_bytes() <= max_bytes);

        let remaining: Vec<FrameType> = std::iter::from_fn(|| queue.pop(now))
            .map(|f| f.frame_type)
            .collect();
        assert_eq!(remaining, vec![FrameType::StorageUpdate]);
    }

    #[test]
    fn test_coalesce_growth_sheds_older_presence_first() {
        let cost = |frame: &Frame| 1 + frame.payload.len();
        let other = presence_padded("u0", 200);
        let small = presence_padded("u1", 10);
        let big = presence_padded("u1", 120);
        let storage = storage_frame(100);

        // Fits the initial three frames, not the grown u1 diff on top.
        let max_bytes = cost(&other) + cost(&small) + cost(&storage) + 20;
        let queue = EgressQueue::new(max_bytes, 8);
        let now = Instant::now();
        queue.push(other, Some("u0".into()), now);
        queue.push(small, Some("u1".into()), now);
        queue.push(storage, None, now);

        // u0's frame is older, so it goes first and the grown u1 frame
        // survives with the latest fields.
        let outcome = queue.push(big, Some("u1".into()), now);
        assert_eq!(outcome, PushOutcome::Coalesced { shed: 1 });
        assert!(queue.buffered_bytes() <= max_bytes);

        let frames: Vec<Frame> = std::iter::from_fn(|| queue.pop(now)).collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].frame_type, FrameType::PresenceDiff);
        let wire = PresenceDiffWire::decode(&frames[0].payload).unwrap();
        assert_eq!(wire.user.as_deref(), Some("u1"));
        let pad = wire.fields.unwrap().remove("pad").unwrap();
        assert_eq!(pad.as_str().map(str::len), Some(120));
        assert_eq!(frames[1].frame_type, FrameType::StorageUpdate);
    }

    #[test]
    fn test_storage_only_full_queue_rejects_and_tracks_slowness() {
        let queue = EgressQueue::new(64 * 1024, 2);
        let start = Instant::now();
        queue.push(storage_frame(4), None, start);
        queue.push(storage_frame(4), None, start);

        assert_eq!(queue.push(storage_frame(4), None, start), PushOutcome::RejectedFull);
        let later = start + Duration::from_millis(1500);
        assert_eq!(queue.push(storage_frame(4), None, later), PushOutcome::RejectedFull);

        // The clock runs from the first rejection.
        assert!(queue.slow_for(later).unwrap() >= Duration::from_millis(1500));

        // Draining clears the slow clock.
        queue.pop(later);
        queue.push(storage_frame(4), None, later);
        assert!(queue.slow_for(later).is_none());
    }

    #[test]
    fn test_closed_input_rejects() {
        let queue = EgressQueue::new(64, 4);
        queue.close_input();
        assert_eq!(
            queue.push(storage_frame(1), None, Instant::now()),
            PushOutcome::Closed
        );
    }
}

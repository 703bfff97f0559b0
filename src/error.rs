//! # Error Taxonomy
//!
//! Crate-wide error kinds and the wire-level error codes surfaced to clients.
//!
//! Propagation policy: a session error never takes down a room, a room error
//! never takes down the pod, and a pod error never corrupts the op store.
//! Every error path increments a counter and emits a structured log line.

use std::time::Duration;
use thiserror::Error;

/// Error codes carried in `0x7E` error frames (`code:u16 | message:utf8`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    /// Session token failed signature or expiry re-check.
    Unauthorized = 1001,
    /// Frame could not be decoded.
    MalformedFrame = 1002,
    /// Too many malformed frames, or a client sent a server-only frame type.
    ProtocolViolation = 1003,
    /// Per-session frame budget exceeded in a sustained way.
    RateLimited = 1029,
    /// Egress queue stayed full beyond the slow-client timeout.
    SlowConsumer = 1008,
    /// Room session cap reached at attach time.
    RoomCapacityExceeded = 1010,
    /// Per-pod room cap reached at attach time.
    TooManyRooms = 1011,
    /// Storage refused while the op store is in backoff.
    TemporarilyReadOnly = 1030,
    /// Pod is draining for shutdown.
    Shutdown = 1000,
    /// Unexpected internal failure.
    Internal = 1500,
}

impl ErrorCode {
    /// Wire representation.
    pub fn as_u16(&self) -> u16 {
        *self as u16
    }

    /// Parse a wire code back into a known error code.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1001 => Some(Self::Unauthorized),
            1002 => Some(Self::MalformedFrame),
            1003 => Some(Self::ProtocolViolation),
            1029 => Some(Self::RateLimited),
            1008 => Some(Self::SlowConsumer),
            1010 => Some(Self::RoomCapacityExceeded),
            1011 => Some(Self::TooManyRooms),
            1030 => Some(Self::TemporarilyReadOnly),
            1000 => Some(Self::Shutdown),
            1500 => Some(Self::Internal),
            _ => None,
        }
    }
}

/// Errors that cross component boundaries inside the pod.
///
/// Session-local errors (malformed frames, rate limiting) live in the
/// session module; these are the kinds that rooms, the registry, and the
/// bridge hand back to their callers.
#[derive(Debug, Error)]
pub enum PodError {
    /// The replicated stream is unreachable or misbehaving.
    #[error("stream unavailable: {0}")]
    StreamUnavailable(String),

    /// The op store is unreachable or misbehaving.
    #[error("op store unavailable: {0}")]
    OpStoreUnavailable(String),

    /// Room session cap reached.
    #[error("room capacity exceeded: {0}")]
    RoomCapacityExceeded(String),

    /// Per-pod room cap reached.
    #[error("too many rooms (cap {0})")]
    TooManyRooms(usize),

    /// The pod is shutting down and refuses new work.
    #[error("shutting down")]
    Shutdown,

    /// A coordinator hit an unexpected internal state.
    #[error("internal error in room {room}: {message}")]
    Internal {
        /// Room the failure was observed in.
        room: String,
        /// What went wrong.
        message: String,
    },
}

impl PodError {
    /// The wire code a session should surface for this error.
    pub fn wire_code(&self) -> ErrorCode {
        match self {
            Self::StreamUnavailable(_) | Self::OpStoreUnavailable(_) => {
                ErrorCode::TemporarilyReadOnly
            }
            Self::RoomCapacityExceeded(_) => ErrorCode::RoomCapacityExceeded,
            Self::TooManyRooms(_) => ErrorCode::TooManyRooms,
            Self::Shutdown => ErrorCode::Shutdown,
            Self::Internal { .. } => ErrorCode::Internal,
        }
    }
}

/// Exponential backoff with jitter for dependency retries.
///
/// Base 100 ms, factor 2, cap 5 s, jitter +/-25%.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    /// Backoff with the default dependency-retry schedule.
    pub fn new() -> Self {
        Self {
            base: Duration::from_millis(100),
            cap: Duration::from_secs(5),
            attempt: 0,
        }
    }

    /// Delay before the next retry, advancing the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.base.as_millis() as f64 * 2f64.powi(self.attempt.min(16) as i32);
        let capped = exp.min(self.cap.as_millis() as f64);
        let jitter = 1.0 + (rand::random::<f64>() - 0.5) * 0.5;
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis((capped * jitter) as u64)
    }

    /// Reset after a successful call.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// How many consecutive failures have been seen.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_round_trip() {
        for code in [
            ErrorCode::Unauthorized,
            ErrorCode::MalformedFrame,
            ErrorCode::ProtocolViolation,
            ErrorCode::RateLimited,
            ErrorCode::SlowConsumer,
            ErrorCode::RoomCapacityExceeded,
            ErrorCode::TooManyRooms,
            ErrorCode::TemporarilyReadOnly,
            ErrorCode::Shutdown,
            ErrorCode::Internal,
        ] {
            assert_eq!(ErrorCode::from_u16(code.as_u16()), Some(code));
        }
        assert_eq!(ErrorCode::from_u16(9999), None);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff = Backoff::new();
        let first = backoff.next_delay();
        // 100ms +/- 25%
        assert!(first >= Duration::from_millis(75) && first <= Duration::from_millis(125));

        for _ in 0..10 {
            backoff.next_delay();
        }
        let late = backoff.next_delay();
        // capped at 5s +25%
        assert!(late <= Duration::from_millis(6250));
        assert!(late >= Duration::from_millis(3750));
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::new();
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempts(), 2);
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
    }

    #[test]
    fn test_pod_error_wire_codes() {
        assert_eq!(
            PodError::TooManyRooms(100).wire_code(),
            ErrorCode::TooManyRooms
        );
        assert_eq!(
            PodError::OpStoreUnavailable("down".into()).wire_code(),
            ErrorCode::TemporarilyReadOnly
        );
        assert_eq!(PodError::Shutdown.wire_code(), ErrorCode::Shutdown);
    }
}

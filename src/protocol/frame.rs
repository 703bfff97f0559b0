//! Frame Codec
//!
//! One frame = `type:u8 | payload:bytes`. The payload is length-delimited by
//! the underlying transport; this codec only splits the tag from the payload
//! and enforces per-type payload bounds. Malformed frames never kill a
//! session on their own; the session counts them against a budget.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::error::ErrorCode;

/// Room ids are opaque UTF-8, at most this many bytes.
pub const MAX_ROOM_ID_BYTES: usize = 256;

/// Presence payloads: typed record plus a field bag capped at 2 KiB encoded.
pub const MAX_PRESENCE_PAYLOAD: usize = 4 * 1024;

/// Storage payloads are opaque CRDT updates.
pub const MAX_STORAGE_PAYLOAD: usize = 512 * 1024;

/// Sync payloads carry full snapshots, which can be large.
pub const MAX_SYNC_PAYLOAD: usize = 8 * 1024 * 1024;

/// Control payloads are a subtype byte plus a small argument.
pub const MAX_CONTROL_PAYLOAD: usize = 64;

/// Error payloads: `code:u16 | message:utf8`.
pub const MAX_ERROR_PAYLOAD: usize = 1024;

/// Frame codec failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameCodecError {
    /// Zero-length frame (no type tag).
    #[error("empty frame")]
    Empty,

    /// Type tag is not one of the recognized values.
    #[error("unknown frame type: {0:#04x}")]
    UnknownType(u8),

    /// Payload exceeds the bound for its type.
    #[error("payload too large: {len} bytes (max {max})")]
    PayloadTooLarge {
        /// Observed payload length.
        len: usize,
        /// Bound for this frame type.
        max: usize,
    },

    /// Control payload is empty or carries an unknown subtype.
    #[error("invalid control payload")]
    InvalidControl,

    /// Error payload is shorter than the 2-byte code or not UTF-8.
    #[error("invalid error payload")]
    InvalidError,
}

/// Frame type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Partial presence overwrite for one user.
    PresenceDiff = 0x01,
    /// Opaque CRDT update bytes.
    StorageUpdate = 0x02,
    /// Full presence snapshot (server to client only).
    PresenceSync = 0x20,
    /// Full CRDT snapshot (server to client only).
    StorageSync = 0x21,
    /// `code:u16 | message:utf8`.
    Error = 0x7E,
    /// `subtype:u8 | ...`.
    Control = 0x7F,
}

impl FrameType {
    /// Parse a type tag.
    pub fn from_u8(value: u8) -> Result<Self, FrameCodecError> {
        match value {
            0x01 => Ok(Self::PresenceDiff),
            0x02 => Ok(Self::StorageUpdate),
            0x20 => Ok(Self::PresenceSync),
            0x21 => Ok(Self::StorageSync),
            0x7E => Ok(Self::Error),
            0x7F => Ok(Self::Control),
            other => Err(FrameCodecError::UnknownType(other)),
        }
    }

    /// Wire tag for this type.
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Metrics label for this type.
    pub fn label(&self) -> &'static str {
        match self {
            Self::PresenceDiff => "presence_diff",
            Self::StorageUpdate => "storage_update",
            Self::PresenceSync => "presence_sync",
            Self::StorageSync => "storage_sync",
            Self::Error => "error",
            Self::Control => "control",
        }
    }

    /// Maximum payload length accepted for this type.
    pub fn max_payload(&self) -> usize {
        match self {
            Self::PresenceDiff => MAX_PRESENCE_PAYLOAD,
            Self::StorageUpdate => MAX_STORAGE_PAYLOAD,
            Self::PresenceSync | Self::StorageSync => MAX_SYNC_PAYLOAD,
            Self::Error => MAX_ERROR_PAYLOAD,
            Self::Control => MAX_CONTROL_PAYLOAD,
        }
    }
}

/// Control frame subtypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlKind {
    /// Liveness probe, pod to client.
    Ping = 0x01,
    /// Liveness answer, client to pod.
    Pong = 0x02,
    /// Pod is draining; the client should reconnect elsewhere.
    Drain = 0x03,
    /// Client requests a fresh presence + storage sync.
    Resync = 0x04,
}

impl ControlKind {
    /// Parse a control subtype byte.
    pub fn from_u8(value: u8) -> Result<Self, FrameCodecError> {
        match value {
            0x01 => Ok(Self::Ping),
            0x02 => Ok(Self::Pong),
            0x03 => Ok(Self::Drain),
            0x04 => Ok(Self::Resync),
            _ => Err(FrameCodecError::InvalidControl),
        }
    }
}

/// A decoded frame: type tag plus opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type.
    pub frame_type: FrameType,
    /// Payload bytes, untouched by the codec.
    pub payload: Bytes,
}

impl Frame {
    /// Build a frame, asserting the payload bound for its type.
    pub fn new(frame_type: FrameType, payload: Bytes) -> Result<Self, FrameCodecError> {
        if payload.len() > frame_type.max_payload() {
            return Err(FrameCodecError::PayloadTooLarge {
                len: payload.len(),
                max: frame_type.max_payload(),
            });
        }
        Ok(Self {
            frame_type,
            payload,
        })
    }

    /// Decode one transport message into a frame.
    pub fn decode(raw: &[u8]) -> Result<Self, FrameCodecError> {
        let (&tag, payload) = raw.split_first().ok_or(FrameCodecError::Empty)?;
        let frame_type = FrameType::from_u8(tag)?;
        Self::new(frame_type, Bytes::copy_from_slice(payload))
    }

    /// Encode into one transport message.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + self.payload.len());
        buf.put_u8(self.frame_type.as_u8());
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// An error frame: `code:u16 | message:utf8`.
    pub fn error(code: ErrorCode, message: &str) -> Self {
        let mut buf = BytesMut::with_capacity(2 + message.len());
        buf.put_u16(code.as_u16());
        let budget = MAX_ERROR_PAYLOAD - 2;
        if message.len() > budget {
            let mut end = budget;
            while !message.is_char_boundary(end) {
                end -= 1;
            }
            buf.extend_from_slice(message[..end].as_bytes());
        } else {
            buf.extend_from_slice(message.as_bytes());
        }
        Self {
            frame_type: FrameType::Error,
            payload: buf.freeze(),
        }
    }

    /// A bare control frame.
    pub fn control(kind: ControlKind) -> Self {
        Self {
            frame_type: FrameType::Control,
            payload: Bytes::copy_from_slice(&[kind as u8]),
        }
    }

    /// Parse the subtype of a control frame payload.
    pub fn control_kind(&self) -> Result<ControlKind, FrameCodecError> {
        let first = self
            .payload
            .first()
            .copied()
            .ok_or(FrameCodecError::InvalidControl)?;
        ControlKind::from_u8(first)
    }

    /// Parse an error frame payload into `(code, message)`.
    pub fn error_parts(&self) -> Result<(u16, String), FrameCodecError> {
        if self.payload.len() < 2 {
            return Err(FrameCodecError::InvalidError);
        }
        let code = u16::from_be_bytes([self.payload[0], self.payload[1]]);
        let message = std::str::from_utf8(&self.payload[2..])
            .map_err(|_| FrameCodecError::InvalidError)?
            .to_string();
        Ok((code, message))
    }
}

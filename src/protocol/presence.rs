//! Presence Payloads
//!
//! Typed MessagePack records carried in `0x01` and `0x20` frames. The record
//! shape is fixed; the user-defined field bag inside it stays free-form
//! (`rmpv::Value`) and is capped at 2 KiB encoded.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Cap on the encoded user field bag.
pub const MAX_FIELD_BAG_BYTES: usize = 2 * 1024;

/// Presence payload codec failures.
#[derive(Debug, Error)]
pub enum PresenceCodecError {
    /// Payload is not a valid MessagePack encoding of the typed record.
    #[error("undecodable presence payload: {0}")]
    Decode(String),

    /// Record could not be encoded (should not happen for well-formed maps).
    #[error("unencodable presence payload: {0}")]
    Encode(String),

    /// Field bag exceeds [`MAX_FIELD_BAG_BYTES`] encoded.
    #[error("field bag too large: {0} bytes")]
    BagTooLarge(usize),
}

/// User-defined presence fields: free-form keys to MessagePack values.
pub type FieldBag = BTreeMap<String, rmpv::Value>;

/// One presence diff on the wire.
///
/// Clients send `{f}` only; the pod fills `u` and `t` when rebroadcasting.
/// `f = null` is a tombstone (the user left or expired).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceDiffWire {
    /// User the diff applies to. Ignored on ingress; the session identity wins.
    #[serde(rename = "u", default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Field overwrites, or `None` for removal.
    #[serde(rename = "f")]
    pub fields: Option<FieldBag>,

    /// Server stamp in epoch milliseconds; peers use it for dedupe.
    #[serde(rename = "t", default, skip_serializing_if = "Option::is_none")]
    pub source_ts: Option<i64>,
}

impl PresenceDiffWire {
    /// A diff as sent by a client: bare field overwrites.
    pub fn from_client(fields: FieldBag) -> Self {
        Self {
            user: None,
            fields: Some(fields),
            source_ts: None,
        }
    }

    /// A stamped diff as rebroadcast by the pod.
    pub fn stamped(user: &str, fields: FieldBag, source_ts: i64) -> Self {
        Self {
            user: Some(user.to_string()),
            fields: Some(fields),
            source_ts: Some(source_ts),
        }
    }

    /// A stamped tombstone for a removed user.
    pub fn tombstone(user: &str, source_ts: i64) -> Self {
        Self {
            user: Some(user.to_string()),
            fields: None,
            source_ts: Some(source_ts),
        }
    }

    /// Encode to MessagePack.
    pub fn encode(&self) -> Result<Vec<u8>, PresenceCodecError> {
        rmp_serde::to_vec_named(self).map_err(|e| PresenceCodecError::Encode(e.to_string()))
    }

    /// Decode from MessagePack.
    pub fn decode(raw: &[u8]) -> Result<Self, PresenceCodecError> {
        rmp_serde::from_slice(raw).map_err(|e| PresenceCodecError::Decode(e.to_string()))
    }
}

/// One entry in a presence snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntryWire {
    /// User id.
    #[serde(rename = "u")]
    pub user: String,

    /// Current field bag.
    #[serde(rename = "f")]
    pub fields: FieldBag,

    /// Server-stamped last activity, epoch milliseconds.
    #[serde(rename = "a")]
    pub last_active: i64,
}

/// Full presence snapshot carried in `0x20` frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceSyncWire {
    /// All live entries in the room.
    #[serde(rename = "e")]
    pub entries: Vec<PresenceEntryWire>,
}

impl PresenceSyncWire {
    /// Encode to MessagePack.
    pub fn encode(&self) -> Result<Vec<u8>, PresenceCodecError> {
        rmp_serde::to_vec_named(self).map_err(|e| PresenceCodecError::Encode(e.to_string()))
    }

    /// Decode from MessagePack.
    pub fn decode(raw: &[u8]) -> Result<Self, PresenceCodecError> {
        rmp_serde::from_slice(raw).map_err(|e| PresenceCodecError::Decode(e.to_string()))
    }
}

/// Check a field bag against the encoded-size cap.
pub fn check_bag_size(fields: &FieldBag) -> Result<(), PresenceCodecError> {
    let encoded = rmp_serde::to_vec_named(fields)
        .map_err(|e| PresenceCodecError::Encode(e.to_string()))?;
    if encoded.len() > MAX_FIELD_BAG_BYTES {
        return Err(PresenceCodecError::BagTooLarge(encoded.len()));
    }
    Ok(())
}

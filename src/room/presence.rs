//! Presence Table
//!
//! Per-room user -> entry map with shallow field-level merge, server-stamped
//! activity, TTL expiry, and timestamp-based dedupe for entries arriving
//! from peer pods.

use thiserror::Error;

use crate::protocol::presence::{
    check_bag_size, FieldBag, PresenceCodecError, PresenceEntryWire,
};

/// Presence table failures.
#[derive(Debug, Error)]
pub enum PresenceError {
    /// The merged field bag would exceed the encoded cap, or could not be
    /// re-encoded for the size check.
    #[error(transparent)]
    Codec(#[from] PresenceCodecError),
}

/// One user's presence in a room.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEntry {
    /// User id.
    pub user_id: String,
    /// User-defined field bag.
    pub fields: FieldBag,
    /// Server-stamped last activity, epoch milliseconds. Never taken from
    /// the client; peers compare against it for dedupe.
    pub last_active: i64,
}

impl PresenceEntry {
    fn to_wire(&self) -> PresenceEntryWire {
        PresenceEntryWire {
            user: self.user_id.clone(),
            fields: self.fields.clone(),
            last_active: self.last_active,
        }
    }
}

/// Outcome of applying a peer diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerApply {
    /// Entry was newer than local state and was applied.
    Applied,
    /// Entry was stale (`source_ts < stored last_active`) and was dropped.
    Stale,
}

/// Per-room presence state. Mutated only by the room coordinator.
#[derive(Debug, Default)]
pub struct PresenceTable {
    entries: std::collections::HashMap<String, PresenceEntry>,
}

impl PresenceTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a local diff: shallow overwrite of the named fields, unknown
    /// fields preserved, `last_active` stamped with `now_ms`. Returns the
    /// effective entry. A rejected diff leaves the table untouched, so a
    /// first-time user whose diff fails the size check gets no entry.
    pub fn apply_diff(
        &mut self,
        user_id: &str,
        diff: &FieldBag,
        now_ms: i64,
    ) -> Result<&PresenceEntry, PresenceError> {
        let mut merged = self
            .entries
            .get(user_id)
            .map(|e| e.fields.clone())
            .unwrap_or_default();
        for (key, value) in diff {
            merged.insert(key.clone(), value.clone());
        }
        check_bag_size(&merged)?;

        let entry = self
            .entries
            .entry(user_id.to_string())
            .or_insert_with(|| PresenceEntry {
                user_id: user_id.to_string(),
                fields: FieldBag::new(),
                last_active: now_ms,
            });
        entry.fields = merged;
        entry.last_active = now_ms;
        Ok(entry)
    }

    /// Apply a diff consumed from a peer pod. The stored `last_active` wins
    /// over older peer entries; `fields = None` is a removal.
    pub fn apply_peer_diff(
        &mut self,
        user_id: &str,
        fields: Option<&FieldBag>,
        source_ts: i64,
    ) -> PeerApply {
        if let Some(existing) = self.entries.get(user_id) {
            if source_ts < existing.last_active {
                return PeerApply::Stale;
            }
        }

        match fields {
            Some(diff) => {
                let entry = self
                    .entries
                    .entry(user_id.to_string())
                    .or_insert_with(|| PresenceEntry {
                        user_id: user_id.to_string(),
                        fields: FieldBag::new(),
                        last_active: source_ts,
                    });
                for (key, value) in diff {
                    entry.fields.insert(key.clone(), value.clone());
                }
                entry.last_active = source_ts;
            }
            None => {
                self.entries.remove(user_id);
            }
        }
        PeerApply::Applied
    }

    /// Remove a user. Returns `true` if an entry existed, so the caller
    /// emits the tombstone exactly once per transition.
    pub fn remove(&mut self, user_id: &str) -> bool {
        self.entries.remove(user_id).is_some()
    }

    /// Wire-ready snapshot of all entries.
    pub fn snapshot(&self) -> Vec<PresenceEntryWire> {
        let mut entries: Vec<PresenceEntryWire> =
            self.entries.values().map(PresenceEntry::to_wire).collect();
        entries.sort_by(|a, b| a.user.cmp(&b.user));
        entries
    }

    /// Drop entries idle past `ttl_ms`. Returns the removed user ids with
    /// the expiry horizon stamp to put on their tombstones: a replica that
    /// saw newer activity keeps the entry.
    pub fn expire_stale(&mut self, now_ms: i64, ttl_ms: i64) -> Vec<(String, i64)> {
        let expired: Vec<(String, i64)> = self
            .entries
            .values()
            .filter(|e| now_ms - e.last_active >= ttl_ms)
            .map(|e| (e.user_id.clone(), e.last_active + ttl_ms))
            .collect();
        for (user_id, _) in &expired {
            self.entries.remove(user_id);
        }
        expired
    }

    /// Whether a user currently has an entry.
    pub fn contains(&self, user_id: &str) -> bool {
        self.entries.contains_key(user_id)
    }

    /// Stored last activity for a user, if present.
    pub fn last_active(&self, user_id: &str) -> Option<i64> {
        self.entries.get(user_id).map(|e| e.last_active)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

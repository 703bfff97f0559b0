//! # Rooms
//!
//! The unit of collaboration. Each room's mutable state (presence table,
//! CRDT document, session set) is owned by a single coordinator task; the
//! registry serializes room creation and destruction pod-wide.
//!
//! - `registry`: room id -> room map, lazy create, idle eviction
//! - `coordinator`: the per-room actor and its inbox
//! - `hub`: fan-out to local sessions
//! - `presence`: the per-room presence table
//! - `document`: the opaque CRDT document and its kernel

pub mod coordinator;
pub mod document;
pub mod hub;
pub mod presence;
pub mod registry;

pub use coordinator::{PresenceMsg, RoomHandle, StorageMsg};
pub use hub::Seat;
pub use registry::{spawn_registry, RegistryHandle};

//! # PODSYNC - Multi-tenant Presence + CRDT Sync Pod
//!
//! A real-time collaboration pod. Clients hold long-lived binary sessions
//! through an edge relay; inside a room they exchange presence diffs
//! (short, lossy, high-frequency) and storage updates (opaque CRDT bytes
//! that must converge). Peer pods serving the same room exchange the same
//! updates through a replicated per-room stream, and every CRDT op is
//! durably appended to the op store before it is applied or broadcast.
//!
//! ## Architecture
//!
//! - `protocol`: binary framing and typed presence payloads
//! - `auth`: HMAC re-check of edge-issued session tokens
//! - `room`: registry, per-room coordinator actor, hub, presence, document
//! - `session`: connection state machine, ingress pipeline, bounded egress
//! - `stream`: the replicated per-room log and the pod's bridge to it
//! - `store`: durable append-only op history
//! - `server`: WebSocket endpoint, health, metrics
//! - `metrics`: the pod's counter and gauge set

#![warn(missing_docs)]
#![warn(clippy::all)]

// Session token verification
pub mod auth;

// Environment configuration
pub mod config;

// Error taxonomy and retry backoff
pub mod error;

// Counters and exposition
pub mod metrics;

// Wire protocol
pub mod protocol;

// Rooms: registry, coordinator, hub, presence, document
pub mod room;

// HTTP and WebSocket surface
pub mod server;

// Client sessions
pub mod session;

// Durable op store
pub mod store;

// Replicated per-room stream
pub mod stream;

// Re-export commonly used types
pub use config::PodConfig;
pub use error::{ErrorCode, PodError};
pub use metrics::PodMetrics;
pub use protocol::{Frame, FrameType};
pub use room::{RegistryHandle, RoomHandle};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name.
pub const NAME: &str = env!("CARGO_PKG_NAME");

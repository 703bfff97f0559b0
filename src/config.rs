//! # Configuration
//!
//! All knobs come from the environment. Missing required variables and
//! unparseable numeric values are config errors, surfaced as exit code 64.

use std::env;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Configuration failures. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required variable is absent.
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    /// A variable is present but unparseable.
    #[error("invalid value for {name}: {value:?}")]
    Invalid {
        /// Variable name.
        name: &'static str,
        /// Offending value.
        value: String,
    },
}

/// Pod configuration.
#[derive(Debug, Clone)]
pub struct PodConfig {
    /// Stable pod identifier used for stream origin tagging.
    pub pod_id: String,
    /// Transport bind address.
    pub listen_addr: SocketAddr,
    /// Shared secret for session token signature re-checks.
    pub edge_token_secret: String,
    /// Replicated stream endpoint (redis URL).
    pub stream_url: String,
    /// Op store endpoint (postgres URL).
    pub op_store_url: String,
    /// Grace before an empty room is destroyed.
    pub idle_room_grace: Duration,
    /// Presence entry TTL without diffs.
    pub presence_ttl: Duration,
    /// Egress queue byte bound per session.
    pub egress_bytes: usize,
    /// Egress queue frame bound per session.
    pub egress_frames: usize,
    /// How long a storage-full egress queue is tolerated.
    pub slow_client_timeout: Duration,
    /// How long draining sessions get to flush on shutdown.
    pub drain_timeout: Duration,
    /// Stream history cap in entries.
    pub stream_max_entries: usize,
    /// Stream history cap in age.
    pub stream_max_age: Duration,
    /// Per-pod room cap.
    pub max_rooms: usize,
    /// Per-room session cap.
    pub max_sessions_per_room: usize,
    /// Stream lag (entries) above which the pod reports unhealthy.
    pub stream_lag_threshold: u64,
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn numeric<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
            name,
            value: raw.clone(),
        }),
        Err(_) => Ok(default),
    }
}

impl PodConfig {
    /// Load configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let listen_raw = env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8787".to_string());
        let listen_addr: SocketAddr = listen_raw.parse().map_err(|_| ConfigError::Invalid {
            name: "LISTEN_ADDR",
            value: listen_raw,
        })?;

        Ok(Self {
            pod_id: env::var("POD_ID")
                .unwrap_or_else(|_| format!("pod-{}", &Uuid::new_v4().simple().to_string()[..8])),
            listen_addr,
            edge_token_secret: required("EDGE_TOKEN_SECRET")?,
            stream_url: required("STREAM_URL")?,
            op_store_url: required("OP_STORE_URL")?,
            idle_room_grace: Duration::from_secs(numeric("IDLE_ROOM_GRACE_S", 60u64)?),
            presence_ttl: Duration::from_secs(numeric("PRESENCE_TTL_S", 120u64)?),
            egress_bytes: numeric("EGRESS_BYTES", 64 * 1024usize)?,
            egress_frames: numeric("EGRESS_FRAMES", 256usize)?,
            slow_client_timeout: Duration::from_millis(numeric("SLOW_CLIENT_TIMEOUT_MS", 1000u64)?),
            drain_timeout: Duration::from_secs(numeric("DRAIN_TIMEOUT_S", 10u64)?),
            stream_max_entries: numeric("STREAM_MAX_ENTRIES", 1000usize)?,
            stream_max_age: Duration::from_secs(numeric("STREAM_MAX_AGE_S", 60u64)?),
            max_rooms: numeric("MAX_ROOMS", 10_000usize)?,
            max_sessions_per_room: numeric("MAX_SESSIONS_PER_ROOM", 2_000usize)?,
            stream_lag_threshold: numeric("STREAM_LAG_THRESHOLD", 500u64)?,
        })
    }

    /// A small config for in-process tests: tight bounds, fast timers.
    pub fn for_tests() -> Self {
        Self {
            pod_id: "pod-test".to_string(),
            listen_addr: "127.0.0.1:0".parse().expect("test addr"),
            edge_token_secret: "test-secret".to_string(),
            stream_url: "redis://localhost/".to_string(),
            op_store_url: "postgres://localhost/podsync".to_string(),
            idle_room_grace: Duration::from_millis(200),
            presence_ttl: Duration::from_secs(120),
            egress_bytes: 64 * 1024,
            egress_frames: 256,
            slow_client_timeout: Duration::from_millis(100),
            drain_timeout: Duration::from_secs(2),
            stream_max_entries: 1000,
            stream_max_age: Duration::from_secs(60),
            max_rooms: 64,
            max_sessions_per_room: 32,
            stream_lag_threshold: 500,
        }
    }
}

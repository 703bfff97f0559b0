//! PODSYNC - collaboration pod entry point.
//!
//! Exit codes: 0 clean shutdown, 64 config error, 69 upstream dependency
//! unreachable at startup, 70 unrecoverable internal error.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use podsync::auth::TokenVerifier;
use podsync::config::PodConfig;
use podsync::metrics::PodMetrics;
use podsync::room::spawn_registry;
use podsync::server::{serve, AppState};
use podsync::store::{OpStore, PgOpStore};
use podsync::stream::{RedisStreamLog, StreamLog};

const EX_OK: i32 = 0;
const EX_CONFIG: i32 = 64;
const EX_UNAVAILABLE: i32 = 69;
const EX_SOFTWARE: i32 = 70;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    std::process::exit(run().await);
}

async fn run() -> i32 {
    info!(version = podsync::VERSION, "podsync starting");

    let cfg = match PodConfig::from_env() {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            error!(error = %e, "configuration error");
            return EX_CONFIG;
        }
    };

    let op_store: Arc<dyn OpStore> = match PgOpStore::connect(&cfg.op_store_url).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, "op store unreachable");
            return EX_UNAVAILABLE;
        }
    };

    let stream_log: Arc<dyn StreamLog> = match RedisStreamLog::connect(&cfg.stream_url).await {
        Ok(log) => Arc::new(log),
        Err(e) => {
            error!(error = %e, "stream backend unreachable");
            return EX_UNAVAILABLE;
        }
    };
    if let Err(e) = stream_log.ping().await {
        error!(error = %e, "stream backend not answering");
        return EX_UNAVAILABLE;
    }

    let metrics = Arc::new(PodMetrics::new());
    let registry = spawn_registry(
        cfg.clone(),
        metrics.clone(),
        op_store.clone(),
        stream_log.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = Arc::new(AppState {
        verifier: TokenVerifier::new(&cfg.edge_token_secret),
        cfg,
        metrics,
        registry,
        op_store,
        stream_log,
        shutdown: shutdown_rx,
    });

    match serve(state, shutdown_tx).await {
        Ok(()) => {
            info!("podsync shutdown complete");
            EX_OK
        }
        Err(e) => {
            error!(error = %e, "server failed");
            EX_SOFTWARE
        }
    }
}

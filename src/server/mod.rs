//! # Server Surface
//!
//! The pod's HTTP face: the WebSocket session endpoint, the health probe,
//! and the metrics exposition. Shutdown stops accepting sessions, drains
//! every room, and gives egress queues the drain timeout to flush.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::auth::TokenVerifier;
use crate::config::PodConfig;
use crate::metrics::PodMetrics;
use crate::protocol::frame::MAX_ROOM_ID_BYTES;
use crate::room::registry::RegistryHandle;
use crate::session::{self, SessionContext};
use crate::store::OpStore;
use crate::stream::StreamLog;

/// Deadline for each health sub-probe.
const HEALTH_PROBE_DEADLINE: Duration = Duration::from_millis(500);

/// Shared server state.
pub struct AppState {
    /// Pod configuration.
    pub cfg: Arc<PodConfig>,
    /// Pod metrics.
    pub metrics: Arc<PodMetrics>,
    /// Room registry.
    pub registry: RegistryHandle,
    /// Session token verifier.
    pub verifier: TokenVerifier,
    /// Op store, probed by the health check.
    pub op_store: Arc<dyn OpStore>,
    /// Stream backend, probed by the health check.
    pub stream_log: Arc<dyn StreamLog>,
    /// Drain flag observed by every session.
    pub shutdown: watch::Receiver<bool>,
}

#[derive(Deserialize)]
struct WsParams {
    token: String,
}

/// Build the pod's router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/rooms/:room_id/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

async fn ws_handler(
    Path(room_id): Path<String>,
    Query(params): Query<WsParams>,
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Response {
    if room_id.is_empty() || room_id.len() > MAX_ROOM_ID_BYTES {
        return (StatusCode::BAD_REQUEST, "invalid room id").into_response();
    }
    if *state.shutdown.borrow() {
        return (StatusCode::SERVICE_UNAVAILABLE, "pod is draining").into_response();
    }

    let ctx = SessionContext {
        cfg: state.cfg.clone(),
        metrics: state.metrics.clone(),
        registry: state.registry.clone(),
        verifier: state.verifier.clone(),
        shutdown: state.shutdown.clone(),
    };
    ws.on_upgrade(move |socket| session::run(socket, room_id, params.token, ctx))
}

/// Healthy = registry responsive, op store reachable, and every room's
/// stream lag under the threshold.
async fn health(State(state): State<Arc<AppState>>) -> StatusCode {
    let registry_ok = state
        .registry
        .room_count(HEALTH_PROBE_DEADLINE)
        .await
        .is_some();
    let store_ok = tokio::time::timeout(HEALTH_PROBE_DEADLINE, state.op_store.ping())
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false);
    let stream_ok = tokio::time::timeout(HEALTH_PROBE_DEADLINE, state.stream_log.ping())
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false);
    let lag_ok =
        state.metrics.stream_lag_entries.max() < state.cfg.stream_lag_threshold as i64;

    if registry_ok && store_ok && stream_ok && lag_ok {
        StatusCode::OK
    } else {
        warn!(registry_ok, store_ok, stream_ok, lag_ok, "health probe failing");
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn metrics_text(State(state): State<Arc<AppState>>) -> String {
    state.metrics.render()
}

/// Serve until a shutdown signal, then drain.
pub async fn serve(
    state: Arc<AppState>,
    shutdown_tx: watch::Sender<bool>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(state.cfg.listen_addr).await?;
    info!(addr = %state.cfg.listen_addr, pod = %state.cfg.pod_id, "pod listening");

    let registry = state.registry.clone();
    let router = build_router(state);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("shutdown signal received, draining sessions");
            let _ = shutdown_tx.send(true);
            registry.drain_all().await;
        })
        .await?;

    info!("pod drained and stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::spawn_registry;
    use crate::store::MemoryOpStore;
    use crate::stream::MemoryStreamLog;

    fn test_state() -> (Arc<AppState>, watch::Sender<bool>) {
        let cfg = Arc::new(PodConfig::for_tests());
        let metrics = Arc::new(PodMetrics::new());
        let op_store: Arc<dyn OpStore> = Arc::new(MemoryOpStore::new());
        let stream_log: Arc<dyn StreamLog> = Arc::new(MemoryStreamLog::new());
        let registry = spawn_registry(
            cfg.clone(),
            metrics.clone(),
            op_store.clone(),
            stream_log.clone(),
        );
        let (tx, rx) = watch::channel(false);
        let state = Arc::new(AppState {
            verifier: TokenVerifier::new(&cfg.edge_token_secret),
            cfg,
            metrics,
            registry,
            op_store,
            stream_log,
            shutdown: rx,
        });
        (state, tx)
    }

    #[tokio::test]
    async fn test_health_ok_with_reachable_backends() {
        let (state, _tx) = test_state();
        assert_eq!(health(State(state)).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_fails_when_store_down() {
        let cfg = Arc::new(PodConfig::for_tests());
        let metrics = Arc::new(PodMetrics::new());
        let store = Arc::new(MemoryOpStore::new());
        store.set_available(false);
        let op_store: Arc<dyn OpStore> = store;
        let stream_log: Arc<dyn StreamLog> = Arc::new(MemoryStreamLog::new());
        let registry = spawn_registry(
            cfg.clone(),
            metrics.clone(),
            op_store.clone(),
            stream_log.clone(),
        );
        let (_tx, rx) = watch::channel(false);
        let state = Arc::new(AppState {
            verifier: TokenVerifier::new(&cfg.edge_token_secret),
            cfg,
            metrics,
            registry,
            op_store,
            stream_log,
            shutdown: rx,
        });
        assert_eq!(
            health(State(state)).await,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn test_health_fails_on_stream_lag() {
        let (state, _tx) = test_state();
        state
            .metrics
            .stream_lag_entries
            .set("r1", state.cfg.stream_lag_threshold as i64 + 1);
        assert_eq!(
            health(State(state)).await,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn test_metrics_endpoint_renders() {
        let (state, _tx) = test_state();
        state.metrics.frames_in.inc("control");
        let text = metrics_text(State(state)).await;
        assert!(text.contains("frames_in{type=\"control\"} 1"));
    }
}

//! HTTP liveness and readiness endpoints.
//!
//! `/livez` fails only when the prober itself has stopped reporting (the
//! process is wedged). `/healthz` and `/readyz` follow the serving state, so
//! an unreachable backend takes the pod out of rotation without restarting it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::handler::KmsHandler;
use crate::lifecycle::{Lifecycle, ServingState};

#[derive(Clone)]
pub struct HealthState {
    pub lifecycle: Arc<Lifecycle>,
    pub handler: Arc<KmsHandler>,
    /// Prober silence after which `/livez` fails.
    pub stale_after: Duration,
}

#[derive(Debug, Serialize)]
pub struct HealthBody {
    pub state: ServingState,
    pub healthy: bool,
    pub key_id: String,
    pub key_version: u64,
    pub message: String,
}

pub fn build_router(state: HealthState) -> Router {
    Router::new()
        .route("/livez", get(livez))
        .route("/healthz", get(readiness))
        .route("/readyz", get(readiness))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn livez(State(state): State<HealthState>) -> (StatusCode, &'static str) {
    if state.lifecycle.is_live(state.stale_after) {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "backend prober stalled")
    }
}

async fn readiness(State(state): State<HealthState>) -> (StatusCode, Json<HealthBody>) {
    let snapshot = state.lifecycle.snapshot();
    let cache = state.handler.cache();
    let healthy = snapshot.state == ServingState::Ready;
    let message = match (&snapshot.last_error, snapshot.state) {
        (_, ServingState::Terminating) => "shutting down".to_string(),
        (Some(error), _) => error.clone(),
        (None, ServingState::Starting) => "waiting for first backend probe".to_string(),
        (None, _) => "ok".to_string(),
    };

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(HealthBody {
            state: snapshot.state,
            healthy,
            key_id: cache.key_id().to_string(),
            key_version: cache.version(),
            message,
        }),
    )
}

/// Serve the health endpoints until shutdown begins.
pub async fn serve_health(addr: SocketAddr, state: HealthState) -> anyhow::Result<()> {
    let lifecycle = Arc::clone(&state.lifecycle);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Health endpoints on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { lifecycle.terminated().await })
        .await?;
    Ok(())
}

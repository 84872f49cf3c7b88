//! HTTP surface of the daemon
//!
//! Read-only endpoints for operators and the load balancer: liveness
//! (`/healthz`), readiness (`/readyz`), the session table as of the last
//! sweep (`/sessions`), and prometheus exposition (`/metrics`).

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use fleet_core::registry::ContainerRegistry;
use fleet_core::{Condition, HealthBoard};
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;
use tracing::info;

pub struct AppState {
    pub health: HealthBoard,
    pub registry: Arc<ContainerRegistry>,
}

/// Liveness: a degraded node is still alive, a failed subsystem is not.
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.health.snapshot();
    let code = if snapshot.condition == Condition::Failed {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(snapshot))
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health.readiness();
    let code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(readiness))
}

/// Session name to human status string, as of the last sweep.
async fn sessions(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.registry.session_status())
}

async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&prometheus::gather(), &mut buffer) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            err.to_string().into_bytes(),
        );
    }
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/sessions", get(sessions))
        .route("/metrics", get(metrics))
        .with_state(state)
}

pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);
    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use crate::error::ApiError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/health/detailed", get(health_detailed))
        .route("/ready", get(ready))
        .route("/live", get(live))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "causerie",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn live() -> Json<serde_json::Value> {
    Json(json!({ "alive": true }))
}

async fn ready(State(state): State<AppState>) -> Response {
    match state.db.lock().await.ping() {
        Ok(()) => Json(json!({ "ready": true })).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "readiness probe failed");
            ApiError::service_unavailable("store unavailable").into_response()
        }
    }
}

/// Probes the store and reports bus mode. A failing store probe is a 503;
/// a peerless bus is only degraded, never unhealthy.
async fn health_detailed(State(state): State<AppState>) -> Response {
    let store_healthy = match state.db.lock().await.ping() {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(error = %e, "store health probe failed");
            false
        }
    };

    let peer_count = state.bus.connected_peer_count();
    let bus_mode = if state.config.bus_peers.is_empty() {
        "single-node"
    } else if peer_count == 0 {
        "degraded"
    } else {
        "mesh"
    };

    let body = json!({
        "status": if store_healthy { "ok" } else { "unhealthy" },
        "version": env!("CARGO_PKG_VERSION"),
        "store": { "healthy": store_healthy },
        "bus": {
            "mode": bus_mode,
            "configuredPeers": state.config.bus_peers.len(),
            "connectedPeers": peer_count,
        },
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });

    if store_healthy {
        Json(json!({ "success": true, "data": body })).into_response()
    } else {
        ApiError::service_unavailable("store probe failed").into_response()
    }
}

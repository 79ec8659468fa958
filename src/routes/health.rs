//! Unauthenticated health-check endpoint.

use std::sync::atomic::Ordering;

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// `GET /api/health` — liveness probe.
///
/// Returns status, uptime, version, live tunnel count and relay counters.
/// No authentication required.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let tunnels = state.gateway.registry().len().await;
    let rs = &state.relay_stats;

    Json(json!({
        "status": "ok",
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "tunnels": tunnels,
        "relays": {
            "active": rs.active.load(Ordering::Relaxed),
            "total": rs.total.load(Ordering::Relaxed),
            "bytes_to_backend": rs.bytes_to_backend.load(Ordering::Relaxed),
            "bytes_to_client": rs.bytes_to_client.load(Ordering::Relaxed),
        },
    }))
}

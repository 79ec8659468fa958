//! Tunnel lifecycle endpoints.
//!
//! | Method | Path                             | Result                        |
//! |--------|----------------------------------|-------------------------------|
//! | POST   | `/api/tunnels/{target}`          | create or reuse, `TokenView`  |
//! | GET    | `/api/tunnels/{target}`          | `TokenView` or 404            |
//! | GET    | `/api/tunnels`                   | all live tunnels              |
//! | DELETE | `/api/credentials/{credential}`  | revoked `TokenView` or 404    |

use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::error::GatewayError;
use crate::tokens::token::{short, TokenView};
use crate::AppState;

/// Optional body of `POST /api/tunnels/{target}`.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TunnelRequest {
    /// Idle window in seconds; the configured default when absent.
    pub expiration: Option<u64>,
}

/// `POST /api/tunnels/{target}`. An empty body is accepted.
pub async fn request_tunnel(
    State(state): State<AppState>,
    Path(target): Path<String>,
    body: Bytes,
) -> Result<Json<TokenView>, GatewayError> {
    let req: TunnelRequest = if body.iter().all(u8::is_ascii_whitespace) {
        TunnelRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| GatewayError::Validation(format!("bad request body: {e}")))?
    };

    let token = state
        .gateway
        .request_tunnel(&target, req.expiration.map(Duration::from_secs))
        .await?;
    info!(host = %target, credential = %token.short_credential(), "Tunnel requested");
    Ok(Json(token.view()))
}

/// `GET /api/tunnels/{target}`.
pub async fn describe_tunnel(
    State(state): State<AppState>,
    Path(target): Path<String>,
) -> Result<Json<TokenView>, GatewayError> {
    state.gateway.describe_tunnel(&target).await.map(Json)
}

/// `GET /api/tunnels`.
pub async fn list_tunnels(State(state): State<AppState>) -> Json<Value> {
    let tunnels = state.gateway.list_tunnels().await;
    Json(json!({
        "count": tunnels.len(),
        "tunnels": tunnels,
    }))
}

/// `DELETE /api/credentials/{credential}`.
pub async fn revoke_tunnel(
    State(state): State<AppState>,
    Path(credential): Path<String>,
) -> Result<Json<TokenView>, GatewayError> {
    let view = state.gateway.revoke_tunnel(&credential).await?;
    info!(host = %view.target, credential = %short(&credential), "Tunnel revoked");
    Ok(Json(view))
}

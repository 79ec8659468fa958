//! Pre-shared API key for the tunnel lifecycle endpoints.
//!
//! `/api/tunnels*` and `/api/credentials/*` require
//! `Authorization: Bearer <key>`. The upgrade endpoint is not covered: a
//! tunnel credential in `?token=` is its own authorization.

use axum::{
    extract::Request,
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Expected key, injected as a router extension so [`require_api_key`] does
/// not depend on `AppState`.
#[derive(Clone)]
pub struct ApiKey(pub String);

fn deny(status: StatusCode, message: &str, code: &str) -> Response {
    (status, Json(json!({"error": message, "code": code}))).into_response()
}

/// Rejects requests without a valid bearer key.
///
/// - `401` when the header is missing or not `Bearer`
/// - `403` when the key does not match
/// - `500` when no [`ApiKey`] extension is installed
pub async fn require_api_key(request: Request, next: Next) -> Response {
    let Some(ApiKey(expected)) = request.extensions().get::<ApiKey>().cloned() else {
        return deny(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Server configuration error",
            "INTERNAL_ERROR",
        );
    };

    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));
    let Some(provided) = provided else {
        return deny(
            StatusCode::UNAUTHORIZED,
            "Missing or invalid Authorization header",
            "UNAUTHORIZED",
        );
    };

    if !constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
        return deny(StatusCode::FORBIDDEN, "Invalid API key", "FORBIDDEN");
    }

    next.run(request).await
}

/// Constant-time comparison; runs over all of `expected` whatever the length
/// of `provided`.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        diff |= e ^ provided.get(i).copied().unwrap_or(0xff);
    }
    diff == 0
}

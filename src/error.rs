//! Error taxonomy for tunnel management.
//!
//! Token management errors are returned synchronously to the caller and
//! rendered as `{"error": .., "code": ..}` JSON bodies. Relay errors live in
//! [`crate::ws::relay::RelayError`] and never leave their connection.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::backend::BackendError;

/// Errors surfaced by the tunnel lifecycle operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Credential or target unknown.
    #[error("{0} not found")]
    NotFound(String),

    /// Malformed request (bad target name, bad body).
    #[error("invalid request: {0}")]
    Validation(String),

    /// The remote-execution call failed to start or stop a tunnel.
    #[error("remote tunnel error: {0}")]
    Upstream(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Upstream(_) => "UPSTREAM_ERROR",
        }
    }
}

impl From<BackendError> for GatewayError {
    fn from(err: BackendError) -> Self {
        Self::Upstream(err.to_string())
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(json!({"error": self.to_string(), "code": self.code()})),
        )
            .into_response()
    }
}

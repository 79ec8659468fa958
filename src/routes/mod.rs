//! HTTP routes and router assembly.
//!
//! Everything except [`health`] and the upgrade endpoint sits behind
//! [`crate::auth::require_api_key`]. Every response, errors and `101`s
//! included, passes through the CORS layer.

pub mod health;
pub mod tunnels;

use axum::{
    middleware,
    routing::{delete, get},
    Extension, Router,
};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::auth::{self, ApiKey};
use crate::{cors, ws, AppState};

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    let upgrade = state.config.upgrade_route();
    let upgrade_any = if upgrade == "/" {
        "/{*rest}".to_string()
    } else {
        format!("{upgrade}/{{*rest}}")
    };

    let public_routes = Router::new()
        .route("/api/health", get(health::health))
        .route(&upgrade, get(ws::handle_upgrade))
        .route(&upgrade_any, get(ws::handle_upgrade));

    let authed_routes = Router::new()
        .route("/api/tunnels", get(tunnels::list_tunnels))
        .route(
            "/api/tunnels/{target}",
            get(tunnels::describe_tunnel).post(tunnels::request_tunnel),
        )
        .route("/api/credentials/{credential}", delete(tunnels::revoke_tunnel))
        .layer(middleware::from_fn(auth::require_api_key));

    Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn_with_state(
                    state.gateway.cors(),
                    cors::apply_cors,
                ))
                .layer(Extension(ApiKey(state.config.auth.api_key.clone()))),
        )
        .with_state(state)
}

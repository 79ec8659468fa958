//! Cross-origin headers attached to every gateway response.
//!
//! With an allow-list, the request `Origin` is echoed only when listed and
//! nothing is added otherwise. Without one, `Access-Control-Allow-Origin: *`
//! is sent. `Access-Control-Allow-Credentials: true` accompanies either form
//! when enabled.

use std::collections::HashSet;
use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue},
    middleware::Next,
    response::Response,
};

#[derive(Debug, Clone, Default)]
pub struct CorsPolicy {
    /// `None` means any origin (wildcard).
    allowed_origins: Option<HashSet<String>>,
    allow_credentials: bool,
}

impl CorsPolicy {
    pub fn new(allowed_origins: Option<Vec<String>>, allow_credentials: bool) -> Self {
        Self {
            allowed_origins: allowed_origins.map(|list| list.into_iter().collect()),
            allow_credentials,
        }
    }

    /// Headers for a request carrying `origin`.
    pub fn headers_for(&self, origin: Option<&HeaderValue>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let allow_origin = match &self.allowed_origins {
            None => HeaderValue::from_static("*"),
            Some(list) => match origin {
                Some(o) if o.to_str().is_ok_and(|o| list.contains(o)) => o.clone(),
                _ => return headers,
            },
        };
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, allow_origin);
        if self.allow_credentials {
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
                HeaderValue::from_static("true"),
            );
        }
        headers
    }
}

/// Axum middleware adding [`CorsPolicy`] headers to the response, including
/// error and `101` responses.
pub async fn apply_cors(
    State(policy): State<Arc<CorsPolicy>>,
    request: Request,
    next: Next,
) -> Response {
    let extra = policy.headers_for(request.headers().get(header::ORIGIN));
    let mut response = next.run(request).await;
    response.headers_mut().extend(extra);
    response
}

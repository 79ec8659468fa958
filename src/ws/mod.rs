//! WebSocket tunnel endpoint.
//!
//! ## Connection lifecycle
//!
//! 1. Client sends `GET /<upgrade_path>?token=<credential>` with WebSocket
//!    upgrade headers. The credential is the one returned by
//!    `POST /api/tunnels/{target}`.
//! 2. The credential is looked up, the version and subprotocol are
//!    negotiated, and a TCP connection to the tunnel's local port is opened
//!    with keepalive enabled. Only then is the tunnel's idle timer refreshed.
//! 3. The `101` response goes out; the upgraded connection is then handed to
//!    a [`relay::RelayEngine`] on its own task until either side closes.
//!
//! Any refusal before step 3 is a `400` with a plain-text reason, or `502`
//! if the local tunnel port does not answer.

pub mod handshake;
pub mod relay;

use std::io;
use std::net::SocketAddr;

use axum::{
    extract::{Query, Request, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tokio::net::{TcpSocket, TcpStream};
use tokio_tungstenite::{tungstenite::protocol::Role, WebSocketStream};
use tracing::{info, info_span, warn, Instrument};

use crate::error::GatewayError;
use crate::tokens::port::TUNNEL_HOST;
use crate::tokens::token::{short, TunnelToken};
use crate::AppState;
use handshake::{Handshake, HandshakeError};
use relay::{ConnectionState, RelayConnection, RelayEngine};

/// Query parameters for the upgrade request.
#[derive(Debug, Deserialize)]
pub struct UpgradeQuery {
    /// Tunnel credential. Carried in the URL because browsers cannot set
    /// headers on a WebSocket upgrade.
    pub token: Option<String>,
}

impl IntoResponse for HandshakeError {
    fn into_response(self) -> Response {
        (StatusCode::BAD_REQUEST, self.to_string()).into_response()
    }
}

/// Everything checked before the `101` goes out.
struct Validated {
    token: TunnelToken,
    handshake: Handshake,
    backend: TcpStream,
}

/// `GET /<upgrade_path>[/...]?token=<credential>` — upgrade and relay.
pub async fn handle_upgrade(
    State(state): State<AppState>,
    Query(query): Query<UpgradeQuery>,
    mut request: Request,
) -> Response {
    let mut conn = RelayConnection::new();
    let span = info_span!("relay", connection = %conn.id);

    let validated = match validate(&state, query.token.as_deref(), request.headers())
        .instrument(span.clone())
        .await
    {
        Ok(v) => v,
        Err(response) => {
            conn.close();
            return response;
        }
    };
    conn.advance(ConnectionState::Validated);

    let cookie = Some(state.config.server.cookie.as_str())
        .filter(|name| !name.is_empty())
        .map(|name| format!("{name}={}", conn.id));
    let response = validated.handshake.response(cookie.as_deref());

    let on_upgrade = hyper::upgrade::on(&mut request);
    let buffer_size = state.config.server.relay_buffer_size;
    let stats = state.relay_stats.clone();

    tokio::spawn(
        async move {
            let Validated {
                token,
                handshake,
                backend,
            } = validated;

            let upgraded = match on_upgrade.await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    warn!("HTTP upgrade failed: {e}");
                    conn.close();
                    return;
                }
            };
            conn.advance(ConnectionState::Upgraded);

            let client =
                WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
            conn.advance(ConnectionState::Relaying);
            info!(
                host = %token.target,
                port = token.local_port,
                protocol = handshake.protocol.as_str(),
                version = handshake.version,
                "Relay started"
            );

            stats.opened();
            let engine = RelayEngine::new(handshake.protocol, buffer_size);
            match engine.run(client, backend).await {
                Ok(outcome) => {
                    info!(
                        reason = outcome.reason.as_str(),
                        to_backend = outcome.to_backend,
                        to_client = outcome.to_client,
                        "Relay closed"
                    );
                    stats.closed(Some(&outcome));
                }
                Err(e) => {
                    warn!("Relay failed: {e}");
                    stats.closed(None);
                }
            }
            conn.close();
        }
        .instrument(span),
    );

    response
}

async fn validate(
    state: &AppState,
    credential: Option<&str>,
    headers: &HeaderMap,
) -> Result<Validated, Response> {
    let reject = |e: HandshakeError| {
        warn!("Upgrade refused: {e}");
        e.into_response()
    };

    if !handshake::is_websocket_upgrade(headers) {
        return Err(reject(HandshakeError::NotUpgrade));
    }
    let credential = credential
        .filter(|c| !c.is_empty())
        .ok_or_else(|| reject(HandshakeError::MissingCredential))?;
    let unknown = || {
        warn!(credential = %short(credential), "Unknown tunnel credential");
        reject(HandshakeError::UnknownCredential)
    };
    let registry = state.gateway.registry();
    let token = registry.lookup(credential).await.ok_or_else(unknown)?;
    let handshake = handshake::negotiate(headers).map_err(reject)?;

    let backend = connect_backend(token.local_port).await.map_err(|e| {
        warn!(host = %token.target, port = token.local_port, "Tunnel port unreachable: {e}");
        GatewayError::Upstream(format!("tunnel port {} unreachable", token.local_port))
            .into_response()
    })?;

    // Only a handshake that is about to succeed counts as activity.
    let token = registry.activate(credential).await.ok_or_else(unknown)?;

    Ok(Validated {
        token,
        handshake,
        backend,
    })
}

/// Open the relay's backend connection to the tunnel's local port.
async fn connect_backend(port: u16) -> io::Result<TcpStream> {
    let socket = TcpSocket::new_v4()?;
    socket.set_keepalive(true)?;
    let stream = socket.connect(SocketAddr::from((TUNNEL_HOST, port))).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

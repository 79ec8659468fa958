//! WebSocket opening handshake for the tunnel endpoint.
//!
//! Done by hand rather than through axum's extractor: the tunnel accepts the
//! HyBi-07/08 draft versions as well as RFC 6455 (13), and picks between the
//! `binary` and `base64` subprotocols that noVNC-style clients offer.

use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::Response,
};
use thiserror::Error;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;

/// `Sec-WebSocket-Version` values we speak (HyBi-07, HyBi-08..12, RFC 6455).
pub const SUPPORTED_VERSIONS: [&str; 3] = ["7", "8", "13"];

/// Framing negotiated for relayed bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subprotocol {
    /// Raw bytes in binary frames.
    Binary,
    /// Base64 text in text frames.
    Base64,
}

impl Subprotocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Binary => "binary",
            Self::Base64 => "base64",
        }
    }
}

/// Why an upgrade was refused. Always answered with `400 Bad Request`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("Not a websocket request")]
    NotUpgrade,
    #[error("Missing token")]
    MissingCredential,
    #[error("Unable to validate connection")]
    UnknownCredential,
    #[error("Missing Sec-WebSocket-Version")]
    MissingVersion,
    #[error("Unsupported Sec-WebSocket-Version: {0}")]
    UnsupportedVersion(String),
    #[error("Missing Sec-WebSocket-Key")]
    MissingKey,
    #[error("No supported subprotocol offered: {0}")]
    NoSubprotocol(String),
}

/// Outcome of a successful negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub version: u8,
    pub protocol: Subprotocol,
    /// Whether the client offered subprotocols, i.e. whether the choice is
    /// echoed back in `Sec-WebSocket-Protocol`.
    pub echo_protocol: bool,
    pub accept: String,
}

/// `Upgrade: websocket` present (token match is case-insensitive).
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::UPGRADE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case("websocket"))
}

/// Validate version, pick the subprotocol and compute the accept key.
pub fn negotiate(headers: &HeaderMap) -> Result<Handshake, HandshakeError> {
    let version = headers
        .get(header::SEC_WEBSOCKET_VERSION)
        .ok_or(HandshakeError::MissingVersion)?
        .to_str()
        .map(str::trim)
        .unwrap_or_default();
    if !SUPPORTED_VERSIONS.contains(&version) {
        return Err(HandshakeError::UnsupportedVersion(version.to_string()));
    }
    let version = version
        .parse()
        .map_err(|_| HandshakeError::UnsupportedVersion(version.to_string()))?;

    // Offers may arrive comma-separated, as repeated headers, or both.
    let offers: Vec<&str> = headers
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    let offered = (!offers.is_empty()).then(|| offers.join(","));
    let protocol = select_subprotocol(offered.as_deref())?;

    let key = headers
        .get(header::SEC_WEBSOCKET_KEY)
        .map(HeaderValue::as_bytes)
        .filter(|k| !k.is_empty())
        .ok_or(HandshakeError::MissingKey)?;

    Ok(Handshake {
        version,
        protocol,
        echo_protocol: offered.is_some(),
        accept: accept_key(key),
    })
}

/// `binary` if offered, else `base64`. No offer at all means `binary`.
pub fn select_subprotocol(offered: Option<&str>) -> Result<Subprotocol, HandshakeError> {
    let Some(offered) = offered else {
        return Ok(Subprotocol::Binary);
    };
    let has = |name: &str| offered.split(',').any(|p| p.trim() == name);
    if has("binary") {
        Ok(Subprotocol::Binary)
    } else if has("base64") {
        Ok(Subprotocol::Base64)
    } else {
        Err(HandshakeError::NoSubprotocol(offered.to_string()))
    }
}

/// `base64(SHA1(key + "258EAFA5-E914-47DA-95CA-C5AB0DC85B11"))`.
pub fn accept_key(client_key: &[u8]) -> String {
    derive_accept_key(client_key)
}

impl Handshake {
    /// The `101 Switching Protocols` response. CORS headers are added by the
    /// gateway's response layer.
    pub fn response(&self, cookie: Option<&str>) -> Response {
        let mut builder = Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(header::UPGRADE, "websocket")
            .header(header::CONNECTION, "Upgrade")
            .header(header::SEC_WEBSOCKET_ACCEPT, &self.accept);
        if self.echo_protocol {
            builder = builder.header(header::SEC_WEBSOCKET_PROTOCOL, self.protocol.as_str());
        }
        if let Some(cookie) = cookie.and_then(|c| HeaderValue::from_str(c).ok()) {
            builder = builder.header(header::SET_COOKIE, cookie);
        }
        builder.body(Body::empty()).unwrap_or_else(|_| {
            let mut resp = Response::new(Body::empty());
            *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            resp
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.append(*k, HeaderValue::from_static(v));
        }
        h
    }

    fn upgrade_headers(version: &'static str) -> HeaderMap {
        headers(&[
            ("upgrade", "websocket"),
            ("connection", "Upgrade"),
            ("sec-websocket-version", version),
            ("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ=="),
            ("sec-websocket-protocol", "binary"),
        ])
    }

    #[test]
    fn test_accept_key_rfc6455_vector() {
        assert_eq!(
            accept_key(b"dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kWGUwOPXFE7y0A="
        );
    }

    #[test]
    fn test_upgrade_detection() {
        assert!(is_websocket_upgrade(&headers(&[("upgrade", "WebSocket")])));
        assert!(is_websocket_upgrade(&headers(&[("upgrade", "h2c, websocket")])));
        assert!(!is_websocket_upgrade(&headers(&[("upgrade", "h2c")])));
        assert!(!is_websocket_upgrade(&HeaderMap::new()));
    }

    #[test]
    fn test_supported_versions() {
        for v in ["7", "8", "13"] {
            let hs = negotiate(&upgrade_headers(v)).unwrap();
            assert_eq!(hs.version.to_string(), v);
        }
    }

    #[test]
    fn test_version_6_rejected() {
        assert_eq!(
            negotiate(&upgrade_headers("6")),
            Err(HandshakeError::UnsupportedVersion("6".into()))
        );
    }

    #[test]
    fn test_missing_version_and_key() {
        let h = headers(&[("upgrade", "websocket")]);
        assert_eq!(negotiate(&h), Err(HandshakeError::MissingVersion));

        let h = headers(&[("upgrade", "websocket"), ("sec-websocket-version", "13")]);
        assert_eq!(negotiate(&h), Err(HandshakeError::MissingKey));
    }

    #[test]
    fn test_subprotocol_preference() {
        assert_eq!(
            select_subprotocol(Some("base64, binary")),
            Ok(Subprotocol::Binary)
        );
        assert_eq!(select_subprotocol(Some("base64")), Ok(Subprotocol::Base64));
        assert_eq!(select_subprotocol(None), Ok(Subprotocol::Binary));
        assert!(matches!(
            select_subprotocol(Some("chat, superchat")),
            Err(HandshakeError::NoSubprotocol(_))
        ));
    }

    #[test]
    fn test_repeated_protocol_headers() {
        let mut h = upgrade_headers("13");
        h.insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("base64"));
        h.append(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("binary"));
        let hs = negotiate(&h).unwrap();
        assert_eq!(hs.protocol, Subprotocol::Binary);
        assert!(hs.echo_protocol);

        let mut h = upgrade_headers("13");
        h.insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("chat"));
        h.append(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("base64"));
        assert_eq!(negotiate(&h).unwrap().protocol, Subprotocol::Base64);
    }

    #[test]
    fn test_response_headers() {
        let hs = negotiate(&upgrade_headers("13")).unwrap();
        let resp = hs.response(Some("websockify=abc"));
        assert_eq!(resp.status(), StatusCode::SWITCHING_PROTOCOLS);
        let h = resp.headers();
        assert_eq!(h[header::UPGRADE], "websocket");
        assert_eq!(h[header::CONNECTION], "Upgrade");
        assert_eq!(h[header::SEC_WEBSOCKET_ACCEPT], "s3pPLMBiTxaQ9kWGUwOPXFE7y0A=");
        assert_eq!(h[header::SEC_WEBSOCKET_PROTOCOL], "binary");
        assert_eq!(h[header::SET_COOKIE], "websockify=abc");
    }

    #[test]
    fn test_response_without_offer_omits_protocol() {
        let mut h = upgrade_headers("13");
        h.remove(header::SEC_WEBSOCKET_PROTOCOL);
        let resp = negotiate(&h).unwrap().response(None);
        assert!(resp.headers().get(header::SEC_WEBSOCKET_PROTOCOL).is_none());
        assert!(resp.headers().get(header::SET_COOKIE).is_none());
    }
}

//! A single authorized tunnel session.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::time::Instant;

/// Opaque handle of the remote tunnel process (e.g. its pid on the target).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct RemoteHandle(pub String);

impl fmt::Display for RemoteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One live tunnel: a bearer credential bound to a target and the local port
/// its remote tunnel forwards to.
///
/// Tokens are only ever constructed once the remote side has returned a
/// handle, so every token held by the registry is usable.
#[derive(Debug, Clone)]
pub struct TunnelToken {
    pub credential: String,
    pub target: String,
    pub local_port: u16,
    pub remote_handle: RemoteHandle,
    /// Inactivity window after which the sweep reclaims the token.
    pub expiration: Duration,
    /// Monotonic time of the last creation/reuse/activation.
    pub last_seen: Instant,
    /// Wall-clock mirror of `last_seen` (unix seconds) for views.
    pub last_seen_unix: u64,
}

impl TunnelToken {
    pub fn new(
        target: &str,
        local_port: u16,
        remote_handle: RemoteHandle,
        expiration: Duration,
    ) -> Self {
        Self {
            credential: uuid::Uuid::new_v4().simple().to_string(),
            target: target.to_string(),
            local_port,
            remote_handle,
            expiration,
            last_seen: Instant::now(),
            last_seen_unix: unix_now(),
        }
    }

    pub fn refresh(&mut self) {
        self.last_seen = Instant::now();
        self.last_seen_unix = unix_now();
    }

    /// Strictly-greater comparison: a token idle for exactly its window is kept.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_seen) > self.expiration
    }

    pub fn view(&self) -> TokenView {
        TokenView {
            credential: self.credential.clone(),
            target: self.target.clone(),
            expiration: whole_secs(self.expiration),
            last_seen: self.last_seen_unix,
            port: self.local_port,
        }
    }

    /// Credential prefix safe to put in logs.
    pub fn short_credential(&self) -> &str {
        short(&self.credential)
    }
}

/// Serializable view returned by the lifecycle endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenView {
    pub credential: String,
    pub target: String,
    /// Expiration window in seconds.
    pub expiration: u64,
    /// Unix seconds of the last reuse.
    pub last_seen: u64,
    pub port: u16,
}

/// Seconds, rounded up so a sub-second window never shows as 0.
fn whole_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

pub(crate) fn short(credential: &str) -> &str {
    credential.get(..8).unwrap_or(credential)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::gateway::TunnelGateway;
use crate::ws::relay::RelayOutcome;

#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    pub gateway: Arc<TunnelGateway>,
    pub relay_stats: Arc<RelayStats>,
}

impl AppState {
    pub fn new(config: Config, gateway: Arc<TunnelGateway>) -> Self {
        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            gateway,
            relay_stats: Arc::new(RelayStats::default()),
        }
    }
}

/// Relay counters. Atomics only; read by `/api/health`.
#[derive(Debug, Default)]
pub struct RelayStats {
    pub active: AtomicU64,
    pub total: AtomicU64,
    pub bytes_to_backend: AtomicU64,
    pub bytes_to_client: AtomicU64,
}

impl RelayStats {
    pub fn opened(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn closed(&self, outcome: Option<&RelayOutcome>) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        if let Some(o) = outcome {
            self.bytes_to_backend.fetch_add(o.to_backend, Ordering::Relaxed);
            self.bytes_to_client.fetch_add(o.to_client, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::relay::CloseReason;

    #[test]
    fn test_relay_stats() {
        let stats = RelayStats::default();
        stats.opened();
        stats.opened();
        stats.closed(Some(&RelayOutcome {
            reason: CloseReason::Client,
            to_backend: 10,
            to_client: 4,
        }));
        stats.closed(None);
        assert_eq!(stats.active.load(Ordering::Relaxed), 0);
        assert_eq!(stats.total.load(Ordering::Relaxed), 2);
        assert_eq!(stats.bytes_to_backend.load(Ordering::Relaxed), 10);
        assert_eq!(stats.bytes_to_client.load(Ordering::Relaxed), 4);
    }
}

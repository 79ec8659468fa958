//! Composition root for tunnel management.
//!
//! [`TunnelGateway`] ties the [`TokenRegistry`] to the remote-execution
//! [`TunnelBackend`], owns the background expiry sweep, and carries the CORS
//! policy applied to every HTTP response. It is constructed once in `main` and
//! shared through [`crate::AppState`].

use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backend::TunnelBackend;
use crate::config::{Config, TokensConfig};
use crate::cors::CorsPolicy;
use crate::error::GatewayError;
use crate::tokens::token::{TokenView, TunnelToken};
use crate::tokens::TokenRegistry;

/// Longest accepted target name.
const MAX_TARGET_LEN: usize = 255;

/// Timing knobs for token management.
#[derive(Debug, Clone, Copy)]
pub struct GatewaySettings {
    pub default_expiration: Duration,
    pub sweep_interval: Duration,
    pub remote_timeout: Duration,
    pub probe_timeout: Duration,
}

impl From<&TokensConfig> for GatewaySettings {
    fn from(c: &TokensConfig) -> Self {
        Self {
            default_expiration: Duration::from_secs(c.default_expiration_secs),
            sweep_interval: Duration::from_secs(c.sweep_interval_secs.max(1)),
            remote_timeout: Duration::from_secs(c.remote_timeout_secs),
            probe_timeout: Duration::from_millis(c.probe_timeout_ms),
        }
    }
}

pub struct TunnelGateway {
    registry: TokenRegistry,
    backend: Arc<dyn TunnelBackend>,
    cors: Arc<CorsPolicy>,
    settings: GatewaySettings,
    cancel: CancellationToken,
    sweeper: StdMutex<Option<JoinHandle<()>>>,
}

impl TunnelGateway {
    pub fn new(backend: Arc<dyn TunnelBackend>, cors: CorsPolicy, settings: GatewaySettings) -> Self {
        Self {
            registry: TokenRegistry::new(settings.remote_timeout, settings.probe_timeout),
            backend,
            cors: Arc::new(cors),
            settings,
            cancel: CancellationToken::new(),
            sweeper: StdMutex::new(None),
        }
    }

    pub fn from_config(config: &Config, backend: Arc<dyn TunnelBackend>) -> Self {
        Self::new(
            backend,
            CorsPolicy::new(
                config.cors.allowed_origins.clone(),
                config.cors.allow_credentials,
            ),
            GatewaySettings::from(&config.tokens),
        )
    }

    pub fn registry(&self) -> &TokenRegistry {
        &self.registry
    }

    pub fn cors(&self) -> Arc<CorsPolicy> {
        Arc::clone(&self.cors)
    }

    /// Create or reuse the tunnel for `target`. `expiration` defaults to the
    /// configured window.
    pub async fn request_tunnel(
        &self,
        target: &str,
        expiration: Option<Duration>,
    ) -> Result<TunnelToken, GatewayError> {
        validate_target(target)?;
        let expiration = expiration.unwrap_or(self.settings.default_expiration);
        if expiration.is_zero() {
            return Err(GatewayError::Validation("expiration must be positive".into()));
        }
        self.registry
            .create_or_reuse(target, expiration, Arc::clone(&self.backend))
            .await
    }

    pub async fn describe_tunnel(&self, target: &str) -> Result<TokenView, GatewayError> {
        validate_target(target)?;
        self.registry
            .lookup_by_target(target)
            .await
            .map(|t| t.view())
            .ok_or_else(|| GatewayError::NotFound(format!("tunnel for {target}")))
    }

    pub async fn revoke_tunnel(&self, credential: &str) -> Result<TokenView, GatewayError> {
        self.registry
            .delete(credential, Arc::clone(&self.backend))
            .await
            .map(|t| t.view())
    }

    /// Every live token, ordered by target.
    pub async fn list_tunnels(&self) -> Vec<TokenView> {
        let mut views: Vec<TokenView> = self.registry.list().await.iter().map(TunnelToken::view).collect();
        views.sort_by(|a, b| a.target.cmp(&b.target));
        views
    }

    /// Spawn the periodic expiry sweep. Calling it again replaces nothing; the
    /// first task keeps running.
    pub fn start_sweeper(self: &Arc<Self>) {
        let mut slot = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() || self.cancel.is_cancelled() {
            return;
        }

        let gateway = Arc::clone(self);
        let cancel = self.cancel.clone();
        let every = self.settings.sweep_interval.max(Duration::from_millis(1));
        *slot = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let removed = gateway
                            .registry
                            .sweep_expired(Arc::clone(&gateway.backend))
                            .await;
                        if !removed.is_empty() {
                            info!(count = removed.len(), "Swept expired tunnel tokens");
                        }
                    }
                }
            }
            debug!("Sweep task stopped");
        }));
        info!(interval_secs = every.as_secs(), "Expiry sweep started");
    }

    /// Stop the sweep and close every remaining remote tunnel. Returns how
    /// many were closed; later calls find nothing left and return 0.
    pub async fn shutdown(&self) -> usize {
        self.cancel.cancel();
        let task = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
        let closed = self.registry.close_all(Arc::clone(&self.backend)).await;
        if closed > 0 {
            info!(count = closed, "Closed remote tunnels on shutdown");
        }
        closed
    }
}

/// Target names end up in remote command argv, so keep them to a safe
/// hostname-like alphabet.
pub fn is_valid_target(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= MAX_TARGET_LEN
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

fn validate_target(target: &str) -> Result<(), GatewayError> {
    if is_valid_target(target) {
        Ok(())
    } else {
        Err(GatewayError::Validation(format!("bad target name {target:?}")))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::backend::fake::FakeBackend;

    fn gateway(backend: Arc<FakeBackend>, sweep: Duration) -> Arc<TunnelGateway> {
        Arc::new(TunnelGateway::new(
            backend,
            CorsPolicy::default(),
            GatewaySettings {
                default_expiration: Duration::from_secs(60),
                sweep_interval: sweep,
                remote_timeout: Duration::from_secs(5),
                probe_timeout: Duration::from_millis(500),
            },
        ))
    }

    #[test]
    fn test_target_validation() {
        assert!(is_valid_target("host1"));
        assert!(is_valid_target("minion-01.lab_a"));
        assert!(!is_valid_target(""));
        assert!(!is_valid_target("a b"));
        assert!(!is_valid_target("host;rm"));
        assert!(!is_valid_target("*"));
        assert!(!is_valid_target(&"a".repeat(256)));
        assert!(is_valid_target(&"a".repeat(255)));
    }

    #[tokio::test]
    async fn test_request_twice_reuses_credential() {
        let backend = Arc::new(FakeBackend::new());
        let gw = gateway(backend.clone(), Duration::from_secs(60));

        let a = gw.request_tunnel("host1", None).await.unwrap();
        let b = gw.request_tunnel("host1", None).await.unwrap();
        assert_eq!(a.credential, b.credential);
        assert_eq!(backend.opens.load(Ordering::SeqCst), 1);

        let view = gw.describe_tunnel("host1").await.unwrap();
        assert_eq!(view.credential, a.credential);
        assert_eq!(view.expiration, 60);
        gw.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_requests() {
        let gw = gateway(Arc::new(FakeBackend::new()), Duration::from_secs(60));
        assert!(matches!(
            gw.request_tunnel("bad host", None).await,
            Err(GatewayError::Validation(_))
        ));
        assert!(matches!(
            gw.request_tunnel("host1", Some(Duration::ZERO)).await,
            Err(GatewayError::Validation(_))
        ));
        assert!(matches!(
            gw.describe_tunnel("host1").await,
            Err(GatewayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_opener_failure_is_upstream() {
        let backend = Arc::new(FakeBackend::new());
        backend.fail.store(true, Ordering::SeqCst);
        let gw = gateway(backend, Duration::from_secs(60));
        assert!(matches!(
            gw.request_tunnel("host1", None).await,
            Err(GatewayError::Upstream(_))
        ));
        assert!(gw.list_tunnels().await.is_empty());
    }

    #[tokio::test]
    async fn test_revoke_twice() {
        let backend = Arc::new(FakeBackend::new());
        let gw = gateway(backend.clone(), Duration::from_secs(60));
        let token = gw.request_tunnel("host1", None).await.unwrap();

        let view = gw.revoke_tunnel(&token.credential).await.unwrap();
        assert_eq!(view.target, "host1");
        assert!(matches!(
            gw.revoke_tunnel(&token.credential).await,
            Err(GatewayError::NotFound(_))
        ));
        assert_eq!(backend.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_list_sorted_by_target() {
        let gw = gateway(Arc::new(FakeBackend::new()), Duration::from_secs(60));
        gw.request_tunnel("zeta", None).await.unwrap();
        gw.request_tunnel("alpha", None).await.unwrap();
        let targets: Vec<String> = gw.list_tunnels().await.into_iter().map(|v| v.target).collect();
        assert_eq!(targets, vec!["alpha", "zeta"]);
        gw.shutdown().await;
    }

    #[tokio::test]
    async fn test_sweeper_reclaims_idle_tunnel() {
        let backend = Arc::new(FakeBackend::new());
        let gw = gateway(backend.clone(), Duration::from_millis(50));
        gw.start_sweeper();
        gw.request_tunnel("host1", Some(Duration::from_millis(200)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(matches!(
            gw.describe_tunnel("host1").await,
            Err(GatewayError::NotFound(_))
        ));
        assert_eq!(backend.closes.load(Ordering::SeqCst), 1);
        assert_eq!(gw.shutdown().await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_each_tunnel_once() {
        let backend = Arc::new(FakeBackend::new());
        let gw = gateway(backend.clone(), Duration::from_secs(60));
        gw.start_sweeper();
        gw.request_tunnel("host1", None).await.unwrap();
        gw.request_tunnel("host2", None).await.unwrap();

        assert_eq!(gw.shutdown().await, 2);
        assert_eq!(gw.shutdown().await, 0);
        assert_eq!(backend.closes.load(Ordering::SeqCst), 2);

        // No restart after shutdown.
        gw.start_sweeper();
        assert!(gw.sweeper.lock().unwrap().is_none());
    }
}

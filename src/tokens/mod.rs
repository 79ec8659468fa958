//! Registry of live tunnel tokens.
//!
//! [`TokenRegistry`] is the single authority over tunnel tokens. It keeps two
//! indices over the same set of tokens (by target and by credential) and
//! enforces at most one live token per target.
//!
//! ## Concurrency
//!
//! Both indices sit behind one `RwLock`, so every insert/remove updates them
//! together. The lock is never held while the backend runs: creation first
//! takes a per-target reservation (serializing creators for that target
//! only), probes and calls out without the lock, then commits under a short
//! write lock. Deletion removes under the write lock and only the remover
//! calls the backend's `close`, so a token is closed exactly once even when an
//! explicit delete races the sweep.
//!
//! Backend calls run on their own tasks. Dropping a caller's future (an HTTP
//! client hanging up mid-request) never cancels a remote open or close, so a
//! committed or removed token always has its remote side effect carried out.

pub mod port;
pub mod token;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::{BackendError, TunnelBackend};
use crate::error::GatewayError;
use token::{short, TunnelToken};

/// The two indices. Only mutated through [`Indices::insert`] and
/// [`Indices::remove`].
#[derive(Default)]
struct Indices {
    by_target: HashMap<String, TunnelToken>,
    /// credential -> target
    by_credential: HashMap<String, String>,
}

impl Indices {
    /// Insert `token`, returning whatever token previously held its target.
    fn insert(&mut self, token: TunnelToken) -> Option<TunnelToken> {
        let displaced = self.remove_target(&token.target);
        self.by_credential
            .insert(token.credential.clone(), token.target.clone());
        self.by_target.insert(token.target.clone(), token);
        displaced
    }

    fn remove(&mut self, credential: &str) -> Option<TunnelToken> {
        let target = self.by_credential.remove(credential)?;
        self.by_target.remove(&target)
    }

    fn remove_target(&mut self, target: &str) -> Option<TunnelToken> {
        let token = self.by_target.remove(target)?;
        self.by_credential.remove(&token.credential);
        Some(token)
    }

    fn get(&self, credential: &str) -> Option<&TunnelToken> {
        self.by_credential
            .get(credential)
            .and_then(|target| self.by_target.get(target))
    }

    fn get_mut(&mut self, credential: &str) -> Option<&mut TunnelToken> {
        let target = self.by_credential.get(credential)?;
        self.by_target.get_mut(target)
    }

    fn drain(&mut self) -> Vec<TunnelToken> {
        self.by_credential.clear();
        self.by_target.drain().map(|(_, t)| t).collect()
    }
}

type ReservationMap = Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>;

/// Exclusive right to create a token for one target. Released on drop.
struct Reservation {
    target: String,
    map: ReservationMap,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.guard.take();
        if let Ok(mut map) = self.map.lock() {
            // Only the map's own reference left: nobody is queued behind us.
            if map
                .get(&self.target)
                .is_some_and(|slot| Arc::strong_count(slot) == 1)
            {
                map.remove(&self.target);
            }
        }
    }
}

/// Owns every live [`TunnelToken`].
///
/// Cloneable; all clones share the same indices.
#[derive(Clone)]
pub struct TokenRegistry {
    indices: Arc<RwLock<Indices>>,
    reservations: ReservationMap,
    /// Bound on each backend open/close call.
    remote_timeout: Duration,
    /// Bound on the liveness probe connect.
    probe_timeout: Duration,
}

impl TokenRegistry {
    pub fn new(remote_timeout: Duration, probe_timeout: Duration) -> Self {
        Self {
            indices: Arc::new(RwLock::new(Indices::default())),
            reservations: Arc::new(StdMutex::new(HashMap::new())),
            remote_timeout,
            probe_timeout,
        }
    }

    async fn reserve(&self, target: &str) -> Reservation {
        let slot = {
            let mut map = self
                .reservations
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            map.entry(target.to_string()).or_default().clone()
        };
        let guard = slot.lock_owned().await;
        Reservation {
            target: target.to_string(),
            map: self.reservations.clone(),
            guard: Some(guard),
        }
    }

    /// Return the live token for `target`, or open a new tunnel and register
    /// a token for it.
    ///
    /// A token whose local port still accepts connections is refreshed and
    /// returned with its credential unchanged. A token whose port is dead is
    /// discarded (and its remote tunnel closed) before a new one is opened.
    ///
    /// The work runs on a spawned task and completes even if this future is
    /// dropped.
    pub async fn create_or_reuse(
        &self,
        target: &str,
        expiration: Duration,
        backend: Arc<dyn TunnelBackend>,
    ) -> Result<TunnelToken, GatewayError> {
        let registry = self.clone();
        let target = target.to_string();
        tokio::spawn(async move { registry.open_or_reuse(&target, expiration, &backend).await })
            .await
            .map_err(BackendError::from)?
    }

    async fn open_or_reuse(
        &self,
        target: &str,
        expiration: Duration,
        backend: &Arc<dyn TunnelBackend>,
    ) -> Result<TunnelToken, GatewayError> {
        let _reservation = self.reserve(target).await;

        let existing = self.lookup_by_target(target).await;
        if let Some(token) = existing {
            if port::probe(token.local_port, self.probe_timeout).await {
                if let Some(live) = self.activate(&token.credential).await {
                    debug!(host = %target, credential = %live.short_credential(), "Reusing tunnel token");
                    return Ok(live);
                }
            } else {
                warn!(
                    host = %target,
                    port = token.local_port,
                    "Tunnel port no longer accepts connections, replacing token"
                );
                let stale = self.indices.write().await.remove(&token.credential);
                if let Some(stale) = stale {
                    self.close_remote(&stale, backend).await.ok();
                }
            }
        }

        let local_port = port::allocate_port()
            .await
            .map_err(|e| GatewayError::Upstream(format!("no free local port: {e}")))?;

        let handle = match tokio::time::timeout(
            self.remote_timeout,
            backend.open(target, local_port),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(BackendError::Timeout.into()),
        };

        let token = TunnelToken::new(target, local_port, handle, expiration);
        let displaced = self.indices.write().await.insert(token.clone());
        if let Some(old) = displaced {
            warn!(host = %target, "Displaced unexpected token for target");
            self.close_remote(&old, backend).await.ok();
        }

        info!(
            host = %target,
            port = local_port,
            handle = %token.remote_handle,
            credential = %token.short_credential(),
            "Tunnel token created"
        );
        Ok(token)
    }

    pub async fn lookup(&self, credential: &str) -> Option<TunnelToken> {
        self.indices.read().await.get(credential).cloned()
    }

    pub async fn lookup_by_target(&self, target: &str) -> Option<TunnelToken> {
        self.indices.read().await.by_target.get(target).cloned()
    }

    /// Look up `credential` and refresh its `last_seen`.
    pub async fn activate(&self, credential: &str) -> Option<TunnelToken> {
        let mut indices = self.indices.write().await;
        let token = indices.get_mut(credential)?;
        token.refresh();
        Some(token.clone())
    }

    pub async fn list(&self) -> Vec<TunnelToken> {
        self.indices.read().await.by_target.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.indices.read().await.by_target.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Remove `credential` from both indices and close its remote tunnel.
    ///
    /// Bookkeeping is removed before the backend is called; a failing close
    /// is logged but the token stays deleted. Once the token is removed the
    /// close runs to completion even if this future is dropped.
    pub async fn delete(
        &self,
        credential: &str,
        backend: Arc<dyn TunnelBackend>,
    ) -> Result<TunnelToken, GatewayError> {
        let token = self
            .indices
            .write()
            .await
            .remove(credential)
            .ok_or_else(|| GatewayError::NotFound(format!("credential {}", short(credential))))?;
        info!(host = %token.target, credential = %token.short_credential(), "Tunnel token deleted");
        self.close_remote(&token, &backend).await.ok();
        Ok(token)
    }

    pub async fn sweep_expired(&self, backend: Arc<dyn TunnelBackend>) -> Vec<TunnelToken> {
        self.sweep_expired_at(Instant::now(), backend).await
    }

    /// Delete every token idle for longer than its expiration window as of
    /// `now`. Returns the removed tokens.
    pub async fn sweep_expired_at(
        &self,
        now: Instant,
        backend: Arc<dyn TunnelBackend>,
    ) -> Vec<TunnelToken> {
        // Scan under the read lock, remove afterwards.
        let expired: Vec<String> = {
            let indices = self.indices.read().await;
            if indices.by_target.is_empty() {
                return Vec::new();
            }
            indices
                .by_target
                .values()
                .filter(|t| t.is_expired_at(now))
                .map(|t| t.credential.clone())
                .collect()
        };

        let mut removed = Vec::with_capacity(expired.len());
        for credential in expired {
            let token = {
                let mut indices = self.indices.write().await;
                // Reused since the scan: keep it.
                if !indices.get(&credential).is_some_and(|t| t.is_expired_at(now)) {
                    continue;
                }
                indices.remove(&credential)
            };
            if let Some(token) = token {
                info!(host = %token.target, credential = %token.short_credential(), "Tunnel token expired");
                self.close_remote(&token, &backend).await.ok();
                removed.push(token);
            }
        }
        removed
    }

    /// Remove every token and close all remote tunnels. Used at shutdown.
    pub async fn close_all(&self, backend: Arc<dyn TunnelBackend>) -> usize {
        let tokens = self.indices.write().await.drain();
        let count = tokens.len();
        futures::future::join_all(tokens.iter().map(|t| self.close_remote(t, &backend))).await;
        count
    }

    /// Close `token`'s remote tunnel on its own task, bounded by the remote
    /// timeout.
    async fn close_remote(
        &self,
        token: &TunnelToken,
        backend: &Arc<dyn TunnelBackend>,
    ) -> Result<(), BackendError> {
        let backend = Arc::clone(backend);
        let target = token.target.clone();
        let handle = token.remote_handle.clone();
        let limit = self.remote_timeout;
        let task = tokio::spawn(async move {
            tokio::time::timeout(limit, backend.close(&target, &handle)).await
        });
        let result = match task.await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BackendError::Timeout),
            Err(e) => Err(e.into()),
        };
        if let Err(ref e) = result {
            warn!(
                host = %token.target,
                handle = %token.remote_handle,
                "Failed to close remote tunnel: {e}"
            );
        }
        result
    }
}

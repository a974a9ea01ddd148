use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

use crate::error::{BrokerError, Result};

/// Builds the tenant-scoped state (models, connections) a handler runs against
#[async_trait]
pub trait TenantStateResolver: Send + Sync + 'static {
    type State: Send + Sync + 'static;

    async fn resolve(&self, subdomain: &str) -> anyhow::Result<Self::State>;
}

/// Per-tenant memo of resolved state.
///
/// Concurrent lookups for the same tenant share one resolution. Failed
/// resolutions are not cached.
pub struct TenantCache<R: TenantStateResolver> {
    resolver: R,
    states: Mutex<HashMap<String, Arc<OnceCell<Arc<R::State>>>>>,
}

impl<R: TenantStateResolver> TenantCache<R> {
    pub fn new(resolver: R) -> Self {
        Self {
            resolver,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, subdomain: &str) -> Result<Arc<R::State>> {
        if subdomain.trim().is_empty() {
            return Err(BrokerError::MissingTenant);
        }

        let cell = self
            .states
            .lock()
            .await
            .entry(subdomain.to_string())
            .or_default()
            .clone();

        let resolved = cell
            .get_or_try_init(|| async {
                info!("Resolving state for tenant: {}", subdomain);
                self.resolver
                    .resolve(subdomain)
                    .await
                    .map(Arc::new)
                    .map_err(|e| BrokerError::TenantResolution {
                        subdomain: subdomain.to_string(),
                        reason: e.to_string(),
                    })
            })
            .await
            .cloned();

        if resolved.is_err() {
            let mut states = self.states.lock().await;
            let unresolved = states
                .get(subdomain)
                .is_some_and(|current| Arc::ptr_eq(current, &cell) && !current.initialized());
            if unresolved {
                states.remove(subdomain);
            }
        }
        resolved
    }

    /// Drop the cached state so the next message re-resolves it.
    pub async fn invalidate(&self, subdomain: &str) -> bool {
        let removed = self.states.lock().await.remove(subdomain).is_some();
        if removed {
            debug!("Invalidated state for tenant: {}", subdomain);
        }
        removed
    }

    pub async fn clear(&self) {
        self.states.lock().await.clear();
    }

    /// Tenants with resolved state
    pub async fn len(&self) -> usize {
        self.states
            .lock()
            .await
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Models {
        loads: AtomicUsize,
    }

    #[async_trait]
    impl TenantStateResolver for Arc<Models> {
        type State = String;

        async fn resolve(&self, subdomain: &str) -> anyhow::Result<String> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if subdomain == "broken" {
                anyhow::bail!("no database for {}", subdomain);
            }
            tokio::task::yield_now().await;
            Ok(format!("models:{}", subdomain))
        }
    }

    #[tokio::test]
    async fn test_state_is_memoized_per_tenant() {
        let models = Arc::new(Models::default());
        let cache = TenantCache::new(models.clone());

        let (a, b) = tokio::join!(cache.get("acme"), cache.get("acme"));
        assert_eq!(*a.unwrap(), "models:acme");
        assert_eq!(*b.unwrap(), "models:acme");
        cache.get("globex").await.unwrap();

        assert_eq!(models.loads.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn test_invalidate_forces_reload() {
        let models = Arc::new(Models::default());
        let cache = TenantCache::new(models.clone());

        cache.get("acme").await.unwrap();
        assert!(cache.invalidate("acme").await);
        cache.get("acme").await.unwrap();

        assert_eq!(models.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let models = Arc::new(Models::default());
        let cache = TenantCache::new(models.clone());

        for _ in 0..2 {
            let err = cache.get("broken").await.unwrap_err();
            assert!(matches!(err, BrokerError::TenantResolution { .. }));
        }
        assert_eq!(models.loads.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty().await);
        assert!(cache.states.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_tenant() {
        let cache = TenantCache::new(Arc::new(Models::default()));
        assert!(matches!(cache.get(" ").await, Err(BrokerError::MissingTenant)));
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{BrokerError, Result};

/// What the platform knows about one service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    /// Where the service can be reached, if discovery knows it
    #[serde(default)]
    pub address: Option<String>,
    /// Disabled services are treated as absent by callers
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub version: Option<String>,
    /// Actions the service serves
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

fn default_enabled() -> bool {
    true
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: None,
            enabled: true,
            version: None,
            actions: Vec::new(),
            last_seen: None,
        }
    }

    pub fn with_actions<I, S>(mut self, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.actions = actions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Service discovery collaborator: resolves a service name to its descriptor
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    async fn discover(&self, service_name: &str) -> Result<Option<ServiceDescriptor>>;

    /// Every service currently known
    async fn services(&self) -> Result<Vec<ServiceDescriptor>>;
}

/// Discovery backed by a fixed list, usually from configuration
#[derive(Debug, Default)]
pub struct StaticDiscovery {
    services: HashMap<String, ServiceDescriptor>,
}

impl StaticDiscovery {
    pub fn new(services: impl IntoIterator<Item = ServiceDescriptor>) -> Self {
        Self {
            services: services
                .into_iter()
                .map(|descriptor| (descriptor.name.clone(), descriptor))
                .collect(),
        }
    }
}

#[async_trait]
impl ServiceDiscovery for StaticDiscovery {
    async fn discover(&self, service_name: &str) -> Result<Option<ServiceDescriptor>> {
        Ok(self.services.get(service_name).cloned())
    }

    async fn services(&self) -> Result<Vec<ServiceDescriptor>> {
        Ok(self.services.values().cloned().collect())
    }
}

/// Service registry for tracking reachable services.
///
/// Filled from discovery at startup and read-mostly afterwards. A miss
/// falls through to discovery once before the service counts as unknown.
pub struct ServiceRegistry {
    discovery: Arc<dyn ServiceDiscovery>,
    services: RwLock<HashMap<String, ServiceDescriptor>>,
}

impl ServiceRegistry {
    pub fn new(discovery: Arc<dyn ServiceDiscovery>) -> Self {
        Self {
            discovery,
            services: RwLock::new(HashMap::new()),
        }
    }

    /// Registry with no discovery backend: only local registrations count.
    pub fn local() -> Self {
        Self::new(Arc::new(StaticDiscovery::default()))
    }

    /// Initial discovery handshake
    pub async fn bootstrap(&self) -> Result<usize> {
        let discovered = self.discovery.services().await?;
        let mut services = self.services.write().await;
        for descriptor in discovered {
            services.insert(descriptor.name.clone(), descriptor);
        }

        info!("📇 Service registry bootstrapped with {} services", services.len());
        Ok(services.len())
    }

    /// Replace cached entries with a fresh discovery snapshot, keeping
    /// local registrations discovery does not know about.
    pub async fn refresh(&self) -> Result<()> {
        let discovered = self.discovery.services().await?;
        let mut services = self.services.write().await;

        services.retain(|_, descriptor| descriptor.last_seen.is_some());
        for descriptor in discovered {
            services.insert(descriptor.name.clone(), descriptor);
        }
        debug!("Service registry refreshed: {} services", services.len());
        Ok(())
    }

    /// Descriptor of an enabled service, or `UnknownService`.
    pub async fn resolve(&self, service_name: &str) -> Result<ServiceDescriptor> {
        let cached = self.services.read().await.get(service_name).cloned();

        let descriptor = match cached {
            Some(descriptor) => Some(descriptor),
            None => {
                let discovered = self.discovery.discover(service_name).await?;
                if let Some(descriptor) = &discovered {
                    self.services
                        .write()
                        .await
                        .insert(descriptor.name.clone(), descriptor.clone());
                }
                discovered
            }
        };

        match descriptor {
            Some(descriptor) if descriptor.enabled => Ok(descriptor),
            _ => Err(BrokerError::UnknownService {
                service_name: service_name.to_string(),
            }),
        }
    }

    /// Announce a service from this process.
    pub async fn register(&self, mut descriptor: ServiceDescriptor) {
        descriptor.last_seen = Some(Utc::now());
        info!("Registered service: {}", descriptor.name);
        self.services
            .write()
            .await
            .insert(descriptor.name.clone(), descriptor);
    }

    pub async fn unregister(&self, service_name: &str) -> Option<ServiceDescriptor> {
        self.services.write().await.remove(service_name)
    }

    pub async fn is_enabled(&self, service_name: &str) -> bool {
        self.resolve(service_name).await.is_ok()
    }

    pub async fn get_service(&self, service_name: &str) -> Option<ServiceDescriptor> {
        self.services.read().await.get(service_name).cloned()
    }

    pub async fn list_services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDiscovery {
        inner: StaticDiscovery,
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl ServiceDiscovery for CountingDiscovery {
        async fn discover(&self, service_name: &str) -> Result<Option<ServiceDescriptor>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.inner.discover(service_name).await
        }

        async fn services(&self) -> Result<Vec<ServiceDescriptor>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_bootstrap_and_resolve() {
        let discovery = StaticDiscovery::new([
            ServiceDescriptor::new("products").with_actions(["find"]),
            ServiceDescriptor::new("core"),
        ]);
        let registry = ServiceRegistry::new(Arc::new(discovery));

        assert_eq!(registry.bootstrap().await.unwrap(), 2);
        let products = registry.resolve("products").await.unwrap();
        assert_eq!(products.actions, vec!["find".to_string()]);
        assert_eq!(registry.list_services().await, vec!["core", "products"]);
    }

    #[tokio::test]
    async fn test_unknown_and_disabled_services() {
        let discovery = StaticDiscovery::new([ServiceDescriptor::new("cards").disabled()]);
        let registry = ServiceRegistry::new(Arc::new(discovery));
        registry.bootstrap().await.unwrap();

        assert!(matches!(
            registry.resolve("nope").await,
            Err(BrokerError::UnknownService { .. })
        ));
        assert!(!registry.is_enabled("cards").await);
    }

    #[tokio::test]
    async fn test_miss_falls_through_to_discovery_once() {
        let discovery = Arc::new(CountingDiscovery {
            inner: StaticDiscovery::new([ServiceDescriptor::new("contacts")]),
            lookups: AtomicUsize::new(0),
        });
        let registry = ServiceRegistry::new(discovery.clone());

        registry.resolve("contacts").await.unwrap();
        registry.resolve("contacts").await.unwrap();
        assert_eq!(discovery.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_local_registration_survives_refresh() {
        let registry = ServiceRegistry::local();
        registry.register(ServiceDescriptor::new("ebarimt")).await;
        registry.refresh().await.unwrap();

        assert!(registry.get_service("ebarimt").await.unwrap().last_seen.is_some());
        assert!(registry.unregister("ebarimt").await.is_some());
        assert!(registry.resolve("ebarimt").await.is_err());
    }
}

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::client::TransportClient;
use crate::error::{BrokerError, Result};
use crate::message::{Envelope, Reply};
use crate::queue::queue_name_for;
use crate::registry::ServiceRegistry;

/// Per-call options for [`ServiceCaller::call`]
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Overrides the caller's default deadline
    pub timeout: Option<Duration>,
    /// Returned instead of `UnknownService` when the target is absent or
    /// disabled
    pub default_value: Option<serde_json::Value>,
}

impl CallOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_default(mut self, value: impl Serialize) -> Result<Self> {
        self.default_value = Some(serde_json::to_value(value)?);
        Ok(self)
    }
}

/// The sanctioned way for one plugin to reach another.
///
/// Cheap to clone; every clone shares the process's transport client and
/// registry.
#[derive(Debug, Clone)]
pub struct ServiceCaller {
    client: Arc<TransportClient>,
    registry: Arc<ServiceRegistry>,
    default_timeout: Duration,
}

impl ServiceCaller {
    pub fn new(client: Arc<TransportClient>, registry: Arc<ServiceRegistry>, default_timeout: Duration) -> Self {
        Self {
            client,
            registry,
            default_timeout,
        }
    }

    /// Call `action` on `service` for tenant `subdomain` and decode the
    /// reply data.
    pub async fn call<P, T>(
        &self,
        subdomain: &str,
        service: &str,
        action: &str,
        payload: P,
        options: CallOptions,
    ) -> Result<T>
    where
        P: Serialize,
        T: DeserializeOwned,
    {
        if let Err(e) = self.registry.resolve(service).await {
            return match (e, options.default_value) {
                (BrokerError::UnknownService { .. }, Some(default)) => {
                    debug!("{} unavailable, returning default for {}", service, action);
                    Ok(serde_json::from_value(default)?)
                }
                (e, _) => Err(e),
            };
        }

        let queue = queue_name_for(service, action)?;
        let envelope = Envelope::new(subdomain, payload)?;
        let timeout = options.timeout.unwrap_or(self.default_timeout);

        debug!("🔄 {} calling {} for {}", self.client.client_name(), queue, subdomain);

        match self.client.publish_and_wait(&queue, &envelope, timeout).await? {
            Reply::Success { data } => Ok(serde_json::from_value(data)?),
            Reply::Error { error_message } => Err(BrokerError::Handler {
                service: service.to_string(),
                action: action.to_string(),
                message: error_message,
            }),
        }
    }

    /// Fire-and-forget. Fails only for an unknown service or a malformed
    /// request; transport failures are logged and swallowed.
    pub async fn send<P: Serialize>(&self, subdomain: &str, service: &str, action: &str, payload: P) -> Result<()> {
        self.registry.resolve(service).await?;

        let queue = queue_name_for(service, action)?;
        let envelope = Envelope::new(subdomain, payload)?;

        if let Err(e) = self.client.publish(&queue, &envelope).await {
            if !e.is_transport() {
                return Err(e);
            }
            warn!("Dropping event for {}: {}", queue, e);
        }
        Ok(())
    }

    /// Like [`send`](Self::send), but an unknown or disabled service is
    /// skipped instead of failing.
    pub async fn send_if_enabled<P: Serialize>(
        &self,
        subdomain: &str,
        service: &str,
        action: &str,
        payload: P,
    ) -> Result<bool> {
        match self.send(subdomain, service, action, payload).await {
            Ok(()) => Ok(true),
            Err(BrokerError::UnknownService { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Helper bound to one target service
    pub fn service(&self, name: impl Into<String>) -> ServiceHandle {
        ServiceHandle {
            caller: self.clone(),
            service: name.into(),
        }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }
}

/// A [`ServiceCaller`] fixed to one target, e.g. `caller.service("products")`
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    caller: ServiceCaller,
    service: String,
}

impl ServiceHandle {
    pub fn name(&self) -> &str {
        &self.service
    }

    pub async fn call<P, T>(&self, subdomain: &str, action: &str, payload: P, options: CallOptions) -> Result<T>
    where
        P: Serialize,
        T: DeserializeOwned,
    {
        self.caller
            .call(subdomain, &self.service, action, payload, options)
            .await
    }

    pub async fn send<P: Serialize>(&self, subdomain: &str, action: &str, payload: P) -> Result<()> {
        self.caller.send(subdomain, &self.service, action, payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ServiceDescriptor;
    use crate::transport::MemoryBroker;
    use serde_json::json;

    async fn caller(broker: &MemoryBroker, registry: ServiceRegistry) -> ServiceCaller {
        let client = TransportClient::new("facebook", Arc::new(broker.transport()))
            .await
            .unwrap();
        ServiceCaller::new(Arc::new(client), Arc::new(registry), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_unknown_service_fails_before_publish() {
        let broker = MemoryBroker::new();
        let caller = caller(&broker, ServiceRegistry::local()).await;
        let queue = queue_name_for("products", "find").unwrap();

        let err = caller
            .call::<_, serde_json::Value>("acme", "products", "find", json!({}), CallOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::UnknownService { ref service_name } if service_name == "products"));

        let err = caller.send("acme", "products", "find", json!({})).await.unwrap_err();
        assert!(matches!(err, BrokerError::UnknownService { .. }));
        assert!(!broker.queue_names().await.contains(&queue));
    }

    #[tokio::test]
    async fn test_default_value_for_unknown_service() {
        let broker = MemoryBroker::new();
        let caller = caller(&broker, ServiceRegistry::local()).await;

        let options = CallOptions::default().with_default(Vec::<u32>::new()).unwrap();
        let products: Vec<u32> = caller
            .call("acme", "products", "find", json!({}), options)
            .await
            .unwrap();
        assert!(products.is_empty());
    }

    #[tokio::test]
    async fn test_send_if_enabled_skips_disabled_service() {
        let broker = MemoryBroker::new();
        let registry = ServiceRegistry::local();
        registry
            .register(ServiceDescriptor::new("notifications").disabled())
            .await;
        let caller = caller(&broker, registry).await;

        let sent = caller
            .send_if_enabled("acme", "notifications", "send", json!({ "title": "hi" }))
            .await
            .unwrap();
        assert!(!sent);
    }

    #[tokio::test]
    async fn test_send_swallows_transport_errors() {
        let broker = MemoryBroker::new();
        let transport = broker.transport();
        let client = TransportClient::new("facebook", Arc::new(transport.clone()))
            .await
            .unwrap();
        let registry = ServiceRegistry::local();
        registry.register(ServiceDescriptor::new("core")).await;
        let caller = ServiceCaller::new(Arc::new(client), Arc::new(registry), Duration::from_secs(1));

        transport.disconnect();
        caller
            .service("core")
            .send("acme", "afterMutation", json!({}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_tenant_is_rejected() {
        let broker = MemoryBroker::new();
        let registry = ServiceRegistry::local();
        registry.register(ServiceDescriptor::new("core")).await;
        let caller = caller(&broker, registry).await;

        let err = caller.send("", "core", "afterMutation", ()).await.unwrap_err();
        assert!(matches!(err, BrokerError::MissingTenant));
    }
}

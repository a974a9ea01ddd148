use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::caller::ServiceCaller;
use crate::client::{ClientStats, TransportClient};
use crate::config::{BrokerConfig, RpcSettings};
use crate::dispatcher::{Action, Dispatcher};
use crate::error::Result;
use crate::registry::{ServiceDescriptor, ServiceDiscovery, ServiceRegistry, StaticDiscovery};
use crate::tenant::TenantStateResolver;
use crate::transport::{AmqpTransport, Transport};

/// Plugin operational status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginStatus {
    /// Connected, not serving yet
    Starting,
    /// Consuming its action queues
    Running,
    Stopped,
}

/// Everything one plugin process needs to talk to the rest of the platform:
/// one transport connection, the service registry, the transport client and
/// the call facade.
///
/// ```rust,no_run
/// # use pluginbus::{BrokerConfig, PluginHost};
/// # async fn run() -> pluginbus::Result<()> {
/// let host = PluginHost::connect(BrokerConfig::load("ebarimt")?).await?;
/// let products = host.caller().service("products");
/// # Ok(())
/// # }
/// ```
pub struct PluginHost {
    service_name: String,
    settings: RpcSettings,
    transport: Arc<dyn Transport>,
    registry: Arc<ServiceRegistry>,
    client: Arc<TransportClient>,
    caller: ServiceCaller,
    status: Arc<RwLock<PluginStatus>>,
}

impl PluginHost {
    /// Connect to RabbitMQ and discover services from the configuration.
    pub async fn connect(config: BrokerConfig) -> Result<Self> {
        info!("🚀 Starting plugin host: {}", config.service.name);

        let transport = AmqpTransport::connect_with(config.amqp.clone()).await?;
        let discovery = StaticDiscovery::new(config.services.clone());
        Self::with_transport(config, Arc::new(transport), Arc::new(discovery)).await
    }

    /// Build a host over any transport and discovery backend.
    pub async fn with_transport(
        config: BrokerConfig,
        transport: Arc<dyn Transport>,
        discovery: Arc<dyn ServiceDiscovery>,
    ) -> Result<Self> {
        let service_name = config.service.name.clone();

        let registry = Arc::new(ServiceRegistry::new(discovery));
        registry.bootstrap().await?;

        let client = Arc::new(TransportClient::new(service_name.clone(), transport.clone()).await?);
        let caller = ServiceCaller::new(client.clone(), registry.clone(), config.rpc.default_timeout());

        Ok(Self {
            service_name,
            settings: config.rpc,
            transport,
            registry,
            client,
            caller,
            status: Arc::new(RwLock::new(PluginStatus::Starting)),
        })
    }

    /// Start consuming every action of `dispatcher` and announce this
    /// plugin in the registry. Fails before consuming anything if an action
    /// is unbound.
    pub async fn serve<A, R>(&self, dispatcher: &Dispatcher<A, R>) -> Result<ServeHandle>
    where
        A: Action,
        R: TenantStateResolver,
    {
        info!("🏁 Serving plugin: {}", dispatcher.service_name());

        let consumers = dispatcher.start(self.transport.clone()).await?;
        let background = vec![self.start_sweep_task(), self.start_health_check_task()];

        self.registry
            .register(
                ServiceDescriptor::new(dispatcher.service_name())
                    .with_actions(dispatcher.action_names()),
            )
            .await;
        *self.status.write().await = PluginStatus::Running;

        info!(
            "🎯 Plugin {} is serving {} actions",
            dispatcher.service_name(),
            dispatcher.action_names().len()
        );
        Ok(ServeHandle {
            consumers,
            background,
            status: self.status.clone(),
        })
    }

    /// Evicts pending calls whose caller went away
    fn start_sweep_task(&self) -> JoinHandle<()> {
        let client = self.client.clone();
        let period = self.settings.sweep_interval();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let evicted = client.evict_expired_calls().await;
                if evicted > 0 {
                    debug!("🧹 Evicted {} expired calls", evicted);
                }
            }
        })
    }

    fn start_health_check_task(&self) -> JoinHandle<()> {
        let transport = self.transport.clone();
        let service_name = self.service_name.clone();
        let period = self.settings.health_check_interval();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if transport.is_connected().await {
                    debug!("💓 Health check OK for {}", service_name);
                } else {
                    warn!("⚠️  Plugin {} lost its broker connection", service_name);
                }
            }
        })
    }

    pub fn caller(&self) -> ServiceCaller {
        self.caller.clone()
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub async fn status(&self) -> PluginStatus {
        self.status.read().await.clone()
    }

    pub async fn is_healthy(&self) -> bool {
        *self.status.read().await == PluginStatus::Running && self.client.is_healthy().await
    }

    pub async fn get_stats(&self) -> HostStats {
        HostStats {
            service_name: self.service_name.clone(),
            status: self.status().await,
            known_services: self.registry.list_services().await,
            client: self.client.get_stats().await,
        }
    }
}

impl std::fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHost")
            .field("service_name", &self.service_name)
            .finish_non_exhaustive()
    }
}

/// Background tasks of a serving plugin
#[derive(Debug)]
pub struct ServeHandle {
    /// One per action queue
    consumers: Vec<JoinHandle<()>>,
    /// Pending-call sweep and health check
    background: Vec<JoinHandle<()>>,
    status: Arc<RwLock<PluginStatus>>,
}

impl ServeHandle {
    /// Run until every consumer stopped for good, i.e. its queue could not
    /// be subscribed again after a lost connection.
    pub async fn wait(self) -> Result<()> {
        let mut outcome: Result<()> = Ok(());
        for consumer in self.consumers {
            if let Err(e) = consumer.await {
                outcome = Err(e.into());
            }
        }
        for task in &self.background {
            task.abort();
        }

        *self.status.write().await = PluginStatus::Stopped;
        warn!("All consumers stopped, plugin is no longer serving");
        outcome
    }

    /// Stop consuming. In-flight handlers keep running to completion.
    pub async fn shutdown(self) {
        for task in self.consumers.iter().chain(&self.background) {
            task.abort();
        }
        *self.status.write().await = PluginStatus::Stopped;
        info!("Plugin stopped");
    }
}

/// Host statistics for monitoring
#[derive(Debug, Clone)]
pub struct HostStats {
    pub service_name: String,
    pub status: PluginStatus,
    pub known_services: Vec<String>,
    pub client: ClientStats,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Reply;
    use crate::transport::MemoryBroker;
    use async_trait::async_trait;
    use tokio::time::Duration;

    crate::actions! {
        enum CoreAction {
            Ping => "ping",
        }
    }

    struct NoState;

    #[async_trait]
    impl TenantStateResolver for NoState {
        type State = ();

        async fn resolve(&self, _subdomain: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    async fn host(broker: &MemoryBroker, name: &str) -> PluginHost {
        PluginHost::with_transport(
            BrokerConfig::new(name),
            Arc::new(broker.transport()),
            Arc::new(StaticDiscovery::default()),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_host_lifecycle() {
        let broker = MemoryBroker::new();
        let host = host(&broker, "core").await;
        assert_eq!(host.status().await, PluginStatus::Starting);
        assert!(!host.is_healthy().await);

        let mut dispatcher = Dispatcher::<CoreAction, _>::new("core", NoState);
        dispatcher
            .bind_rpc(CoreAction::Ping, |_ctx| async { Ok(Reply::success("pong")?) })
            .unwrap();
        let handle = host.serve(&dispatcher).await.unwrap();

        assert!(host.is_healthy().await);
        let stats = host.get_stats().await;
        assert_eq!(stats.known_services, vec!["core"]);
        assert_eq!(
            host.registry().resolve("core").await.unwrap().actions,
            vec!["ping".to_string()]
        );

        handle.shutdown().await;
        assert_eq!(host.status().await, PluginStatus::Stopped);
    }

    #[tokio::test]
    async fn test_serve_rejects_unbound_actions() {
        let broker = MemoryBroker::new();
        let host = host(&broker, "core").await;
        let dispatcher = Dispatcher::<CoreAction, _>::new("core", NoState);

        assert!(host.serve(&dispatcher).await.is_err());
        assert_eq!(host.status().await, PluginStatus::Starting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_returns_once_consumers_are_gone() {
        let broker = MemoryBroker::new();
        let transport = broker.transport();
        let host = PluginHost::with_transport(
            BrokerConfig::new("core"),
            Arc::new(transport.clone()),
            Arc::new(StaticDiscovery::default()),
        )
        .await
        .unwrap();

        let mut dispatcher = Dispatcher::<CoreAction, _>::new("core", NoState);
        dispatcher
            .bind_rpc(CoreAction::Ping, |_ctx| async { Ok(Reply::success("pong")?) })
            .unwrap();
        let handle = host.serve(&dispatcher).await.unwrap();

        // broker gone for good: consumers end and cannot come back
        transport.disconnect();
        transport.sever().await;

        tokio::time::timeout(Duration::from_secs(120), handle.wait())
            .await
            .expect("wait() did not return")
            .unwrap();
        assert_eq!(host.status().await, PluginStatus::Stopped);
    }
}

//! Two plugins in one process, talking over the in-memory broker.
//!
//! `core` serves `ping` and `afterMutation`; `ebarimt` calls it the way a
//! resolver would. Set `PLUGINBUS_AMQP=1` to run the same flow against
//! RabbitMQ instead (`PLUGINBUS__AMQP__URL` selects the broker).

use std::sync::Arc;

use async_trait::async_trait;
use pluginbus::{
    actions, telemetry, BrokerConfig, CallOptions, Dispatcher, MemoryBroker, PluginHost, Reply,
    StaticDiscovery, TenantStateResolver,
};
use serde::{Deserialize, Serialize};
use tracing::info;

actions! {
    pub enum CoreAction {
        Ping => "ping",
        AfterMutation => "afterMutation",
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Counter {
    n: u64,
}

/// Stand-in for a per-tenant model set
struct Models;

#[async_trait]
impl TenantStateResolver for Models {
    type State = String;

    async fn resolve(&self, subdomain: &str) -> anyhow::Result<String> {
        Ok(format!("mongodb://localhost/erxes_{}", subdomain))
    }
}

async fn build_host(name: &str, broker: &MemoryBroker) -> pluginbus::Result<PluginHost> {
    if std::env::var("PLUGINBUS_AMQP").is_ok() {
        return PluginHost::connect(BrokerConfig::load(name)?).await;
    }
    PluginHost::with_transport(
        BrokerConfig::new(name),
        Arc::new(broker.transport()),
        Arc::new(StaticDiscovery::default()),
    )
    .await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing("ping_pong=info,pluginbus=info");

    let broker = MemoryBroker::new();
    let core = build_host("core", &broker).await?;

    let mut dispatcher = Dispatcher::<CoreAction, _>::new("core", Models);
    dispatcher
        .bind_rpc(CoreAction::Ping, |ctx| async move {
            let counter: Counter = ctx.payload()?;
            info!("ping from {} using {}", ctx.subdomain, ctx.state);
            Ok(Reply::success(Counter { n: counter.n + 1 })?)
        })?
        .bind(CoreAction::AfterMutation, |ctx| async move {
            info!("afterMutation for {}: {}", ctx.subdomain, ctx.data);
            Ok(())
        })?;
    let serving = core.serve(&dispatcher).await?;

    let ebarimt = build_host("ebarimt", &broker).await?;
    // core announced itself in its own registry; tell ebarimt about it
    ebarimt
        .registry()
        .register(core.registry().resolve("core").await?)
        .await;

    let core_service = ebarimt.caller().service("core");
    let reply: Counter = core_service
        .call("acme", "ping", Counter { n: 1 }, CallOptions::default())
        .await?;
    info!("ping replied with n = {}", reply.n);

    core_service
        .send("acme", "afterMutation", serde_json::json!({ "type": "putresponse" }))
        .await?;

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    serving.shutdown().await;
    Ok(())
}

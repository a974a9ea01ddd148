//! # pluginbus - cross-plugin messaging
//!
//! Plugins of the platform run as separate services and reach each other
//! only through the message broker. This crate is that routing layer:
//!
//! - [`queue`]: `"<service>:<action>"` queue naming shared by every process
//! - [`transport`]: the broker seam, over RabbitMQ or in-process
//! - [`client`]: fire-and-forget `publish` and correlated `publish_and_wait`
//! - [`dispatcher`]: binds a plugin's closed action set to tenant-aware handlers
//! - [`caller`]: the `call`/`send` facade resolvers use to reach other plugins
//! - [`registry`]: which services exist, fed by a discovery backend
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pluginbus::{actions, BrokerConfig, CallOptions, Dispatcher, PluginHost, Reply, TenantStateResolver};
//!
//! actions! {
//!     pub enum CoreAction {
//!         Ping => "ping",
//!     }
//! }
//!
//! struct Models;
//!
//! #[async_trait::async_trait]
//! impl TenantStateResolver for Models {
//!     type State = ();
//!     async fn resolve(&self, _subdomain: &str) -> anyhow::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> pluginbus::Result<()> {
//!     let host = PluginHost::connect(BrokerConfig::load("core")?).await?;
//!
//!     let mut dispatcher = Dispatcher::<CoreAction, _>::new("core", Models);
//!     dispatcher.bind_rpc(CoreAction::Ping, |ctx| async move {
//!         Ok(Reply::success(ctx.data)?)
//!     })?;
//!     let running = host.serve(&dispatcher).await?;
//!
//!     let pong: serde_json::Value = host
//!         .caller()
//!         .call("acme", "core", "ping", serde_json::json!({ "n": 1 }), CallOptions::default())
//!         .await?;
//!     println!("{}", pong);
//!
//!     running.wait().await
//! }
//! ```

pub mod caller;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod host;
pub mod message;
pub mod pending;
pub mod queue;
pub mod registry;
pub mod telemetry;
pub mod tenant;
pub mod transport;

pub use caller::{CallOptions, ServiceCaller, ServiceHandle};
pub use client::{ClientStats, TransportClient};
pub use config::{BrokerConfig, ConnectionConfig, RpcSettings};
pub use dispatcher::{Action, Dispatcher, EventHandler, HandlerContext, RpcHandler};
pub use error::{BrokerError, Result};
pub use host::{HostStats, PluginHost, PluginStatus, ServeHandle};
pub use message::{Envelope, Reply};
pub use queue::{queue_name_for, QueueName};
pub use registry::{ServiceDescriptor, ServiceDiscovery, ServiceRegistry, StaticDiscovery};
pub use tenant::{TenantCache, TenantStateResolver};
pub use transport::{AmqpTransport, MemoryBroker, MemoryTransport, Transport};

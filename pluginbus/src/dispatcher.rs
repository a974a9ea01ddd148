//! Binds a plugin's actions to handlers and runs them.
//!
//! A plugin declares its actions as a closed enum (see [`actions!`]). Every
//! action must be bound before [`Dispatcher::start`] consumes anything;
//! a missing or doubled binding is a startup error.
//!
//! ```rust,no_run
//! use pluginbus::{actions, Dispatcher, Reply, TenantStateResolver};
//!
//! actions! {
//!     pub enum EbarimtAction {
//!         AfterMutation => "afterMutation",
//!         FindPutResponses => "putresponses.find",
//!     }
//! }
//!
//! struct Models;
//!
//! #[async_trait::async_trait]
//! impl TenantStateResolver for Models {
//!     type State = String;
//!     async fn resolve(&self, subdomain: &str) -> anyhow::Result<String> {
//!         Ok(format!("db_{}", subdomain))
//!     }
//! }
//!
//! # fn main() -> pluginbus::Result<()> {
//! let mut dispatcher = Dispatcher::<EbarimtAction, _>::new("ebarimt", Models);
//! dispatcher
//!     .bind(EbarimtAction::AfterMutation, |_ctx| async move { Ok(()) })?
//!     .bind_rpc(EbarimtAction::FindPutResponses, |ctx| async move {
//!         Ok(Reply::success(ctx.data)?)
//!     })?;
//! dispatcher.validate()?;
//! # Ok(())
//! # }
//! ```

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{FutureExt, StreamExt};
use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{BrokerError, Result};
use crate::message::{Envelope, InboundMessage, OutboundMessage, Reply};
use crate::queue::{queue_name_for, QueueName};
use crate::tenant::{TenantCache, TenantStateResolver};
use crate::transport::{resubscribe, DeliveryStream, QueueKind, Transport, RESUBSCRIBE_ATTEMPTS};

/// Handlers one action queue runs at once unless configured otherwise;
/// matches the default AMQP prefetch
pub const DEFAULT_MAX_IN_FLIGHT: usize = 10;

/// A closed set of actions served by one plugin
pub trait Action: Copy + Eq + Hash + Debug + Send + Sync + 'static {
    const ALL: &'static [Self];

    /// Wire name, the second half of the queue name
    fn name(&self) -> &'static str;

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|action| action.name() == name)
    }
}

/// Declare an action enum and its wire names.
#[macro_export]
macro_rules! actions {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $wire:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        $vis enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $crate::dispatcher::Action for $name {
            const ALL: &'static [Self] = &[ $( Self::$variant ),+ ];

            fn name(&self) -> &'static str {
                match self {
                    $( Self::$variant => $wire ),+
                }
            }
        }
    };
}

/// What a handler receives: the tenant, its resolved state, and the payload
#[derive(Debug)]
pub struct HandlerContext<S> {
    pub subdomain: String,
    pub state: Arc<S>,
    pub data: serde_json::Value,
}

impl<S> HandlerContext<S> {
    /// Deserialize payload to specific type
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}

/// Handler for fire-and-forget messages; its result is only logged
#[async_trait]
pub trait EventHandler<S>: Send + Sync {
    async fn handle(&self, ctx: HandlerContext<S>) -> anyhow::Result<()>;
}

/// Handler for request/reply messages
#[async_trait]
pub trait RpcHandler<S>: Send + Sync {
    async fn handle(&self, ctx: HandlerContext<S>) -> anyhow::Result<Reply>;
}

/// Closure-based handler
pub struct FunctionHandler<F> {
    handler: F,
}

impl<F> FunctionHandler<F> {
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl<S, F, Fut> EventHandler<S> for FunctionHandler<F>
where
    S: Send + Sync + 'static,
    F: Fn(HandlerContext<S>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, ctx: HandlerContext<S>) -> anyhow::Result<()> {
        (self.handler)(ctx).await
    }
}

#[async_trait]
impl<S, F, Fut> RpcHandler<S> for FunctionHandler<F>
where
    S: Send + Sync + 'static,
    F: Fn(HandlerContext<S>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Reply>> + Send,
{
    async fn handle(&self, ctx: HandlerContext<S>) -> anyhow::Result<Reply> {
        (self.handler)(ctx).await
    }
}

enum Binding<S> {
    Event(Arc<dyn EventHandler<S>>),
    Rpc(Arc<dyn RpcHandler<S>>),
}

impl<S> Clone for Binding<S> {
    fn clone(&self) -> Self {
        match self {
            Self::Event(handler) => Self::Event(handler.clone()),
            Self::Rpc(handler) => Self::Rpc(handler.clone()),
        }
    }
}

impl<S> Binding<S> {
    fn kind(&self) -> &'static str {
        match self {
            Self::Event(_) => "event",
            Self::Rpc(_) => "rpc",
        }
    }
}

/// Handler bindings of one plugin, keyed by its action enum
pub struct Dispatcher<A: Action, R: TenantStateResolver> {
    service_name: String,
    tenants: Arc<TenantCache<R>>,
    bindings: HashMap<A, Binding<R::State>>,
    max_in_flight: usize,
}

impl<A: Action, R: TenantStateResolver> Dispatcher<A, R> {
    pub fn new(service_name: impl Into<String>, resolver: R) -> Self {
        Self::with_tenant_cache(service_name, Arc::new(TenantCache::new(resolver)))
    }

    /// Share a tenant cache with other code of the same plugin (resolvers,
    /// invalidation on config change).
    pub fn with_tenant_cache(service_name: impl Into<String>, tenants: Arc<TenantCache<R>>) -> Self {
        Self {
            service_name: service_name.into(),
            tenants,
            bindings: HashMap::new(),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }

    /// Cap on concurrently running handlers per action queue. Further
    /// deliveries stay with the broker until a handler finishes.
    pub fn set_max_in_flight(&mut self, limit: usize) -> &mut Self {
        self.max_in_flight = limit.max(1);
        self
    }

    /// Bind a fire-and-forget handler.
    pub fn bind<F, Fut>(&mut self, action: A, handler: F) -> Result<&mut Self>
    where
        F: Fn(HandlerContext<R::State>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.bind_event_handler(action, FunctionHandler::new(handler))
    }

    /// Bind a request/reply handler.
    pub fn bind_rpc<F, Fut>(&mut self, action: A, handler: F) -> Result<&mut Self>
    where
        F: Fn(HandlerContext<R::State>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Reply>> + Send + 'static,
    {
        self.bind_rpc_handler(action, FunctionHandler::new(handler))
    }

    pub fn bind_event_handler<H>(&mut self, action: A, handler: H) -> Result<&mut Self>
    where
        H: EventHandler<R::State> + 'static,
    {
        self.insert(action, Binding::Event(Arc::new(handler)))
    }

    pub fn bind_rpc_handler<H>(&mut self, action: A, handler: H) -> Result<&mut Self>
    where
        H: RpcHandler<R::State> + 'static,
    {
        self.insert(action, Binding::Rpc(Arc::new(handler)))
    }

    fn insert(&mut self, action: A, binding: Binding<R::State>) -> Result<&mut Self> {
        if self.bindings.contains_key(&action) {
            return Err(BrokerError::DuplicateBinding {
                action: action.name().to_string(),
            });
        }
        debug!(
            "Bound {} handler for {}:{}",
            binding.kind(),
            self.service_name,
            action.name()
        );
        self.bindings.insert(action, binding);
        Ok(self)
    }

    /// Check that every action has exactly one well-formed queue and a
    /// handler.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for action in A::ALL {
            queue_name_for(&self.service_name, action.name())?;
            if !names.insert(action.name()) {
                return Err(BrokerError::InvalidQueueName {
                    reason: format!("action name '{}' is used twice", action.name()),
                });
            }
            if !self.bindings.contains_key(action) {
                return Err(BrokerError::UnboundAction {
                    service: self.service_name.clone(),
                    action: action.name().to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn tenants(&self) -> &Arc<TenantCache<R>> {
        &self.tenants
    }

    /// Wire names of every action, in declaration order
    pub fn action_names(&self) -> Vec<&'static str> {
        A::ALL.iter().map(Action::name).collect()
    }

    /// Validate, declare one queue per action and start consuming them.
    /// On failure, consumers already started are stopped again.
    pub async fn start(&self, transport: Arc<dyn Transport>) -> Result<Vec<JoinHandle<()>>> {
        self.validate()?;

        let mut handles = Vec::with_capacity(A::ALL.len());
        for action in A::ALL {
            match self.start_action(*action, &transport).await {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    error!("Failed to start {}:{}: {}", self.service_name, action.name(), e);
                    for handle in &handles {
                        handle.abort();
                    }
                    return Err(e);
                }
            }
        }

        Ok(handles)
    }

    async fn start_action(&self, action: A, transport: &Arc<dyn Transport>) -> Result<JoinHandle<()>> {
        let queue = queue_name_for(&self.service_name, action.name())?;
        transport.declare_queue(&queue, QueueKind::Durable).await?;

        let binding = self.bindings[&action].clone();
        let consumer_tag = format!("{}-{}", self.service_name, action.name());
        let stream = transport
            .consume(&queue, &format!("{}-{}", consumer_tag, Uuid::new_v4()))
            .await?;

        info!("📥 Consuming {} ({})", queue, binding.kind());
        let worker = Worker {
            queue,
            consumer_tag,
            binding,
            tenants: self.tenants.clone(),
            transport: transport.clone(),
            permits: Arc::new(Semaphore::new(self.max_in_flight)),
        };
        Ok(tokio::spawn(worker.run(stream)))
    }
}

impl<A: Action, R: TenantStateResolver> Debug for Dispatcher<A, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("service_name", &self.service_name)
            .field("bound", &self.bindings.len())
            .field("actions", &A::ALL.len())
            .finish()
    }
}

/// Consumer of one action queue
struct Worker<R: TenantStateResolver> {
    queue: QueueName,
    consumer_tag: String,
    binding: Binding<R::State>,
    tenants: Arc<TenantCache<R>>,
    transport: Arc<dyn Transport>,
    /// Bounds handlers in flight on this queue
    permits: Arc<Semaphore>,
}

impl<R: TenantStateResolver> Clone for Worker<R> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            consumer_tag: self.consumer_tag.clone(),
            binding: self.binding.clone(),
            tenants: self.tenants.clone(),
            transport: self.transport.clone(),
            permits: self.permits.clone(),
        }
    }
}

impl<R: TenantStateResolver> Worker<R> {
    /// Consume until the queue cannot be subscribed again. Returns when the
    /// consumer is gone for good.
    async fn run(self, mut stream: DeliveryStream) {
        let mut idle_restarts = 0;

        loop {
            if self.consume(&mut stream).await > 0 {
                idle_restarts = 0;
            } else {
                idle_restarts += 1;
            }
            if idle_restarts >= RESUBSCRIBE_ATTEMPTS {
                error!("Consumer for {} keeps closing, giving up", self.queue);
                return;
            }

            warn!("Consumer stopped for {}, resubscribing", self.queue);
            let consumer_tag = format!("{}-{}", self.consumer_tag, Uuid::new_v4());
            match resubscribe(self.transport.as_ref(), &self.queue, QueueKind::Durable, &consumer_tag).await {
                Ok(next) => stream = next,
                Err(e) => {
                    error!("Consumer for {} gave up: {}", self.queue, e);
                    return;
                }
            }
        }
    }

    /// Dispatch deliveries until the stream ends; returns how many arrived.
    /// The next delivery is only pulled once a handler slot is free.
    async fn consume(&self, stream: &mut DeliveryStream) -> usize {
        let mut received = 0;

        loop {
            let Ok(permit) = self.permits.clone().acquire_owned().await else {
                return received;
            };
            let Some(delivery) = stream.next().await else {
                return received;
            };
            received += 1;

            match delivery {
                Ok(message) => {
                    let worker = self.clone();
                    tokio::spawn(async move {
                        worker.dispatch(message).await;
                        drop(permit);
                    });
                }
                Err(e) => error!("Error receiving message on {}: {}", self.queue, e),
            }
        }
    }

    async fn dispatch(self, message: InboundMessage) {
        let started = Instant::now();

        match &self.binding {
            Binding::Event(_) if message.expects_reply() => {
                warn!("RPC request on fire-and-forget action {}", self.queue);
                self.send_reply(&message, Reply::error("action is fire-and-forget"))
                    .await;
            }
            Binding::Event(handler) => {
                let handler = handler.clone();
                let outcome = self
                    .run_handler(&message.body, |ctx| async move { handler.handle(ctx).await })
                    .await;
                if let Err(e) = outcome {
                    error!("Event handler for {} failed: {}", self.queue, e);
                }
            }
            Binding::Rpc(handler) => {
                let handler = handler.clone();
                let reply = self
                    .run_handler(&message.body, |ctx| async move { handler.handle(ctx).await })
                    .await
                    .unwrap_or_else(|reason| {
                        error!("RPC handler for {} failed: {}", self.queue, reason);
                        Reply::error(reason)
                    });
                self.send_reply(&message, reply).await;
            }
        }

        debug!(
            "Processed message on {} ({}ms)",
            self.queue,
            started.elapsed().as_millis()
        );
    }

    /// Decode, resolve the tenant, run the handler. Every failure, panics
    /// included, comes back as the message for the error reply.
    async fn run_handler<T, F, Fut>(&self, body: &[u8], handler: F) -> std::result::Result<T, String>
    where
        F: FnOnce(HandlerContext<R::State>) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let envelope = Envelope::from_bytes(body).map_err(|e| e.to_string())?;
        let state = self
            .tenants
            .get(&envelope.subdomain)
            .await
            .map_err(|e| e.to_string())?;

        let ctx = HandlerContext {
            subdomain: envelope.subdomain,
            state,
            data: envelope.data,
        };

        match AssertUnwindSafe(handler(ctx)).catch_unwind().await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(panic) => Err(format!("handler panicked: {}", panic_message(&panic))),
        }
    }

    async fn send_reply(&self, request: &InboundMessage, reply: Reply) {
        let (Some(correlation_id), Some(reply_to)) = (request.correlation_id, &request.reply_to) else {
            warn!("Request on {} has no reply address, dropping reply", self.queue);
            return;
        };

        let body = match reply.to_bytes() {
            Ok(body) => body,
            Err(e) => {
                error!("Failed to encode reply for {}: {}", correlation_id, e);
                return;
            }
        };

        if let Err(e) = self
            .transport
            .publish(reply_to, OutboundMessage::reply(body, correlation_id))
            .await
        {
            error!("Failed to send reply for {} to {}: {}", correlation_id, reply_to, e);
        }
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

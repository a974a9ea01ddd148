//! Transport seam between the routing layer and the broker.
//!
//! The routing layer only needs five primitives: declare a queue, publish a
//! message, consume a queue, ask how many consumers a queue has, and report
//! connection health. [`AmqpTransport`] implements them over RabbitMQ,
//! [`MemoryTransport`] inside one process.
//!
//! Delivery is at-most-once: consumers acknowledge on receipt and nothing
//! is redelivered.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use tokio::time::Duration;
use tracing::{info, warn};

use crate::error::Result;
use crate::message::{InboundMessage, OutboundMessage};
use crate::queue::QueueName;

pub mod amqp;
pub mod memory;

pub use amqp::AmqpTransport;
pub use memory::{MemoryBroker, MemoryTransport};

/// How many times [`resubscribe`] tries before giving up
pub const RESUBSCRIBE_ATTEMPTS: u32 = 5;

/// First [`resubscribe`] delay; doubles after every failed attempt
const RESUBSCRIBE_DELAY: Duration = Duration::from_millis(500);

/// Stream of deliveries from one queue
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<InboundMessage>> + Send>>;

/// Lifetime of a declared queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// Action queue shared by every instance of a service
    Durable,
    /// Per-process reply queue, removed with its consumer
    Ephemeral,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Make sure `queue` exists. Idempotent.
    async fn declare_queue(&self, queue: &QueueName, kind: QueueKind) -> Result<()>;

    /// Hand `message` to the broker. Returns once the broker accepted it,
    /// not once a consumer processed it.
    async fn publish(&self, queue: &QueueName, message: OutboundMessage) -> Result<()>;

    /// Start consuming `queue`. Messages are acknowledged on receipt.
    async fn consume(&self, queue: &QueueName, consumer_tag: &str) -> Result<DeliveryStream>;

    /// Number of live consumers on `queue`; zero for an unknown queue.
    async fn consumer_count(&self, queue: &QueueName) -> Result<u32>;

    async fn is_connected(&self) -> bool;
}

/// Declare `queue` again and open a fresh consumer on it, with exponential
/// backoff. Called when a delivery stream ended, typically because the
/// broker connection was lost: a reconnect drops every consumer and deletes
/// ephemeral queues.
pub async fn resubscribe(
    transport: &dyn Transport,
    queue: &QueueName,
    kind: QueueKind,
    consumer_tag: &str,
) -> Result<DeliveryStream> {
    let mut delay = RESUBSCRIBE_DELAY;
    let mut attempt = 1;

    loop {
        tokio::time::sleep(delay).await;

        let subscribed = match transport.declare_queue(queue, kind).await {
            Ok(()) => transport.consume(queue, consumer_tag).await,
            Err(e) => Err(e),
        };

        match subscribed {
            Ok(stream) => {
                info!("🔄 Resubscribed to {} (attempt {})", queue, attempt);
                return Ok(stream);
            }
            Err(e) if attempt < RESUBSCRIBE_ATTEMPTS => {
                warn!(
                    "Resubscribing to {} failed (attempt {}), retrying in {}ms: {}",
                    queue,
                    attempt,
                    delay.as_millis() * 2,
                    e
                );
                attempt += 1;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
}

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::*,
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::{FieldTable, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{DeliveryStream, QueueKind, Transport};
use crate::config::ConnectionConfig;
use crate::error::{BrokerError, Result};
use crate::message::{InboundMessage, OutboundMessage};
use crate::queue::QueueName;

const CHANNEL_POOL_LIMIT: usize = 10;

/// RabbitMQ transport: one connection per process plus a small channel pool.
pub struct AmqpTransport {
    config: ConnectionConfig,
    connection: RwLock<Option<Arc<Connection>>>,
    channels: Mutex<Vec<Channel>>,
}

impl AmqpTransport {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            connection: RwLock::new(None),
            channels: Mutex::new(Vec::new()),
        }
    }

    /// Create the transport and open its connection.
    pub async fn connect_with(config: ConnectionConfig) -> Result<Self> {
        let transport = Self::new(config);
        transport.connect().await?;
        Ok(transport)
    }

    /// Establish connection to RabbitMQ with retry logic
    pub async fn connect(&self) -> Result<()> {
        let mut attempts = 0;

        loop {
            match self.try_connect().await {
                Ok(connection) => {
                    info!("🔗 Connected to RabbitMQ at {}", self.config.url);
                    *self.connection.write().await = Some(Arc::new(connection));
                    return Ok(());
                }
                Err(e) => {
                    attempts += 1;
                    if attempts >= self.config.max_retries {
                        error!("Failed to connect to RabbitMQ after {} attempts: {}", attempts, e);
                        return Err(e);
                    }

                    warn!(
                        "Connection attempt {} failed, retrying in {}ms: {}",
                        attempts, self.config.retry_delay_ms, e
                    );
                    tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
                }
            }
        }
    }

    async fn try_connect(&self) -> Result<Connection> {
        let uri = self.connection_uri();
        debug!("Attempting to connect to {}", self.config.url);

        let properties = ConnectionProperties::default()
            .with_connection_name(format!("pluginbus-{}", Uuid::new_v4()).into());

        let timeout = Duration::from_millis(self.config.connection_timeout_ms);
        match tokio::time::timeout(timeout, Connection::connect(&uri, properties)).await {
            Ok(connection) => Ok(connection?),
            Err(_) => Err(BrokerError::transport_error(format!(
                "connecting to {} timed out after {}ms",
                self.config.url, self.config.connection_timeout_ms
            ))),
        }
    }

    /// Broker URL with the configured heartbeat unless the URL sets one.
    fn connection_uri(&self) -> String {
        let url = &self.config.url;
        if url.contains("heartbeat=") {
            return url.clone();
        }
        let joiner = if url.contains('?') { '&' } else { '?' };
        format!("{}{}heartbeat={}", url, joiner, self.config.heartbeat_seconds)
    }

    async fn get_channel(&self) -> Result<Channel> {
        {
            let mut channels = self.channels.lock().await;
            while let Some(channel) = channels.pop() {
                if channel.status().connected() {
                    return Ok(channel);
                }
            }
        }

        let connection = self.ensure_connected().await?;
        let channel = connection.create_channel().await?;
        channel
            .basic_qos(self.config.prefetch_count, BasicQosOptions::default())
            .await?;

        debug!("Created new channel");
        Ok(channel)
    }

    async fn return_channel(&self, channel: Channel) {
        if channel.status().connected() {
            let mut channels = self.channels.lock().await;
            if channels.len() < CHANNEL_POOL_LIMIT {
                channels.push(channel);
            }
        }
    }

    async fn ensure_connected(&self) -> Result<Arc<Connection>> {
        {
            let guard = self.connection.read().await;
            if let Some(connection) = guard.as_ref() {
                if connection.status().connected() {
                    return Ok(connection.clone());
                }
            }
        }

        warn!("Connection lost, attempting to reconnect");
        self.connect().await?;

        self.connection
            .read()
            .await
            .as_ref()
            .cloned()
            .ok_or_else(|| BrokerError::internal_error("connection missing after connect"))
    }
}

fn to_inbound(delivery: Delivery) -> InboundMessage {
    let correlation_id = delivery
        .properties
        .correlation_id()
        .as_ref()
        .and_then(|id| Uuid::parse_str(id.as_str()).ok());
    let reply_to = delivery
        .properties
        .reply_to()
        .as_ref()
        .and_then(|queue| QueueName::from_wire(queue.as_str()).ok());

    InboundMessage {
        body: delivery.data,
        correlation_id,
        reply_to,
    }
}

/// Acknowledge on receipt, before the handler runs. Deliveries the
/// consumer has not pulled yet stay unacked, so `basic_qos` prefetch bounds
/// them.
async fn accept(delivery: std::result::Result<Delivery, lapin::Error>) -> Result<InboundMessage> {
    let delivery = delivery?;
    delivery.ack(BasicAckOptions::default()).await?;
    Ok(to_inbound(delivery))
}

/// A passive declare of a missing queue fails with 404 NOT_FOUND
fn is_missing_queue(error: &lapin::Error) -> bool {
    matches!(
        error,
        lapin::Error::ProtocolError(e) if matches!(e.kind(), AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND))
    )
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn declare_queue(&self, queue: &QueueName, kind: QueueKind) -> Result<()> {
        let channel = self.get_channel().await?;

        let options = match kind {
            QueueKind::Durable => QueueDeclareOptions {
                durable: true,
                exclusive: false,
                auto_delete: false,
                ..Default::default()
            },
            QueueKind::Ephemeral => QueueDeclareOptions {
                durable: false,
                exclusive: true,
                auto_delete: true,
                ..Default::default()
            },
        };
        channel
            .queue_declare(queue.as_str(), options, FieldTable::default())
            .await?;

        self.return_channel(channel).await;
        debug!("Declared queue: {} ({:?})", queue, kind);
        Ok(())
    }

    async fn publish(&self, queue: &QueueName, message: OutboundMessage) -> Result<()> {
        let channel = self.get_channel().await?;

        let mut properties =
            BasicProperties::default().with_content_type(ShortString::from("application/json"));
        if let Some(correlation_id) = message.correlation_id {
            properties = properties.with_correlation_id(correlation_id.to_string().into());
        }
        if let Some(reply_to) = &message.reply_to {
            properties = properties.with_reply_to(reply_to.as_str().into());
        }

        channel
            .basic_publish(
                "",
                queue.as_str(),
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await?
            .await?;

        self.return_channel(channel).await;
        debug!("Published message to queue: {}", queue);
        Ok(())
    }

    async fn consume(&self, queue: &QueueName, consumer_tag: &str) -> Result<DeliveryStream> {
        let channel = self.get_channel().await?;

        let consumer = channel
            .basic_consume(
                queue.as_str(),
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    exclusive: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        debug!("Created consumer {} for queue: {}", consumer_tag, queue);
        Ok(Box::pin(consumer.then(accept)))
    }

    async fn consumer_count(&self, queue: &QueueName) -> Result<u32> {
        let channel = self.get_channel().await?;

        let declared = channel
            .queue_declare(
                queue.as_str(),
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await;

        match declared {
            Ok(declared) => {
                self.return_channel(channel).await;
                Ok(declared.consumer_count())
            }
            Err(e) if is_missing_queue(&e) => {
                debug!("Queue {} not declared: {}", queue, e);
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn is_connected(&self) -> bool {
        self.connection
            .read()
            .await
            .as_ref()
            .map(|connection| connection.status().connected())
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for AmqpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpTransport")
            .field("config", &self.config)
            .finish()
    }
}

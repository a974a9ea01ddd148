use std::sync::Arc;

use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{BrokerError, Result};
use crate::message::{Envelope, OutboundMessage, Reply};
use crate::pending::PendingCalls;
use crate::queue::QueueName;
use crate::transport::{resubscribe, DeliveryStream, QueueKind, Transport, RESUBSCRIBE_ATTEMPTS};

/// The process-wide publisher.
///
/// Owns the private reply queue and the pending-call table, and offers the
/// two publishing primitives everything else is built on.
pub struct TransportClient {
    transport: Arc<dyn Transport>,
    pending: Arc<PendingCalls>,
    reply_queue: QueueName,
    client_name: String,
    reply_processor: JoinHandle<()>,
}

impl TransportClient {
    /// Declare the reply queue and start consuming it.
    pub async fn new(client_name: impl Into<String>, transport: Arc<dyn Transport>) -> Result<Self> {
        let client_name = client_name.into();
        info!("🔗 Creating transport client: {}", client_name);

        let reply_queue = QueueName::reply_queue(&client_name)?;
        transport.declare_queue(&reply_queue, QueueKind::Ephemeral).await?;

        let pending = Arc::new(PendingCalls::new());
        let reply_processor =
            Self::start_reply_processor(&client_name, &reply_queue, transport.clone(), pending.clone())
                .await?;

        info!("✅ Transport client ready: {} (replies on {})", client_name, reply_queue);
        Ok(Self {
            transport,
            pending,
            reply_queue,
            client_name,
            reply_processor,
        })
    }

    /// Fire-and-forget publish. Returns once the transport accepted it.
    pub async fn publish<T: Serialize>(&self, queue: &QueueName, envelope: &Envelope<T>) -> Result<()> {
        let body = envelope.to_bytes()?;
        self.transport.publish(queue, OutboundMessage::event(body)).await?;

        debug!("Published event to {} for {}", queue, envelope.subdomain);
        Ok(())
    }

    /// Publish and suspend until the correlated reply arrives or `timeout`
    /// elapses. The deadline covers the whole call: consumer probe, publish
    /// (including any reconnect) and the reply wait. Transport failures
    /// surface as [`BrokerError::Timeout`].
    pub async fn publish_and_wait<T: Serialize>(
        &self,
        queue: &QueueName,
        envelope: &Envelope<T>,
        timeout: Duration,
    ) -> Result<Reply> {
        let body = envelope.to_bytes()?;
        let timeout_ms = timeout.as_millis() as u64;
        let deadline = Instant::now() + timeout;

        let (correlation_id, reply_rx) = self.pending.register(timeout).await;
        let request = self.request(queue, body, correlation_id, reply_rx, timeout_ms);

        match tokio::time::timeout_at(deadline, request).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => {
                self.pending.cancel(correlation_id).await;
                Err(e)
            }
            Err(_) => {
                self.pending.cancel(correlation_id).await;
                debug!("RPC to {} timed out (correlation_id: {})", queue, correlation_id);
                Err(BrokerError::Timeout { timeout_ms })
            }
        }
    }

    async fn request(
        &self,
        queue: &QueueName,
        body: Vec<u8>,
        correlation_id: Uuid,
        reply_rx: oneshot::Receiver<Reply>,
        timeout_ms: u64,
    ) -> Result<Reply> {
        match self.transport.consumer_count(queue).await {
            Ok(0) => {
                return Err(BrokerError::NoConsumer {
                    queue: queue.to_string(),
                })
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Transport failure probing {}: {}", queue, e);
                return Err(BrokerError::Timeout { timeout_ms });
            }
        }

        let message = OutboundMessage::request(body, correlation_id, self.reply_queue.clone());
        if let Err(e) = self.transport.publish(queue, message).await {
            warn!("Transport failure publishing to {}: {}", queue, e);
            return Err(BrokerError::Timeout { timeout_ms });
        }

        debug!(
            "Sent RPC request to {} (correlation_id: {})",
            queue, correlation_id
        );

        // closed when the sweep evicted the call
        reply_rx.await.map_err(|_| BrokerError::Timeout { timeout_ms })
    }

    /// Consume the reply queue for the life of the client. When the stream
    /// ends (lost connection), the queue is declared again and consumed
    /// anew.
    async fn start_reply_processor(
        client_name: &str,
        reply_queue: &QueueName,
        transport: Arc<dyn Transport>,
        pending: Arc<PendingCalls>,
    ) -> Result<JoinHandle<()>> {
        let consumer_tag = format!("{}-replies", client_name);
        let mut stream = transport.consume(reply_queue, &consumer_tag).await?;
        let client_name = client_name.to_string();
        let reply_queue = reply_queue.clone();

        Ok(tokio::spawn(async move {
            debug!("📤 Reply processor started for client: {}", client_name);
            let mut idle_restarts = 0;

            loop {
                if Self::process_replies(&mut stream, &pending).await > 0 {
                    idle_restarts = 0;
                } else {
                    idle_restarts += 1;
                }
                if idle_restarts >= RESUBSCRIBE_ATTEMPTS {
                    error!("Reply queue {} keeps closing, giving up", reply_queue);
                    return;
                }

                warn!("Reply processor stopped for client: {}, resubscribing", client_name);
                let consumer_tag = format!("{}-replies-{}", client_name, Uuid::new_v4());
                match resubscribe(transport.as_ref(), &reply_queue, QueueKind::Ephemeral, &consumer_tag).await {
                    Ok(next) => stream = next,
                    Err(e) => {
                        error!("Reply processor for {} gave up: {}", client_name, e);
                        return;
                    }
                }
            }
        }))
    }

    /// Completes pending calls until the stream ends. Returns how many
    /// deliveries arrived.
    async fn process_replies(stream: &mut DeliveryStream, pending: &PendingCalls) -> usize {
        let mut received = 0;

        while let Some(delivery) = stream.next().await {
            received += 1;
            let message = match delivery {
                Ok(message) => message,
                Err(e) => {
                    error!("Error receiving reply: {}", e);
                    continue;
                }
            };

            let Some(correlation_id) = message.correlation_id else {
                warn!("Dropping reply without correlation id");
                continue;
            };

            let reply = Reply::from_bytes(&message.body).unwrap_or_else(|e| {
                error!("Malformed reply for {}: {}", correlation_id, e);
                Reply::error(format!("malformed reply: {}", e))
            });

            if !pending.complete(correlation_id, reply).await {
                warn!("Discarding late reply for correlation_id: {}", correlation_id);
            }
        }
        received
    }

    pub async fn evict_expired_calls(&self) -> usize {
        self.pending.evict_expired().await
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn reply_queue(&self) -> &QueueName {
        &self.reply_queue
    }

    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    pub async fn is_healthy(&self) -> bool {
        self.transport.is_connected().await && !self.reply_processor.is_finished()
    }

    pub async fn get_stats(&self) -> ClientStats {
        ClientStats {
            client_name: self.client_name.clone(),
            reply_queue: self.reply_queue.to_string(),
            pending_calls: self.pending.len().await,
            is_connected: self.transport.is_connected().await,
        }
    }
}

impl Drop for TransportClient {
    fn drop(&mut self) {
        self.reply_processor.abort();
    }
}

impl std::fmt::Debug for TransportClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportClient")
            .field("client_name", &self.client_name)
            .field("reply_queue", &self.reply_queue)
            .finish()
    }
}

/// Client statistics for monitoring
#[derive(Debug, Clone, Serialize)]
pub struct ClientStats {
    pub client_name: String,
    pub reply_queue: String,
    pub pending_calls: usize,
    pub is_connected: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::InboundMessage;
    use crate::queue::queue_name_for;
    use crate::transport::MemoryBroker;
    use serde_json::json;

    async fn echo_consumer(broker: &MemoryBroker, queue: &QueueName) {
        let transport = broker.transport();
        transport.declare_queue(queue, QueueKind::Durable).await.unwrap();
        let mut stream = transport.consume(queue, "echo").await.unwrap();

        tokio::spawn(async move {
            while let Some(Ok(InboundMessage { body, correlation_id: Some(id), reply_to: Some(reply_to) })) =
                stream.next().await
            {
                let envelope = Envelope::from_bytes(&body).unwrap();
                let reply = Reply::success(envelope.data).unwrap();
                transport
                    .publish(&reply_to, OutboundMessage::reply(reply.to_bytes().unwrap(), id))
                    .await
                    .unwrap();
            }
        });
    }

    #[tokio::test]
    async fn test_publish_and_wait_round_trip() {
        let broker = MemoryBroker::new();
        let queue = queue_name_for("core", "echo").unwrap();
        echo_consumer(&broker, &queue).await;

        let client = TransportClient::new("cards", Arc::new(broker.transport())).await.unwrap();
        let envelope = Envelope::new("acme", json!({ "n": 1 })).unwrap();
        let reply = client
            .publish_and_wait(&queue, &envelope, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(reply, Reply::Success { data: json!({ "n": 1 }) });
        assert_eq!(client.get_stats().await.pending_calls, 0);
    }

    #[tokio::test]
    async fn test_no_consumer() {
        let broker = MemoryBroker::new();
        let client = TransportClient::new("cards", Arc::new(broker.transport())).await.unwrap();
        let queue = queue_name_for("core", "missing").unwrap();
        let envelope = Envelope::new("acme", ()).unwrap();

        let err = client
            .publish_and_wait(&queue, &envelope, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::NoConsumer { .. }));
    }

    #[tokio::test]
    async fn test_transport_failure_surfaces_as_timeout() {
        let broker = MemoryBroker::new();
        let queue = queue_name_for("core", "echo").unwrap();
        echo_consumer(&broker, &queue).await;

        let transport = broker.transport();
        let client = TransportClient::new("cards", Arc::new(transport.clone())).await.unwrap();
        transport.disconnect();

        let envelope = Envelope::new("acme", ()).unwrap();
        let err = client
            .publish_and_wait(&queue, &envelope, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Timeout { timeout_ms: 200 }));
        assert!(!client.is_healthy().await);
    }

    /// Memory transport whose consumer probe hangs, like a reconnect loop
    struct SlowProbe {
        inner: crate::transport::MemoryTransport,
    }

    #[async_trait::async_trait]
    impl Transport for SlowProbe {
        async fn declare_queue(&self, queue: &QueueName, kind: QueueKind) -> Result<()> {
            self.inner.declare_queue(queue, kind).await
        }

        async fn publish(&self, queue: &QueueName, message: OutboundMessage) -> Result<()> {
            self.inner.publish(queue, message).await
        }

        async fn consume(&self, queue: &QueueName, consumer_tag: &str) -> Result<DeliveryStream> {
            self.inner.consume(queue, consumer_tag).await
        }

        async fn consumer_count(&self, _queue: &QueueName) -> Result<u32> {
            tokio::time::sleep(Duration::from_secs(3)).await;
            Err(BrokerError::transport_error("connection refused"))
        }

        async fn is_connected(&self) -> bool {
            false
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_covers_consumer_probe() {
        let broker = MemoryBroker::new();
        let transport = SlowProbe {
            inner: broker.transport(),
        };
        let client = TransportClient::new("cards", Arc::new(transport)).await.unwrap();
        let queue = queue_name_for("core", "echo").unwrap();
        let envelope = Envelope::new("acme", ()).unwrap();

        let started = Instant::now();
        let err = client
            .publish_and_wait(&queue, &envelope, Duration::from_millis(100))
            .await
            .unwrap_err();

        assert!(matches!(err, BrokerError::Timeout { timeout_ms: 100 }));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(client.get_stats().await.pending_calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_queue_survives_lost_connection() {
        let broker = MemoryBroker::new();
        let queue = queue_name_for("core", "echo").unwrap();
        echo_consumer(&broker, &queue).await;

        let transport = broker.transport();
        let client = TransportClient::new("cards", Arc::new(transport.clone())).await.unwrap();
        transport.sever().await;
        assert!(!broker.queue_names().await.contains(client.reply_queue()));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(broker.queue_names().await.contains(client.reply_queue()));

        let envelope = Envelope::new("acme", json!({ "n": 2 })).unwrap();
        let reply = client
            .publish_and_wait(&queue, &envelope, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(reply, Reply::Success { data: json!({ "n": 2 }) });
        assert!(client.is_healthy().await);
    }

    #[tokio::test]
    async fn test_publish_without_consumer_does_not_fail() {
        let broker = MemoryBroker::new();
        let client = TransportClient::new("cards", Arc::new(broker.transport())).await.unwrap();
        let queue = queue_name_for("core", "afterMutation").unwrap();

        let envelope = Envelope::new("acme", json!({ "type": "deal" })).unwrap();
        client.publish(&queue, &envelope).await.unwrap();
    }
}

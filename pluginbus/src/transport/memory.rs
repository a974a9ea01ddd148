use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;
use uuid::Uuid;

use super::{DeliveryStream, QueueKind, Transport};
use crate::error::{BrokerError, Result};
use crate::message::{InboundMessage, OutboundMessage};
use crate::queue::QueueName;

struct ConsumerSlot {
    tag: String,
    connection: Uuid,
    tx: mpsc::UnboundedSender<InboundMessage>,
}

struct QueueState {
    kind: QueueKind,
    /// Connection an ephemeral queue is exclusive to
    owner: Option<Uuid>,
    consumers: Vec<ConsumerSlot>,
    next: usize,
    /// Messages published while nobody consumed the queue
    backlog: VecDeque<InboundMessage>,
}

impl QueueState {
    fn new(kind: QueueKind, owner: Option<Uuid>) -> Self {
        Self {
            kind,
            owner,
            consumers: Vec::new(),
            next: 0,
            backlog: VecDeque::new(),
        }
    }

    fn prune(&mut self) {
        self.consumers.retain(|slot| !slot.tx.is_closed());
    }

    /// Round-robin delivery; hands the message back when nobody took it.
    fn deliver(&mut self, mut message: InboundMessage) -> Option<InboundMessage> {
        for _ in 0..self.consumers.len() {
            let index = self.next % self.consumers.len();
            self.next = self.next.wrapping_add(1);
            match self.consumers[index].tx.send(message) {
                Ok(()) => return None,
                Err(mpsc::error::SendError(returned)) => message = returned,
            }
        }
        Some(message)
    }
}

/// In-process broker with AMQP default-exchange semantics.
///
/// Cloning shares the same queues, so several plugins built on
/// [`MemoryTransport`]s of one broker talk to each other as if they were
/// separate processes.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    queues: Arc<Mutex<HashMap<QueueName, QueueState>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A connection to this broker
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            broker: self.clone(),
            id: Uuid::new_v4(),
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    pub async fn queue_names(&self) -> Vec<QueueName> {
        self.queues.lock().await.keys().cloned().collect()
    }

    /// Messages waiting in `queue` for a consumer
    pub async fn backlog_len(&self, queue: &QueueName) -> usize {
        self.queues
            .lock()
            .await
            .get(queue)
            .map(|state| state.backlog.len())
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker").finish_non_exhaustive()
    }
}

/// One process's connection to a [`MemoryBroker`]
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    broker: MemoryBroker,
    id: Uuid,
    connected: Arc<AtomicBool>,
}

impl MemoryTransport {
    /// Simulate a dropped connection: every operation fails until
    /// [`reconnect`](Self::reconnect).
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn reconnect(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    /// Simulate the broker closing this connection: every consumer opened
    /// through it ends and its ephemeral queues are deleted.
    pub async fn sever(&self) {
        let mut queues = self.broker.queues.lock().await;
        queues.retain(|_, state| state.owner != Some(self.id));
        for state in queues.values_mut() {
            state.consumers.retain(|slot| slot.connection != self.id);
        }
        debug!("Severed in-memory connection {}", self.id);
    }

    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::transport_error("in-memory connection is closed"))
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn declare_queue(&self, queue: &QueueName, kind: QueueKind) -> Result<()> {
        self.ensure_connected()?;
        self.broker
            .queues
            .lock()
            .await
            .entry(queue.clone())
            .or_insert_with(|| {
                let owner = (kind == QueueKind::Ephemeral).then_some(self.id);
                QueueState::new(kind, owner)
            });
        Ok(())
    }

    async fn publish(&self, queue: &QueueName, message: OutboundMessage) -> Result<()> {
        self.ensure_connected()?;
        let mut queues = self.broker.queues.lock().await;

        let Some(state) = queues.get_mut(queue) else {
            debug!("Dropping message for undeclared queue: {}", queue);
            return Ok(());
        };

        state.prune();
        if let Some(undelivered) = state.deliver(message.into()) {
            state.backlog.push_back(undelivered);
        }
        Ok(())
    }

    async fn consume(&self, queue: &QueueName, consumer_tag: &str) -> Result<DeliveryStream> {
        self.ensure_connected()?;
        let mut queues = self.broker.queues.lock().await;

        let state = queues.get_mut(queue).ok_or_else(|| {
            BrokerError::transport_error(format!("queue '{}' is not declared", queue))
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        while let Some(message) = state.backlog.pop_front() {
            // rx is alive, send cannot fail
            let _ = tx.send(message);
        }
        state.consumers.push(ConsumerSlot {
            tag: consumer_tag.to_string(),
            connection: self.id,
            tx,
        });
        debug!("Created consumer {} for queue: {}", consumer_tag, queue);

        let connected = self.connected.clone();
        Ok(Box::pin(futures_util::stream::unfold(
            (rx, connected),
            |(mut rx, connected)| async move {
                let message = rx.recv().await?;
                let item = if connected.load(Ordering::SeqCst) {
                    Ok(message)
                } else {
                    Err(BrokerError::transport_error("in-memory connection is closed"))
                };
                Some((item, (rx, connected)))
            },
        )))
    }

    async fn consumer_count(&self, queue: &QueueName) -> Result<u32> {
        self.ensure_connected()?;
        let mut queues = self.broker.queues.lock().await;

        let Some(state) = queues.get_mut(queue) else {
            return Ok(0);
        };
        state.prune();
        let count = state.consumers.len();

        if count == 0 && state.kind == QueueKind::Ephemeral {
            queues.remove(queue);
        } else if count > 0 {
            debug!(
                "Queue {} consumers: {:?}",
                queue,
                state.consumers.iter().map(|slot| slot.tag.as_str()).collect::<Vec<_>>()
            );
        }
        Ok(count as u32)
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

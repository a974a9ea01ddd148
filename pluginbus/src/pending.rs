use std::collections::HashMap;

use tokio::sync::{oneshot, Mutex};
use tokio::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

use crate::message::Reply;

/// A caller suspended in `publish_and_wait`
#[derive(Debug)]
struct PendingCall {
    reply_tx: oneshot::Sender<Reply>,
    deadline: Instant,
}

/// Correlation id -> waiting caller.
///
/// Each entry is completed at most once: by a reply, by its caller giving
/// up, or by [`evict_expired`](Self::evict_expired). A reply that finds no
/// entry is late and gets discarded.
#[derive(Debug, Default)]
pub struct PendingCalls {
    calls: Mutex<HashMap<Uuid, PendingCall>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a correlation id for a call that waits at most `timeout`.
    pub async fn register(&self, timeout: Duration) -> (Uuid, oneshot::Receiver<Reply>) {
        let (reply_tx, reply_rx) = oneshot::channel();
        let correlation_id = Uuid::new_v4();

        self.calls.lock().await.insert(
            correlation_id,
            PendingCall {
                reply_tx,
                deadline: Instant::now() + timeout,
            },
        );
        (correlation_id, reply_rx)
    }

    /// Hand `reply` to its caller. Returns false for a late or unknown reply.
    pub async fn complete(&self, correlation_id: Uuid, reply: Reply) -> bool {
        let pending = self.calls.lock().await.remove(&correlation_id);

        match pending {
            Some(call) => call.reply_tx.send(reply).is_ok(),
            None => false,
        }
    }

    /// Forget a call whose caller stopped waiting.
    pub async fn cancel(&self, correlation_id: Uuid) -> bool {
        self.calls.lock().await.remove(&correlation_id).is_some()
    }

    /// Drop every entry past its deadline; their receivers observe a
    /// closed channel. Returns how many were evicted.
    pub async fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut calls = self.calls.lock().await;

        let before = calls.len();
        calls.retain(|id, call| {
            let keep = call.deadline > now && !call.reply_tx.is_closed();
            if !keep {
                debug!("Evicted expired call: {}", id);
            }
            keep
        });
        before - calls.len()
    }

    pub async fn len(&self) -> usize {
        self.calls.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.calls.lock().await.is_empty()
    }
}

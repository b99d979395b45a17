//! # Durable Queue Abstraction
//!
//! Lease-based, at-least-once delivery. A leased message is invisible to
//! other consumers until it is acked or its lease expires; acking an
//! unknown or already-acked message succeeds (idempotent).

use super::errors::MessagingError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// A message leased from a queue.
#[derive(Debug, Clone)]
pub struct LeasedMessage {
    pub id: i64,
    pub read_count: i32,
    pub enqueued_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// Queue statistics for monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub queue_name: String,
    pub message_count: i64,
}

/// Durable, named-queue messaging surface.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Create the queue if it does not exist.
    async fn create_queue(&self, queue: &str) -> Result<(), MessagingError>;

    /// Enqueue a payload; returns the message identifier.
    async fn publish(&self, queue: &str, payload: &serde_json::Value)
        -> Result<i64, MessagingError>;

    /// Lease up to `limit` undelivered messages for `lease`.
    async fn read_messages(
        &self,
        queue: &str,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<LeasedMessage>, MessagingError>;

    /// Mark a message delivered. Idempotent: unknown ids succeed.
    async fn ack(&self, queue: &str, message_id: i64) -> Result<(), MessagingError>;

    /// Delete all messages; returns how many were removed.
    async fn purge_queue(&self, queue: &str) -> Result<u64, MessagingError>;

    async fn queue_metrics(&self, queue: &str) -> Result<QueueMetrics, MessagingError>;

    /// Wake handle signaled on publish, when the implementation has one.
    /// Purely a latency optimization; consumers must keep polling.
    fn waker(&self) -> Option<Arc<Notify>> {
        None
    }
}

#[derive(Debug, Clone)]
struct StoredMessage {
    id: i64,
    read_count: i32,
    enqueued_at: DateTime<Utc>,
    leased_until: Option<Instant>,
    payload: serde_json::Value,
}

/// In-memory queue with the same lease semantics as the durable
/// implementation. Backs tests and embedded single-process deployments.
#[derive(Debug, Default, Clone)]
pub struct InMemoryQueue {
    queues: Arc<Mutex<HashMap<String, Vec<StoredMessage>>>>,
    next_id: Arc<AtomicI64>,
    waker: Arc<Notify>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self {
            queues: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicI64::new(1)),
            waker: Arc::new(Notify::new()),
        }
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    async fn create_queue(&self, queue: &str) -> Result<(), MessagingError> {
        self.queues.lock().entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        payload: &serde_json::Value,
    ) -> Result<i64, MessagingError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.queues
            .lock()
            .entry(queue.to_string())
            .or_default()
            .push(StoredMessage {
                id,
                read_count: 0,
                enqueued_at: Utc::now(),
                leased_until: None,
                payload: payload.clone(),
            });
        self.waker.notify_waiters();
        Ok(id)
    }

    async fn read_messages(
        &self,
        queue: &str,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<LeasedMessage>, MessagingError> {
        let now = Instant::now();
        let mut queues = self.queues.lock();
        let Some(messages) = queues.get_mut(queue) else {
            return Ok(Vec::new());
        };

        let mut leased = Vec::new();
        for message in messages.iter_mut() {
            if leased.len() >= limit {
                break;
            }
            let visible = message.leased_until.map_or(true, |until| until <= now);
            if visible {
                message.leased_until = Some(now + lease);
                message.read_count += 1;
                leased.push(LeasedMessage {
                    id: message.id,
                    read_count: message.read_count,
                    enqueued_at: message.enqueued_at,
                    payload: message.payload.clone(),
                });
            }
        }
        Ok(leased)
    }

    async fn ack(&self, queue: &str, message_id: i64) -> Result<(), MessagingError> {
        if let Some(messages) = self.queues.lock().get_mut(queue) {
            messages.retain(|m| m.id != message_id);
        }
        Ok(())
    }

    async fn purge_queue(&self, queue: &str) -> Result<u64, MessagingError> {
        let mut queues = self.queues.lock();
        let Some(messages) = queues.get_mut(queue) else {
            return Ok(0);
        };
        let purged = messages.len() as u64;
        messages.clear();
        Ok(purged)
    }

    async fn queue_metrics(&self, queue: &str) -> Result<QueueMetrics, MessagingError> {
        let count = self
            .queues
            .lock()
            .get(queue)
            .map(|m| m.len() as i64)
            .unwrap_or(0);
        Ok(QueueMetrics {
            queue_name: queue.to_string(),
            message_count: count,
        })
    }

    fn waker(&self) -> Option<Arc<Notify>> {
        Some(Arc::clone(&self.waker))
    }
}

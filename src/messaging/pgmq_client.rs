//! # PostgreSQL Message Queue Client
//!
//! Durable queue implementation on the pgmq extension via the pgmq-rs
//! crate. The visibility timeout is the lease: a read message stays
//! invisible to other consumers until deleted or the timeout elapses.

use super::errors::MessagingError;
use super::queue::{LeasedMessage, MessageQueue, QueueMetrics};
use crate::constants::queues;
use async_trait::async_trait;
use pgmq::PGMQueue;
use std::time::Duration;
use tracing::{debug, info};

/// pgmq-backed implementation of [`MessageQueue`].
#[derive(Debug, Clone)]
pub struct PgmqClient {
    pgmq: PGMQueue,
}

impl PgmqClient {
    /// Connect using a database URL.
    pub async fn new(database_url: &str) -> Result<Self, MessagingError> {
        let pgmq = PGMQueue::new(database_url.to_string())
            .await
            .map_err(|e| MessagingError::connection(e.to_string()))?;
        info!("connected to pgmq");
        Ok(Self { pgmq })
    }

    /// Reuse an existing connection pool.
    pub async fn new_with_pool(pool: sqlx::PgPool) -> Self {
        let pgmq = PGMQueue::new_with_pool(pool).await;
        Self { pgmq }
    }

    pub fn pool(&self) -> &sqlx::PgPool {
        &self.pgmq.connection
    }

    /// Create the well-known channel queues the engine and its external
    /// collaborators communicate over.
    pub async fn initialize_channel_queues(&self) -> Result<(), MessagingError> {
        for queue in [
            queues::TASK_REQUESTS,
            queues::DECOMPOSITION_REQUESTS,
            queues::APPROVAL_REQUESTS,
            queues::APPROVAL_DECISIONS,
            queues::RULE_UPDATES,
        ] {
            self.create_queue(queue).await?;
        }
        info!("channel queues initialized");
        Ok(())
    }
}

#[async_trait]
impl MessageQueue for PgmqClient {
    async fn create_queue(&self, queue: &str) -> Result<(), MessagingError> {
        debug!(queue = queue, "creating queue");
        self.pgmq
            .create(queue)
            .await
            .map_err(|e| MessagingError::queue_operation(queue, "create", e.to_string()))
    }

    async fn publish(
        &self,
        queue: &str,
        payload: &serde_json::Value,
    ) -> Result<i64, MessagingError> {
        let message_id = self
            .pgmq
            .send(queue, payload)
            .await
            .map_err(|e| MessagingError::queue_operation(queue, "send", e.to_string()))?;
        debug!(queue = queue, message_id = message_id, "message published");
        Ok(message_id)
    }

    async fn read_messages(
        &self,
        queue: &str,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<LeasedMessage>, MessagingError> {
        let vt = lease.as_secs().max(1) as i32;
        let messages = self
            .pgmq
            .read_batch::<serde_json::Value>(queue, Some(vt), limit as i32)
            .await
            .map_err(|e| MessagingError::queue_operation(queue, "read", e.to_string()))?
            .unwrap_or_default();

        Ok(messages
            .into_iter()
            .map(|m| LeasedMessage {
                id: m.msg_id,
                read_count: m.read_ct,
                enqueued_at: m.enqueued_at,
                payload: m.message,
            })
            .collect())
    }

    async fn ack(&self, queue: &str, message_id: i64) -> Result<(), MessagingError> {
        // Deleting a message that no longer exists is a no-op in pgmq,
        // which gives us idempotent acks for free.
        self.pgmq
            .delete(queue, message_id)
            .await
            .map_err(|e| MessagingError::queue_operation(queue, "delete", e.to_string()))?;
        Ok(())
    }

    async fn purge_queue(&self, queue: &str) -> Result<u64, MessagingError> {
        self.pgmq
            .purge(queue)
            .await
            .map_err(|e| MessagingError::queue_operation(queue, "purge", e.to_string()))
    }

    async fn queue_metrics(&self, queue: &str) -> Result<QueueMetrics, MessagingError> {
        let row: (i64,) = sqlx::query_as("SELECT queue_length FROM pgmq.metrics($1)")
            .bind(queue)
            .fetch_one(&self.pgmq.connection)
            .await
            .map_err(|e| MessagingError::queue_operation(queue, "metrics", e.to_string()))?;

        Ok(QueueMetrics {
            queue_name: queue.to_string(),
            message_count: row.0,
        })
    }
}

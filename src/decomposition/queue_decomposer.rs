//! # Externally-Assisted Decomposer
//!
//! Delegates goal decomposition to an external planner over the durable
//! queue: publishes the goal with a correlation id and a per-request reply
//! queue, then waits for the planner's task list, bounded by a timeout.

use super::Decomposer;
use crate::constants::queues;
use crate::error::{EngineError, Result};
use crate::messaging::{
    DecompositionReply, DecompositionRequest, Envelope, MessageQueue, MessagingError,
};
use crate::models::TaskDescriptor;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

pub struct QueueDecomposer {
    queue: Arc<dyn MessageQueue>,
    request_queue: String,
    timeout: Duration,
    poll_interval: Duration,
}

impl QueueDecomposer {
    pub fn new(queue: Arc<dyn MessageQueue>, timeout: Duration) -> Self {
        Self {
            queue,
            request_queue: queues::DECOMPOSITION_REQUESTS.to_string(),
            timeout,
            poll_interval: Duration::from_millis(50),
        }
    }

    pub fn with_request_queue(mut self, request_queue: impl Into<String>) -> Self {
        self.request_queue = request_queue.into();
        self
    }
}

#[async_trait]
impl Decomposer for QueueDecomposer {
    fn name(&self) -> &str {
        "external"
    }

    async fn decompose(&self, goal: &str) -> Result<Vec<TaskDescriptor>> {
        let reply_queue = format!("taskweave_decomp_replies_{}", Uuid::new_v4().simple());
        self.queue.create_queue(&self.request_queue).await?;
        self.queue.create_queue(&reply_queue).await?;

        let envelope = Envelope::wrap(&DecompositionRequest {
            goal: goal.to_string(),
            max_depth: 0,
        })?
        .with_response_queue(reply_queue.clone());
        let correlation_id = envelope.correlation_id.clone();

        self.queue
            .publish(&self.request_queue, &envelope.to_value()?)
            .await?;
        debug!(correlation_id = %correlation_id, "decomposition request published");

        let deadline = Instant::now() + self.timeout;
        loop {
            let messages = self
                .queue
                .read_messages(&reply_queue, Duration::from_secs(5), 1)
                .await?;
            for message in messages {
                self.queue.ack(&reply_queue, message.id).await?;
                let envelope = Envelope::from_value(&message.payload)?;
                if envelope.correlation_id != correlation_id {
                    // Stale reply from an abandoned request; drop it.
                    continue;
                }
                let reply: DecompositionReply = envelope.open()?;
                if let Some(error) = reply.error {
                    return Err(EngineError::validation(format!(
                        "external planner rejected goal: {error}"
                    )));
                }
                return Ok(reply.tasks);
            }

            if Instant::now() >= deadline {
                return Err(EngineError::Messaging(MessagingError::Timeout {
                    queue_name: reply_queue,
                    timeout_seconds: self.timeout.as_secs(),
                }));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

//! # Queue Worker
//!
//! Leases step requests from the task-request queue, executes the bound
//! handler under the per-attempt timeout, publishes the outcome to the
//! request's reply queue, then acks. Workers hold no state of their own;
//! any number of instances may run against the same queue, and a worker
//! that dies mid-task simply leaves its message to be reclaimed after
//! lease expiry.

use crate::constants::{defaults, queues};
use crate::messaging::{Envelope, FailureInfo, MessageQueue, StepOutcome, StepRequest};
use crate::orchestration::handler::{HandlerRegistry, StepOutput};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub request_queue: String,
    pub lease: Duration,
    pub batch_size: usize,
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            request_queue: queues::TASK_REQUESTS.to_string(),
            lease: Duration::from_secs(defaults::LEASE_SECONDS),
            batch_size: defaults::QUEUE_BATCH_SIZE,
            poll_interval: Duration::from_millis(defaults::POLL_INTERVAL_MS),
        }
    }
}

pub struct QueueWorker {
    queue: Arc<dyn MessageQueue>,
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
}

impl QueueWorker {
    pub fn new(queue: Arc<dyn MessageQueue>, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            queue,
            registry,
            config: WorkerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Run until cancelled, processing requests as they arrive.
    pub async fn run(&self, cancel: CancellationToken) {
        let waker = self.queue.waker();
        if let Err(e) = self.queue.create_queue(&self.config.request_queue).await {
            error!(error = %e, "worker could not ensure request queue");
        }
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let drained = match self
                .queue
                .read_messages(
                    &self.config.request_queue,
                    self.config.lease,
                    self.config.batch_size,
                )
                .await
            {
                Ok(messages) => {
                    let count = messages.len();
                    for message in messages {
                        self.process_message(message.id, &message.payload).await;
                    }
                    count
                }
                Err(e) => {
                    warn!(error = %e, "worker read failed; backing off");
                    0
                }
            };

            if drained == 0 {
                match &waker {
                    Some(waker) => {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = waker.notified() => {}
                            _ = tokio::time::sleep(self.config.poll_interval) => {}
                        }
                    }
                    None => {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(self.config.poll_interval) => {}
                        }
                    }
                }
            }
        }
        debug!("worker stopped");
    }

    /// Spawn the worker loop onto the runtime.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    async fn process_message(&self, message_id: i64, payload: &serde_json::Value) {
        let envelope = match Envelope::from_value(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                // Malformed payloads would poison the queue; drop them.
                error!(message_id = message_id, error = %e, "dropping malformed request");
                let _ = self.queue.ack(&self.config.request_queue, message_id).await;
                return;
            }
        };
        let Some(reply_queue) = envelope.response_queue.clone() else {
            error!(message_id = message_id, "request without reply queue; dropping");
            let _ = self.queue.ack(&self.config.request_queue, message_id).await;
            return;
        };
        let request: StepRequest = match envelope.open() {
            Ok(request) => request,
            Err(e) => {
                error!(message_id = message_id, error = %e, "dropping undecodable request");
                let _ = self.queue.ack(&self.config.request_queue, message_id).await;
                return;
            }
        };

        let outcome = self.execute_request(&request).await;

        let mut reply = match Envelope::wrap(&outcome) {
            Ok(reply) => reply,
            Err(e) => {
                error!(error = %e, "failed to encode outcome");
                return;
            }
        };
        reply.correlation_id = envelope.correlation_id;

        match reply.to_value() {
            Ok(value) => match self.queue.publish(&reply_queue, &value).await {
                Ok(_) => {
                    // Ack only after the reply is durable: a crash between
                    // the two means redelivery, never loss.
                    let _ = self.queue.ack(&self.config.request_queue, message_id).await;
                }
                Err(e) => {
                    warn!(error = %e, "reply publish failed; leaving request for redelivery");
                }
            },
            Err(e) => error!(error = %e, "failed to serialize reply"),
        }
    }

    #[instrument(skip(self, request), fields(step = %request.step_slug, attempt = request.metadata.attempt))]
    async fn execute_request(&self, request: &StepRequest) -> StepOutcome {
        let Some(handler) = self.registry.get(&request.handler) else {
            return StepOutcome::failed(
                request,
                FailureInfo {
                    code: "handler_not_found".to_string(),
                    message: format!("no handler registered for '{}'", request.handler),
                    retryable: false,
                },
                0,
            );
        };

        let budget = Duration::from_millis(request.metadata.timeout_ms);
        let started = Instant::now();

        let outcome = match &request.element {
            Some(element) => {
                match tokio::time::timeout(budget, handler.handle_item(&element.item, &request.input))
                    .await
                {
                    Ok(Ok(value)) => {
                        StepOutcome::success(request, value, elapsed_ms(started))
                    }
                    Ok(Err(e)) => StepOutcome::failed(
                        request,
                        FailureInfo {
                            code: e.code.clone(),
                            message: e.message.clone(),
                            retryable: e.retryable,
                        },
                        elapsed_ms(started),
                    ),
                    Err(_) => StepOutcome::timed_out(request, elapsed_ms(started)),
                }
            }
            None => match tokio::time::timeout(budget, handler.handle(&request.input)).await {
                Ok(Ok(StepOutput::Value(value))) => {
                    StepOutcome::success(request, value, elapsed_ms(started))
                }
                Ok(Ok(StepOutput::Items(items))) => {
                    StepOutcome::fan_out(request, items, elapsed_ms(started))
                }
                Ok(Err(e)) => StepOutcome::failed(
                    request,
                    FailureInfo {
                        code: e.code.clone(),
                        message: e.message.clone(),
                        retryable: e.retryable,
                    },
                    elapsed_ms(started),
                ),
                Err(_) => StepOutcome::timed_out(request, elapsed_ms(started)),
            },
        };

        debug!(status = ?outcome.status, "request executed");
        outcome
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

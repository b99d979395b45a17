//! # Messaging
//!
//! Durable, lease-based queues plus a best-effort low-latency wake
//! channel. Work dispatch, results, approvals, and rule updates each
//! travel over their own named queue (see `constants::queues`).

pub mod errors;
pub mod message;
pub mod notify;
pub mod pgmq_client;
pub mod queue;

pub use errors::MessagingError;
pub use message::{
    DecompositionReply, DecompositionRequest, ElementTask, Envelope, FailureInfo, OutcomeStatus,
    RequestMetadata, StepOutcome, StepRequest,
};
pub use notify::{NotifyListener, NotifyPublisher};
pub use pgmq_client::PgmqClient;
pub use queue::{InMemoryQueue, LeasedMessage, MessageQueue, QueueMetrics};

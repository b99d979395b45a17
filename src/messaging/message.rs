//! # Queue Message Formats
//!
//! Envelope and payload structures for the durable queues. Every message
//! crossing the queue boundary travels inside an [`Envelope`] carrying a
//! correlation identifier and, for request/reply flows, the queue name the
//! reply should be routed to.

use super::errors::MessagingError;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wire envelope shared by every channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub correlation_id: String,
    /// Queue name for asynchronous reply routing, when a reply is expected
    pub response_queue: Option<String>,
    pub sent_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn wrap<T: Serialize>(payload: &T) -> Result<Envelope, MessagingError> {
        Ok(Envelope {
            correlation_id: Uuid::new_v4().to_string(),
            response_queue: None,
            sent_at: Utc::now(),
            payload: serde_json::to_value(payload)
                .map_err(|e| MessagingError::serialization(e.to_string()))?,
        })
    }

    pub fn with_response_queue(mut self, queue: impl Into<String>) -> Self {
        self.response_queue = Some(queue.into());
        self
    }

    /// Deserialize the payload into its concrete type.
    pub fn open<T: DeserializeOwned>(&self) -> Result<T, MessagingError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| MessagingError::deserialization(e.to_string()))
    }

    pub fn to_value(&self) -> Result<serde_json::Value, MessagingError> {
        serde_json::to_value(self).map_err(|e| MessagingError::serialization(e.to_string()))
    }

    pub fn from_value(value: &serde_json::Value) -> Result<Envelope, MessagingError> {
        serde_json::from_value(value.clone())
            .map_err(|e| MessagingError::deserialization(e.to_string()))
    }
}

/// A fan-out element attached to a step request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementTask {
    pub index: usize,
    pub item: serde_json::Value,
}

/// Request metadata carried alongside every dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub attempt: u32,
    pub max_attempts: u32,
    /// Per-attempt execution budget enforced by the worker
    pub timeout_ms: u64,
    pub enqueued_at: DateTime<Utc>,
}

/// Step execution request dispatched to workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRequest {
    pub run_id: Uuid,
    pub step_slug: String,
    pub handler: String,
    /// Accumulated input: run input merged with named dependency outputs
    pub input: serde_json::Value,
    /// Present for map-step element tasks
    pub element: Option<ElementTask>,
    pub metadata: RequestMetadata,
}

/// Terminal status of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Failed,
    TimedOut,
}

/// Failure payload for failed attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureInfo {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

/// Result of one step execution attempt, published to the reply queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    pub run_id: Uuid,
    pub step_slug: String,
    pub attempt: u32,
    pub element_index: Option<usize>,
    pub status: OutcomeStatus,
    pub output: Option<serde_json::Value>,
    /// Set when the handler returned a collection (map-step trigger)
    pub fan_out: Option<Vec<serde_json::Value>>,
    pub error: Option<FailureInfo>,
    pub execution_time_ms: u64,
    pub completed_at: DateTime<Utc>,
}

impl StepOutcome {
    fn base(request: &StepRequest, status: OutcomeStatus, execution_time_ms: u64) -> Self {
        Self {
            run_id: request.run_id,
            step_slug: request.step_slug.clone(),
            attempt: request.metadata.attempt,
            element_index: request.element.as_ref().map(|e| e.index),
            status,
            output: None,
            fan_out: None,
            error: None,
            execution_time_ms,
            completed_at: Utc::now(),
        }
    }

    pub fn success(
        request: &StepRequest,
        output: serde_json::Value,
        execution_time_ms: u64,
    ) -> Self {
        let mut outcome = Self::base(request, OutcomeStatus::Success, execution_time_ms);
        outcome.output = Some(output);
        outcome
    }

    pub fn fan_out(
        request: &StepRequest,
        items: Vec<serde_json::Value>,
        execution_time_ms: u64,
    ) -> Self {
        let mut outcome = Self::base(request, OutcomeStatus::Success, execution_time_ms);
        outcome.fan_out = Some(items);
        outcome
    }

    pub fn failed(request: &StepRequest, error: FailureInfo, execution_time_ms: u64) -> Self {
        let mut outcome = Self::base(request, OutcomeStatus::Failed, execution_time_ms);
        outcome.error = Some(error);
        outcome
    }

    pub fn timed_out(request: &StepRequest, execution_time_ms: u64) -> Self {
        let mut outcome = Self::base(request, OutcomeStatus::TimedOut, execution_time_ms);
        outcome.error = Some(FailureInfo {
            code: "task_timeout".to_string(),
            message: format!(
                "step execution exceeded {}ms",
                request.metadata.timeout_ms
            ),
            retryable: true,
        });
        outcome
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }
}

/// Decomposition request served by external planners.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecompositionRequest {
    pub goal: String,
    pub max_depth: u32,
}

/// Reply to a [`DecompositionRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecompositionReply {
    pub tasks: Vec<crate::models::TaskDescriptor>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> StepRequest {
        StepRequest {
            run_id: Uuid::new_v4(),
            step_slug: "validate_order".to_string(),
            handler: "validate_order".to_string(),
            input: serde_json::json!({"order_id": 1001}),
            element: None,
            metadata: RequestMetadata {
                attempt: 1,
                max_attempts: 3,
                timeout_ms: 30_000,
                enqueued_at: Utc::now(),
            },
        }
    }

    #[test]
    fn test_envelope_roundtrip() {
        let request = sample_request();
        let envelope = Envelope::wrap(&request)
            .unwrap()
            .with_response_queue("replies_1");

        assert!(!envelope.correlation_id.is_empty());
        assert_eq!(envelope.response_queue.as_deref(), Some("replies_1"));

        let value = envelope.to_value().unwrap();
        let parsed = Envelope::from_value(&value).unwrap();
        let unpacked: StepRequest = parsed.open().unwrap();
        assert_eq!(unpacked.step_slug, request.step_slug);
        assert_eq!(unpacked.run_id, request.run_id);
    }

    #[test]
    fn test_envelope_open_wrong_type_fails() {
        let envelope = Envelope::wrap(&serde_json::json!({"goal": 7})).unwrap();
        let result: Result<StepRequest, _> = envelope.open();
        assert!(result.is_err());
    }

    #[test]
    fn test_outcome_constructors() {
        let request = sample_request();

        let ok = StepOutcome::success(&request, serde_json::json!({"valid": true}), 12);
        assert!(ok.is_success());
        assert_eq!(ok.attempt, 1);
        assert!(ok.fan_out.is_none());

        let fan = StepOutcome::fan_out(
            &request,
            vec![serde_json::json!(1), serde_json::json!(2)],
            5,
        );
        assert!(fan.is_success());
        assert_eq!(fan.fan_out.as_ref().unwrap().len(), 2);

        let timed = StepOutcome::timed_out(&request, 30_000);
        assert_eq!(timed.status, OutcomeStatus::TimedOut);
        let err = timed.error.unwrap();
        assert_eq!(err.code, "task_timeout");
        assert!(err.retryable);
    }

    #[test]
    fn test_element_outcome_carries_index() {
        let mut request = sample_request();
        request.element = Some(ElementTask {
            index: 2,
            item: serde_json::json!("shard-2"),
        });
        let ok = StepOutcome::success(&request, serde_json::json!("done"), 3);
        assert_eq!(ok.element_index, Some(2));
    }
}

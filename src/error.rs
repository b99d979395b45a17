//! # Engine Error Taxonomy
//!
//! Every failure crossing a component boundary carries a stable error code
//! plus a message. Subsystem errors (`MessagingError`, `ConfigurationError`)
//! convert into this taxonomy via `From` before they leave the crate.

use thiserror::Error;

/// Crate-wide error type for orchestration operations.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Malformed graph or configuration input. Never retried.
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Graph references an unknown step, or contains a cycle. Fails graph build.
    #[error("Dependency error: {message}")]
    Dependency { message: String },

    /// Handler error or attempt timeout; retried per policy.
    #[error("Transient task error in step '{step}': {message}")]
    TransientTask { step: String, message: String },

    /// Retry budget exhausted; dependents are short-circuited.
    #[error("Permanent failure in step '{step}' after {attempts} attempts: {message}")]
    PermanentTaskFailure {
        step: String,
        attempts: u32,
        message: String,
    },

    /// Run-level deadline exceeded; in-flight work abandoned best-effort.
    #[error("Workflow {run_id} timed out after {timeout_seconds}s")]
    WorkflowTimeout { run_id: uuid::Uuid, timeout_seconds: u64 },

    /// Queue or store unreachable. Surfaced to the caller rather than
    /// retried indefinitely, since it can affect many steps at once.
    #[error("Infrastructure error: {message}")]
    Infrastructure { message: String },

    #[error("Configuration error: {0}")]
    Configuration(#[from] crate::config::ConfigurationError),

    #[error("Messaging error: {0}")]
    Messaging(#[from] crate::messaging::MessagingError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl EngineError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn dependency(message: impl Into<String>) -> Self {
        Self::Dependency {
            message: message.into(),
        }
    }

    pub fn transient(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientTask {
            step: step.into(),
            message: message.into(),
        }
    }

    pub fn infrastructure(message: impl Into<String>) -> Self {
        Self::Infrastructure {
            message: message.into(),
        }
    }

    /// Stable machine-readable code for this error class.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation_error",
            Self::Dependency { .. } => "dependency_error",
            Self::TransientTask { .. } => "transient_task_error",
            Self::PermanentTaskFailure { .. } => "permanent_task_failure",
            Self::WorkflowTimeout { .. } => "workflow_timeout",
            Self::Infrastructure { .. } => "infrastructure_error",
            Self::Configuration(_) => "configuration_error",
            Self::Messaging(_) => "infrastructure_error",
            Self::Database(_) => "infrastructure_error",
        }
    }

    /// Whether the executor may retry the operation that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientTask { .. })
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

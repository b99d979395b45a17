//! # Step Handler Contract
//!
//! A handler receives the accumulated input (run input merged with named
//! outputs of satisfied dependencies) and returns a value, a collection
//! (which the engine treats as a map-step fan-out trigger), or a failure
//! with a retryability flag. Delivery is at-least-once, so handlers must
//! be idempotent or write to idempotent sinks.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::sync::Arc;
use thiserror::Error;

/// Successful handler output.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutput {
    /// Single result value, stored as the step's result
    Value(serde_json::Value),
    /// Collection output: the engine dispatches one element task per item
    Items(Vec<serde_json::Value>),
}

impl StepOutput {
    pub fn value(v: impl Into<serde_json::Value>) -> Self {
        Self::Value(v.into())
    }
}

/// Handler failure with a stable code and retryability decision.
#[derive(Error, Debug, Clone)]
#[error("{code}: {message}")]
pub struct HandlerError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl HandlerError {
    /// A failure worth retrying (downstream hiccup, contention).
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            code: "handler_transient".to_string(),
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure that will not go away on retry (bad input, logic error).
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            code: "handler_permanent".to_string(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = code.into();
        self
    }
}

/// The unit-of-work contract bound to each step.
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Execute the step against its accumulated input.
    async fn handle(&self, input: &serde_json::Value) -> Result<StepOutput, HandlerError>;

    /// Execute one element of a map-step fan-out. The default passes the
    /// element through unchanged.
    async fn handle_item(
        &self,
        item: &serde_json::Value,
        _input: &serde_json::Value,
    ) -> Result<serde_json::Value, HandlerError> {
        Ok(item.clone())
    }
}

type HandlerFn = dyn Fn(serde_json::Value) -> BoxFuture<'static, Result<StepOutput, HandlerError>>
    + Send
    + Sync;

/// Adapter turning an async closure into a [`StepHandler`].
pub struct FnHandler {
    inner: Arc<HandlerFn>,
}

impl FnHandler {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<StepOutput, HandlerError>> + Send + 'static,
    {
        Self {
            inner: Arc::new(move |input| Box::pin(f(input))),
        }
    }
}

#[async_trait]
impl StepHandler for FnHandler {
    async fn handle(&self, input: &serde_json::Value) -> Result<StepOutput, HandlerError> {
        (self.inner)(input.clone()).await
    }
}

/// Thread-safe registry resolving handler names to implementations.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn StepHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    /// Register an async closure under `name`.
    pub fn register_fn<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<StepOutput, HandlerError>> + Send + 'static,
    {
        self.register(name, Arc::new(FnHandler::new(f)));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(name).map(|entry| Arc::clone(&entry))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fn_handler_and_registry() {
        let registry = HandlerRegistry::new();
        registry.register_fn("double", |input| async move {
            let n = input.get("n").and_then(|v| v.as_i64()).unwrap_or(0);
            Ok(StepOutput::value(serde_json::json!({"doubled": n * 2})))
        });

        assert!(registry.contains("double"));
        assert!(!registry.contains("triple"));
        assert_eq!(registry.len(), 1);

        let handler = registry.get("double").unwrap();
        let output = handler.handle(&serde_json::json!({"n": 21})).await.unwrap();
        assert_eq!(
            output,
            StepOutput::Value(serde_json::json!({"doubled": 42}))
        );
    }

    #[tokio::test]
    async fn test_default_handle_item_is_identity() {
        let registry = HandlerRegistry::new();
        registry.register_fn("fan", |_| async move {
            Ok(StepOutput::Items(vec![serde_json::json!("a")]))
        });
        let handler = registry.get("fan").unwrap();
        let item = serde_json::json!({"shard": 3});
        let result = handler.handle_item(&item, &serde_json::json!({})).await.unwrap();
        assert_eq!(result, item);
    }

    #[test]
    fn test_handler_error_classes() {
        let transient = HandlerError::transient("socket reset");
        assert!(transient.retryable);
        assert_eq!(transient.code, "handler_transient");

        let permanent = HandlerError::permanent("bad schema").with_code("schema_mismatch");
        assert!(!permanent.retryable);
        assert_eq!(permanent.code, "schema_mismatch");
    }
}

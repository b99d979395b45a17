#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Taskweave Core
//!
//! Database-backed workflow orchestration: decompose a high-level goal
//! into a DAG of steps, persist the graph and execution state in
//! PostgreSQL, and execute steps respecting dependencies, bounded
//! parallelism, retries, and timeouts. Work is dispatched through a
//! durable message queue (pgmq), so any number of worker instances can
//! cooperate without in-process coordination.
//!
//! ## Architecture
//!
//! - [`models`] - run/step/edge data layer and the derived task graph,
//!   plus the `RunStore` seam (PostgreSQL or in-memory)
//! - [`decomposition`] - pluggable goal-to-task-list strategies with
//!   depth and parallelism bounds
//! - [`config`] - immutable configuration tree and the adaptive
//!   retry/timeout optimizer
//! - [`messaging`] - lease-based durable queues and the best-effort
//!   wake channel
//! - [`orchestration`] - executor, queue worker, and composer
//! - [`state_machine`] - run and step lifecycle states
//! - [`error`] - failure taxonomy with stable error codes
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use taskweave_core::config::{ConfigOverrides, EngineConfig};
//! use taskweave_core::decomposition::TemplateDecomposer;
//! use taskweave_core::messaging::InMemoryQueue;
//! use taskweave_core::models::MemoryRunStore;
//! use taskweave_core::orchestration::{Composer, HandlerRegistry, StepOutput};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Arc::new(EngineConfig::default());
//! config.validate()?;
//!
//! let registry = Arc::new(HandlerRegistry::new());
//! registry.register_fn("analyze", |input| async move {
//!     Ok(StepOutput::Value(input))
//! });
//! // ... one handler per step id ...
//!
//! let composer = Composer::new(
//!     Arc::new(MemoryRunStore::new()),
//!     Arc::new(InMemoryQueue::new()),
//!     config,
//! )
//! .with_embedded_worker(registry);
//!
//! let outcome = composer
//!     .compose_from_goal(
//!         "index the docs",
//!         &TemplateDecomposer::new(),
//!         serde_json::json!({"corpus": "docs/"}),
//!         &HashMap::new(),
//!         &ConfigOverrides::default(),
//!     )
//!     .await?;
//! println!("run {} finished: {}", outcome.run_id, outcome.status);
//! # Ok(())
//! # }
//! ```
//!
//! Deployments on PostgreSQL swap `MemoryRunStore` for
//! `models::PgRunStore` and `InMemoryQueue` for `messaging::PgmqClient`;
//! remote workers run `orchestration::QueueWorker` against the same
//! queue, and `messaging::NotifyListener` wakes executors early.

pub mod config;
pub mod constants;
pub mod database;
pub mod decomposition;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod models;
pub mod orchestration;
pub mod state_machine;

pub use config::{ConfigManager, ConfigOverrides, EngineConfig};
pub use error::{EngineError, Result};
pub use models::{TaskDescriptor, TaskGraph};
pub use orchestration::{Composer, RunOutcome, RunStatus};
pub use state_machine::{RunState, StepState};

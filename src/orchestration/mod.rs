//! # Orchestration Engine
//!
//! The executor, worker, and composer that tie the graph model, the
//! configuration policy layer, decomposition, and messaging together.
//!
//! ## Core components
//!
//! - [`WorkflowExecutor`]: schedules ready steps under bounded
//!   concurrency, applies timeout and retry policy, persists every state
//!   transition, and propagates permanent failures to dependents.
//! - [`QueueWorker`]: leases step requests from the durable queue, runs
//!   the registered handler, and publishes outcomes to the reply queue.
//!   Any number of instances may run across hosts.
//! - [`Composer`]: decompose, persist, execute, aggregate - in one call.
//! - [`HandlerRegistry`]: resolves handler names to implementations.

pub mod composer;
pub mod executor;
pub mod handler;
pub mod worker;

pub use composer::{Composer, RunStatus};
pub use executor::{ExecutionStats, RunOutcome, StepFailureSummary, WorkflowExecutor};
pub use handler::{FnHandler, HandlerError, HandlerRegistry, StepHandler, StepOutput};
pub use worker::{QueueWorker, WorkerConfig};

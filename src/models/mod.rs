//! # Data Layer
//!
//! Run, step, and dependency-edge models over PostgreSQL, the derived
//! task-graph view, and the `RunStore` seam the orchestration layer uses.

pub mod step_dependency;
pub mod store;
pub mod task_graph;
pub mod workflow_run;
pub mod workflow_step;

pub use step_dependency::StepDependency;
pub use store::{MemoryRunStore, PgRunStore, RunStore};
pub use task_graph::{GraphStep, TaskDescriptor, TaskGraph};
pub use workflow_run::WorkflowRun;
pub use workflow_step::WorkflowStep;

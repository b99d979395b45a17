//! # Composer
//!
//! End-to-end orchestration: decompose a goal, persist the graph, execute
//! it, and aggregate the result. Composer-level calls are never themselves
//! retried; retries live inside the executor.

use crate::config::{ConfigOverrides, EngineConfig, Optimizer};
use crate::decomposition::{decompose_goal_with_bindings, Decomposer, WorkflowDefinition};
use crate::error::{EngineError, Result};
use crate::messaging::MessageQueue;
use crate::models::{GraphStep, RunStore, TaskGraph};
use crate::orchestration::executor::{RunOutcome, WorkflowExecutor};
use crate::orchestration::handler::HandlerRegistry;
use crate::orchestration::worker::QueueWorker;
use crate::state_machine::RunState;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{info, instrument};
use uuid::Uuid;

/// Answer to a run-status query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStatus {
    pub status: RunState,
    /// Accumulated result on completion, error descriptor on failure, or
    /// an in-progress snapshot otherwise
    pub info: serde_json::Value,
}

pub struct Composer {
    store: Arc<dyn RunStore>,
    queue: Arc<dyn MessageQueue>,
    config: Arc<EngineConfig>,
    optimizer: Arc<Optimizer>,
    registry: Option<Arc<HandlerRegistry>>,
    wake: Option<Arc<Notify>>,
}

impl Composer {
    pub fn new(
        store: Arc<dyn RunStore>,
        queue: Arc<dyn MessageQueue>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            store,
            queue,
            config,
            optimizer: Arc::new(Optimizer::new()),
            registry: None,
            wake: None,
        }
    }

    /// Run an in-process worker next to each execution. Without this the
    /// composer assumes external worker instances service the task queue.
    pub fn with_embedded_worker(mut self, registry: Arc<HandlerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Wake handle from a notify listener (see `messaging::notify`).
    pub fn with_wake(mut self, wake: Arc<Notify>) -> Self {
        self.wake = Some(wake);
        self
    }

    /// Shared optimizer accumulating cross-run statistics.
    pub fn optimizer(&self) -> Arc<Optimizer> {
        Arc::clone(&self.optimizer)
    }

    /// Decompose `goal`, persist the graph, execute it, and return the
    /// aggregated result keyed by step id - or the first hard error from
    /// any stage.
    #[instrument(skip(self, decomposer, input, bindings, overrides), fields(goal = goal))]
    pub async fn compose_from_goal(
        &self,
        goal: &str,
        decomposer: &dyn Decomposer,
        input: serde_json::Value,
        bindings: &HashMap<String, String>,
        overrides: &ConfigOverrides,
    ) -> Result<RunOutcome> {
        let bounds = self.config.decomposer_config(decomposer.name(), overrides);
        let graph = decompose_goal_with_bindings(goal, decomposer, &bounds, bindings).await?;
        info!(steps = graph.len(), depth = graph.max_depth(), "goal decomposed");
        self.run_graph(goal, input, &graph, decomposer.name(), overrides)
            .await
    }

    /// Execute a declared workflow definition, bypassing decomposition.
    pub async fn compose_from_definition(
        &self,
        definition: &WorkflowDefinition,
        input: serde_json::Value,
        overrides: &ConfigOverrides,
    ) -> Result<RunOutcome> {
        let graph = definition.build_graph()?;
        let mut overrides = overrides.clone();
        if overrides.max_parallel.is_none() {
            overrides.max_parallel = definition.max_parallel;
        }
        self.run_graph(&definition.name, input, &graph, "definition", &overrides)
            .await
    }

    /// Fan a goal into independent task graphs (one per decomposer) and
    /// execute them concurrently. Fail-fast: any sub-workflow failure
    /// fails the whole call, even if the others succeeded; per-run
    /// outcomes stay queryable via [`Composer::run_status`].
    pub async fn compose_multiple_workflows(
        &self,
        goal: &str,
        decomposers: &[&dyn Decomposer],
        input: &serde_json::Value,
        overrides: &ConfigOverrides,
    ) -> Result<Vec<RunOutcome>> {
        let bindings = HashMap::new();
        let executions = decomposers.iter().map(|decomposer| {
            self.compose_from_goal(goal, *decomposer, input.clone(), &bindings, overrides)
        });
        let results = futures::future::join_all(executions).await;

        let mut outcomes = Vec::with_capacity(results.len());
        for result in results {
            outcomes.push(result?);
        }
        Ok(outcomes)
    }

    /// Run-status query: terminal runs report their result or error,
    /// anything else gets a step-level snapshot.
    pub async fn run_status(&self, run_id: Uuid) -> Result<RunStatus> {
        let run = self
            .store
            .fetch_run(run_id)
            .await?
            .ok_or_else(|| EngineError::validation(format!("unknown run {run_id}")))?;
        let status = run.state();
        let info = match status {
            RunState::Complete => run.result.unwrap_or_else(|| serde_json::json!({})),
            RunState::Failed | RunState::TimedOut => {
                run.error.unwrap_or_else(|| serde_json::json!({}))
            }
            RunState::Pending | RunState::InProgress => {
                let steps = self.store.fetch_steps(run_id).await?;
                let mut by_step = serde_json::Map::new();
                let mut counts: HashMap<String, usize> = HashMap::new();
                for step in &steps {
                    by_step.insert(
                        step.slug.clone(),
                        serde_json::Value::String(step.status.clone()),
                    );
                    *counts.entry(step.status.clone()).or_default() += 1;
                }
                serde_json::json!({
                    "steps": by_step,
                    "counts": counts,
                })
            }
        };
        Ok(RunStatus { status, info })
    }

    async fn run_graph(
        &self,
        workflow_name: &str,
        input: serde_json::Value,
        graph: &TaskGraph,
        decomposer_type: &str,
        overrides: &ConfigOverrides,
    ) -> Result<RunOutcome> {
        let run_id = self.store.create_run(workflow_name, &input).await?;
        let steps: Vec<GraphStep> = graph.steps().cloned().collect();
        self.store.insert_steps(run_id, &steps).await?;
        for step in &steps {
            for dep in &step.depends_on {
                self.store
                    .record_dependency(run_id, &step.slug, dep)
                    .await?;
            }
        }

        let mut executor = WorkflowExecutor::new(
            Arc::clone(&self.store),
            Arc::clone(&self.queue),
            self.config.execution_config(overrides),
        );
        if self.config.optimization_active() {
            executor = executor.with_optimizer(
                Arc::clone(&self.optimizer),
                self.config.optimization.level,
                decomposer_type,
            );
        }
        if let Some(wake) = &self.wake {
            executor = executor.with_wake(Arc::clone(wake));
        }

        let worker = self.registry.as_ref().map(|registry| {
            let cancel = executor.cancellation_token();
            let handle = QueueWorker::new(Arc::clone(&self.queue), Arc::clone(registry))
                .spawn(cancel.clone());
            (handle, cancel)
        });

        let result = executor.execute(run_id, graph).await;

        if let Some((handle, cancel)) = worker {
            cancel.cancel();
            let _ = handle.await;
        }

        let outcome = result?;
        match outcome.status {
            RunState::Failed => {
                // First hard error wins; the full picture stays queryable
                // through run_status.
                let (step, failure) = outcome
                    .failures
                    .iter()
                    .min_by_key(|(slug, _)| graph.slugs().iter().position(|s| s == *slug))
                    .map(|(slug, failure)| (slug.clone(), failure.clone()))
                    .unwrap_or_else(|| {
                        (
                            "unknown".to_string(),
                            crate::orchestration::executor::StepFailureSummary {
                                code: "permanent_task_failure".to_string(),
                                message: "run failed".to_string(),
                                attempts: 0,
                            },
                        )
                    });
                Err(EngineError::PermanentTaskFailure {
                    step,
                    attempts: failure.attempts,
                    message: failure.message,
                })
            }
            _ => Ok(outcome),
        }
    }
}

//! # Run Store
//!
//! Async storage seam over the run/step/edge tables. `PgRunStore` is the
//! production implementation; `MemoryRunStore` backs tests and embedded
//! single-process deployments with identical semantics.

use crate::error::{EngineError, Result};
use crate::models::step_dependency::{validate_edge, StepDependency};
use crate::models::task_graph::GraphStep;
use crate::models::workflow_run::WorkflowRun;
use crate::models::workflow_step::WorkflowStep;
use crate::state_machine::RunState;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Storage operations the executor and composer rely on.
///
/// Step mutations are only ever issued by the executor; graph writes only
/// happen during composition. Edge rows are insert-only.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create_run(&self, workflow_name: &str, input: &serde_json::Value) -> Result<Uuid>;
    async fn fetch_run(&self, run_id: Uuid) -> Result<Option<WorkflowRun>>;
    async fn mark_run_in_progress(&self, run_id: Uuid) -> Result<()>;
    async fn finalize_run(
        &self,
        run_id: Uuid,
        state: RunState,
        result: Option<serde_json::Value>,
        error: Option<serde_json::Value>,
    ) -> Result<()>;

    async fn insert_steps(&self, run_id: Uuid, steps: &[GraphStep]) -> Result<()>;
    async fn record_dependency(
        &self,
        run_id: Uuid,
        step_slug: &str,
        depends_on_step: &str,
    ) -> Result<()>;
    async fn find_dependencies(&self, run_id: Uuid, step_slug: &str) -> Result<Vec<String>>;
    async fn find_dependents(&self, run_id: Uuid, step_slug: &str) -> Result<Vec<String>>;
    async fn find_root_steps(&self, run_id: Uuid) -> Result<Vec<String>>;

    async fn fetch_steps(&self, run_id: Uuid) -> Result<Vec<WorkflowStep>>;
    async fn fetch_step(&self, run_id: Uuid, slug: &str) -> Result<Option<WorkflowStep>>;
    async fn mark_step_ready(&self, run_id: Uuid, slug: &str) -> Result<()>;
    /// Returns the attempt count after the transition.
    async fn mark_step_running(&self, run_id: Uuid, slug: &str) -> Result<u32>;
    async fn mark_step_complete(
        &self,
        run_id: Uuid,
        slug: &str,
        result: &serde_json::Value,
    ) -> Result<()>;
    async fn mark_step_failed(
        &self,
        run_id: Uuid,
        slug: &str,
        error: &serde_json::Value,
    ) -> Result<()>;
    async fn mark_step_retrying(
        &self,
        run_id: Uuid,
        slug: &str,
        error: &serde_json::Value,
    ) -> Result<()>;
}

/// PostgreSQL-backed store delegating to the model layer.
#[derive(Debug, Clone)]
pub struct PgRunStore {
    pool: PgPool,
}

impl PgRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl RunStore for PgRunStore {
    async fn create_run(&self, workflow_name: &str, input: &serde_json::Value) -> Result<Uuid> {
        let run = WorkflowRun::create(&self.pool, workflow_name, input).await?;
        Ok(run.run_id)
    }

    async fn fetch_run(&self, run_id: Uuid) -> Result<Option<WorkflowRun>> {
        WorkflowRun::find_by_id(&self.pool, run_id).await
    }

    async fn mark_run_in_progress(&self, run_id: Uuid) -> Result<()> {
        WorkflowRun::mark_in_progress(&self.pool, run_id).await
    }

    async fn finalize_run(
        &self,
        run_id: Uuid,
        state: RunState,
        result: Option<serde_json::Value>,
        error: Option<serde_json::Value>,
    ) -> Result<()> {
        WorkflowRun::finalize(&self.pool, run_id, state, result.as_ref(), error.as_ref()).await
    }

    async fn insert_steps(&self, run_id: Uuid, steps: &[GraphStep]) -> Result<()> {
        WorkflowStep::create_for_run(&self.pool, run_id, steps).await
    }

    async fn record_dependency(
        &self,
        run_id: Uuid,
        step_slug: &str,
        depends_on_step: &str,
    ) -> Result<()> {
        StepDependency::record(&self.pool, run_id, step_slug, depends_on_step).await?;
        Ok(())
    }

    async fn find_dependencies(&self, run_id: Uuid, step_slug: &str) -> Result<Vec<String>> {
        StepDependency::find_dependencies(&self.pool, run_id, step_slug).await
    }

    async fn find_dependents(&self, run_id: Uuid, step_slug: &str) -> Result<Vec<String>> {
        StepDependency::find_dependents(&self.pool, run_id, step_slug).await
    }

    async fn find_root_steps(&self, run_id: Uuid) -> Result<Vec<String>> {
        StepDependency::find_root_steps(&self.pool, run_id).await
    }

    async fn fetch_steps(&self, run_id: Uuid) -> Result<Vec<WorkflowStep>> {
        WorkflowStep::find_by_run(&self.pool, run_id).await
    }

    async fn fetch_step(&self, run_id: Uuid, slug: &str) -> Result<Option<WorkflowStep>> {
        WorkflowStep::find(&self.pool, run_id, slug).await
    }

    async fn mark_step_ready(&self, run_id: Uuid, slug: &str) -> Result<()> {
        WorkflowStep::mark_ready(&self.pool, run_id, slug).await
    }

    async fn mark_step_running(&self, run_id: Uuid, slug: &str) -> Result<u32> {
        let attempts = WorkflowStep::mark_running(&self.pool, run_id, slug).await?;
        Ok(attempts as u32)
    }

    async fn mark_step_complete(
        &self,
        run_id: Uuid,
        slug: &str,
        result: &serde_json::Value,
    ) -> Result<()> {
        WorkflowStep::mark_complete(&self.pool, run_id, slug, result).await
    }

    async fn mark_step_failed(
        &self,
        run_id: Uuid,
        slug: &str,
        error: &serde_json::Value,
    ) -> Result<()> {
        WorkflowStep::mark_failed(&self.pool, run_id, slug, error).await
    }

    async fn mark_step_retrying(
        &self,
        run_id: Uuid,
        slug: &str,
        error: &serde_json::Value,
    ) -> Result<()> {
        WorkflowStep::mark_retrying(&self.pool, run_id, slug, error).await
    }
}

#[derive(Debug, Default)]
struct RunRecord {
    run: Option<WorkflowRun>,
    steps: HashMap<String, WorkflowStep>,
    step_order: Vec<String>,
    edges: Vec<(String, String)>,
}

/// In-memory store with the same semantics as the Pg implementation.
#[derive(Debug, Default, Clone)]
pub struct MemoryRunStore {
    runs: Arc<RwLock<HashMap<Uuid, RunRecord>>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn unknown_run(run_id: Uuid) -> EngineError {
    EngineError::validation(format!("unknown run {run_id}"))
}

fn unknown_step(run_id: Uuid, slug: &str) -> EngineError {
    EngineError::validation(format!("unknown step '{slug}' in run {run_id}"))
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn create_run(&self, workflow_name: &str, input: &serde_json::Value) -> Result<Uuid> {
        let run_id = Uuid::new_v4();
        let run = WorkflowRun {
            run_id,
            workflow_name: workflow_name.to_string(),
            input: input.clone(),
            status: RunState::Pending.to_string(),
            result: None,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        let mut runs = self.runs.write().await;
        runs.insert(
            run_id,
            RunRecord {
                run: Some(run),
                ..Default::default()
            },
        );
        Ok(run_id)
    }

    async fn fetch_run(&self, run_id: Uuid) -> Result<Option<WorkflowRun>> {
        Ok(self
            .runs
            .read()
            .await
            .get(&run_id)
            .and_then(|r| r.run.clone()))
    }

    async fn mark_run_in_progress(&self, run_id: Uuid) -> Result<()> {
        let mut runs = self.runs.write().await;
        let record = runs.get_mut(&run_id).ok_or_else(|| unknown_run(run_id))?;
        let run = record.run.as_mut().ok_or_else(|| unknown_run(run_id))?;
        if run.state() != RunState::Pending {
            return Err(EngineError::validation(format!(
                "run {run_id} is not pending"
            )));
        }
        run.status = RunState::InProgress.to_string();
        Ok(())
    }

    async fn finalize_run(
        &self,
        run_id: Uuid,
        state: RunState,
        result: Option<serde_json::Value>,
        error: Option<serde_json::Value>,
    ) -> Result<()> {
        if !state.is_terminal() {
            return Err(EngineError::validation(format!(
                "cannot finalize run {run_id} into non-terminal state {state}"
            )));
        }
        let mut runs = self.runs.write().await;
        let record = runs.get_mut(&run_id).ok_or_else(|| unknown_run(run_id))?;
        let run = record.run.as_mut().ok_or_else(|| unknown_run(run_id))?;
        run.status = state.to_string();
        run.result = result;
        run.error = error;
        run.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn insert_steps(&self, run_id: Uuid, steps: &[GraphStep]) -> Result<()> {
        let mut runs = self.runs.write().await;
        let record = runs.get_mut(&run_id).ok_or_else(|| unknown_run(run_id))?;
        for step in steps {
            record.steps.insert(
                step.slug.clone(),
                WorkflowStep {
                    run_id,
                    slug: step.slug.clone(),
                    description: step.description.clone(),
                    handler: step.handler.clone(),
                    status: crate::state_machine::StepState::Pending.to_string(),
                    attempt_count: 0,
                    result: None,
                    error: None,
                    created_at: Utc::now(),
                    started_at: None,
                    completed_at: None,
                },
            );
            record.step_order.push(step.slug.clone());
        }
        Ok(())
    }

    async fn record_dependency(
        &self,
        run_id: Uuid,
        step_slug: &str,
        depends_on_step: &str,
    ) -> Result<()> {
        validate_edge(run_id, step_slug, depends_on_step)?;
        let mut runs = self.runs.write().await;
        let record = runs.get_mut(&run_id).ok_or_else(|| unknown_run(run_id))?;
        record
            .edges
            .push((step_slug.to_string(), depends_on_step.to_string()));
        Ok(())
    }

    async fn find_dependencies(&self, run_id: Uuid, step_slug: &str) -> Result<Vec<String>> {
        let runs = self.runs.read().await;
        let record = runs.get(&run_id).ok_or_else(|| unknown_run(run_id))?;
        Ok(record
            .edges
            .iter()
            .filter(|(slug, _)| slug == step_slug)
            .map(|(_, dep)| dep.clone())
            .collect())
    }

    async fn find_dependents(&self, run_id: Uuid, step_slug: &str) -> Result<Vec<String>> {
        let runs = self.runs.read().await;
        let record = runs.get(&run_id).ok_or_else(|| unknown_run(run_id))?;
        Ok(record
            .edges
            .iter()
            .filter(|(_, dep)| dep == step_slug)
            .map(|(slug, _)| slug.clone())
            .collect())
    }

    async fn find_root_steps(&self, run_id: Uuid) -> Result<Vec<String>> {
        let runs = self.runs.read().await;
        let record = runs.get(&run_id).ok_or_else(|| unknown_run(run_id))?;
        Ok(record
            .step_order
            .iter()
            .filter(|slug| !record.edges.iter().any(|(s, _)| s == *slug))
            .cloned()
            .collect())
    }

    async fn fetch_steps(&self, run_id: Uuid) -> Result<Vec<WorkflowStep>> {
        let runs = self.runs.read().await;
        let record = runs.get(&run_id).ok_or_else(|| unknown_run(run_id))?;
        Ok(record
            .step_order
            .iter()
            .filter_map(|slug| record.steps.get(slug).cloned())
            .collect())
    }

    async fn fetch_step(&self, run_id: Uuid, slug: &str) -> Result<Option<WorkflowStep>> {
        let runs = self.runs.read().await;
        let record = runs.get(&run_id).ok_or_else(|| unknown_run(run_id))?;
        Ok(record.steps.get(slug).cloned())
    }

    async fn mark_step_ready(&self, run_id: Uuid, slug: &str) -> Result<()> {
        let mut runs = self.runs.write().await;
        let record = runs.get_mut(&run_id).ok_or_else(|| unknown_run(run_id))?;
        let step = record
            .steps
            .get_mut(slug)
            .ok_or_else(|| unknown_step(run_id, slug))?;
        if step.state() == crate::state_machine::StepState::Pending {
            step.status = crate::state_machine::StepState::Ready.to_string();
        }
        Ok(())
    }

    async fn mark_step_running(&self, run_id: Uuid, slug: &str) -> Result<u32> {
        let mut runs = self.runs.write().await;
        let record = runs.get_mut(&run_id).ok_or_else(|| unknown_run(run_id))?;
        let step = record
            .steps
            .get_mut(slug)
            .ok_or_else(|| unknown_step(run_id, slug))?;
        step.status = crate::state_machine::StepState::Running.to_string();
        step.attempt_count += 1;
        step.started_at = Some(Utc::now());
        Ok(step.attempt_count as u32)
    }

    async fn mark_step_complete(
        &self,
        run_id: Uuid,
        slug: &str,
        result: &serde_json::Value,
    ) -> Result<()> {
        let mut runs = self.runs.write().await;
        let record = runs.get_mut(&run_id).ok_or_else(|| unknown_run(run_id))?;
        let step = record
            .steps
            .get_mut(slug)
            .ok_or_else(|| unknown_step(run_id, slug))?;
        step.status = crate::state_machine::StepState::Complete.to_string();
        step.result = Some(result.clone());
        step.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn mark_step_failed(
        &self,
        run_id: Uuid,
        slug: &str,
        error: &serde_json::Value,
    ) -> Result<()> {
        let mut runs = self.runs.write().await;
        let record = runs.get_mut(&run_id).ok_or_else(|| unknown_run(run_id))?;
        let step = record
            .steps
            .get_mut(slug)
            .ok_or_else(|| unknown_step(run_id, slug))?;
        step.status = crate::state_machine::StepState::Failed.to_string();
        step.error = Some(error.clone());
        step.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn mark_step_retrying(
        &self,
        run_id: Uuid,
        slug: &str,
        error: &serde_json::Value,
    ) -> Result<()> {
        let mut runs = self.runs.write().await;
        let record = runs.get_mut(&run_id).ok_or_else(|| unknown_run(run_id))?;
        let step = record
            .steps
            .get_mut(slug)
            .ok_or_else(|| unknown_step(run_id, slug))?;
        step.status = crate::state_machine::StepState::Retrying.to_string();
        step.error = Some(error.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::StepState;

    fn graph_steps() -> Vec<GraphStep> {
        vec![
            GraphStep {
                slug: "a".into(),
                description: "start".into(),
                handler: "a".into(),
                depends_on: vec![],
            },
            GraphStep {
                slug: "b".into(),
                description: "next".into(),
                handler: "b".into(),
                depends_on: vec!["a".into()],
            },
        ]
    }

    #[tokio::test]
    async fn test_memory_store_run_lifecycle() {
        let store = MemoryRunStore::new();
        let run_id = store
            .create_run("demo", &serde_json::json!({"k": 1}))
            .await
            .unwrap();

        let run = store.fetch_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.state(), RunState::Pending);

        store.mark_run_in_progress(run_id).await.unwrap();
        // Double start is rejected
        assert!(store.mark_run_in_progress(run_id).await.is_err());

        store
            .finalize_run(run_id, RunState::Complete, Some(serde_json::json!({})), None)
            .await
            .unwrap();
        let run = store.fetch_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.state(), RunState::Complete);
        assert!(run.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_memory_store_edges_and_roots() {
        let store = MemoryRunStore::new();
        let run_id = store.create_run("demo", &serde_json::json!({})).await.unwrap();
        store.insert_steps(run_id, &graph_steps()).await.unwrap();
        store.record_dependency(run_id, "b", "a").await.unwrap();

        assert_eq!(
            store.find_dependencies(run_id, "b").await.unwrap(),
            vec!["a".to_string()]
        );
        assert_eq!(
            store.find_dependents(run_id, "a").await.unwrap(),
            vec!["b".to_string()]
        );
        assert_eq!(
            store.find_root_steps(run_id).await.unwrap(),
            vec!["a".to_string()]
        );

        // Edge validation is shared with the Pg path
        assert!(store.record_dependency(run_id, "", "a").await.is_err());
    }

    #[tokio::test]
    async fn test_memory_store_step_transitions() {
        let store = MemoryRunStore::new();
        let run_id = store.create_run("demo", &serde_json::json!({})).await.unwrap();
        store.insert_steps(run_id, &graph_steps()).await.unwrap();

        store.mark_step_ready(run_id, "a").await.unwrap();
        assert_eq!(store.mark_step_running(run_id, "a").await.unwrap(), 1);
        store
            .mark_step_retrying(run_id, "a", &serde_json::json!({"message": "boom"}))
            .await
            .unwrap();
        assert_eq!(store.mark_step_running(run_id, "a").await.unwrap(), 2);
        store
            .mark_step_complete(run_id, "a", &serde_json::json!({"ok": true}))
            .await
            .unwrap();

        let step = store.fetch_step(run_id, "a").await.unwrap().unwrap();
        assert_eq!(step.state(), StepState::Complete);
        assert_eq!(step.attempt_count, 2);
        assert!(step.completed_at.is_some());
    }
}

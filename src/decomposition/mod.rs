//! # Goal Decomposition
//!
//! Pluggable strategies that turn a high-level goal into a
//! dependency-annotated task list, bounded by decomposer-type-specific
//! depth and parallelism limits.

pub mod queue_decomposer;
pub mod template;

use crate::config::DecomposerConfig;
use crate::error::{EngineError, Result};
use crate::models::{TaskDescriptor, TaskGraph};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub use queue_decomposer::QueueDecomposer;
pub use template::{classify, template_for, GoalCategory, TemplateDecomposer};

/// Capability interface for decomposition strategies. Concrete variants
/// (template-based, externally-assisted) are selected via injection.
#[async_trait]
pub trait Decomposer: Send + Sync {
    /// Strategy name; keys per-decomposer-type configuration.
    fn name(&self) -> &str;

    /// Turn a goal into an ordered, dependency-annotated task list.
    async fn decompose(&self, goal: &str) -> Result<Vec<TaskDescriptor>>;
}

/// A declared workflow: steps with handlers and dependencies, bypassing
/// goal decomposition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    pub steps: Vec<StepDefinition>,
    pub max_parallel: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    pub id: String,
    /// Handler name; defaults to the step id
    pub handler: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl WorkflowDefinition {
    pub fn task_descriptors(&self) -> Vec<TaskDescriptor> {
        self.steps
            .iter()
            .map(|s| TaskDescriptor {
                id: s.id.clone(),
                description: s.id.clone(),
                depends_on: s.depends_on.clone(),
            })
            .collect()
    }

    pub fn handler_bindings(&self) -> HashMap<String, String> {
        self.steps
            .iter()
            .filter_map(|s| s.handler.clone().map(|h| (s.id.clone(), h)))
            .collect()
    }

    /// Build and validate the graph this definition declares.
    pub fn build_graph(&self) -> Result<TaskGraph> {
        TaskGraph::build_with_bindings(&self.task_descriptors(), &self.handler_bindings())
    }
}

/// Decompose a goal and validate the resulting graph against the resolved
/// decomposition bounds.
pub async fn decompose_goal(
    goal: &str,
    decomposer: &dyn Decomposer,
    config: &DecomposerConfig,
) -> Result<TaskGraph> {
    decompose_goal_with_bindings(goal, decomposer, config, &HashMap::new()).await
}

/// As [`decompose_goal`], binding handlers through `bindings`.
pub async fn decompose_goal_with_bindings(
    goal: &str,
    decomposer: &dyn Decomposer,
    config: &DecomposerConfig,
    bindings: &HashMap<String, String>,
) -> Result<TaskGraph> {
    let tasks = decomposer.decompose(goal).await?;
    let graph = TaskGraph::build_with_bindings(&tasks, bindings)?;

    if graph.max_depth() > config.max_depth {
        return Err(EngineError::validation(format!(
            "decomposition depth {} exceeds max_depth {}",
            graph.max_depth(),
            config.max_depth
        )));
    }
    if graph.roots().len() as u32 > config.parallel_threshold {
        return Err(EngineError::validation(format!(
            "{} root branches exceed parallel_threshold {}",
            graph.roots().len(),
            config.parallel_threshold
        )));
    }
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigOverrides, EngineConfig};

    fn bounds(max_depth: u32, parallel_threshold: u32) -> DecomposerConfig {
        DecomposerConfig {
            max_depth,
            parallel_threshold,
            timeout: std::time::Duration::from_secs(60),
            retry_attempts: 3,
        }
    }

    #[tokio::test]
    async fn test_decompose_goal_within_bounds() {
        let decomposer = TemplateDecomposer::new();
        let graph = decompose_goal("something generic", &decomposer, &bounds(10, 4))
            .await
            .unwrap();
        assert_eq!(graph.len(), 4);
        assert_eq!(graph.max_depth(), 4);
    }

    #[tokio::test]
    async fn test_depth_limit_rejected() {
        let decomposer = TemplateDecomposer::new();
        let err = decompose_goal("something generic", &decomposer, &bounds(3, 4))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "validation_error");
        assert!(err.to_string().contains("max_depth"));
    }

    #[tokio::test]
    async fn test_parallel_threshold_rejected() {
        // The deployment template has two root branches
        let decomposer = TemplateDecomposer::new();
        let err = decompose_goal("deploy the api", &decomposer, &bounds(10, 1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "validation_error");
        assert!(err.to_string().contains("parallel_threshold"));
    }

    #[tokio::test]
    async fn test_bounds_come_from_config_resolution() {
        let mut config = EngineConfig::default();
        config.decomposers.insert(
            "template".to_string(),
            crate::config::DecomposerOverrides {
                max_depth: Some(3),
                ..Default::default()
            },
        );
        let decomposer = TemplateDecomposer::new();
        let resolved = config.decomposer_config(decomposer.name(), &ConfigOverrides::default());
        let err = decompose_goal("something generic", &decomposer, &resolved)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "validation_error");
    }

    #[test]
    fn test_workflow_definition_graph() {
        let definition = WorkflowDefinition {
            name: "etl".to_string(),
            steps: vec![
                StepDefinition {
                    id: "extract".to_string(),
                    handler: Some("http_fetch".to_string()),
                    depends_on: vec![],
                },
                StepDefinition {
                    id: "load".to_string(),
                    handler: None,
                    depends_on: vec!["extract".to_string()],
                },
            ],
            max_parallel: Some(2),
        };
        let graph = definition.build_graph().unwrap();
        assert_eq!(graph.get("extract").unwrap().handler, "http_fetch");
        assert_eq!(graph.get("load").unwrap().handler, "load");
        assert_eq!(graph.roots(), ["extract"]);
    }
}

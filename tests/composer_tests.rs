//! End-to-end composer tests: goal decomposition through execution and
//! aggregation, workflow definitions, multi-workflow fan-out, and the
//! run-status query.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use taskweave_core::config::{ConfigOverrides, EngineConfig};
use taskweave_core::decomposition::{
    Decomposer, StepDefinition, TemplateDecomposer, WorkflowDefinition,
};
use taskweave_core::error::EngineError;
use taskweave_core::messaging::InMemoryQueue;
use taskweave_core::models::{MemoryRunStore, TaskDescriptor};
use taskweave_core::orchestration::{Composer, HandlerError, HandlerRegistry, StepOutput};
use taskweave_core::state_machine::RunState;

fn composer_with(registry: HandlerRegistry) -> Composer {
    let mut config = EngineConfig::default();
    config.execution.retry_delay_ms = 10;
    config.execution.poll_interval_ms = 10;
    Composer::new(
        Arc::new(MemoryRunStore::new()),
        Arc::new(InMemoryQueue::new()),
        Arc::new(config),
    )
    .with_embedded_worker(Arc::new(registry))
}

fn generic_handlers() -> HandlerRegistry {
    let registry = HandlerRegistry::new();
    for step in ["analyze", "plan", "execute", "verify"] {
        registry.register_fn(step, move |_| async move {
            Ok(StepOutput::value(serde_json::json!(format!("{step} done"))))
        });
    }
    registry
}

#[tokio::test]
async fn test_compose_from_goal_end_to_end() {
    let composer = composer_with(generic_handlers());
    let outcome = composer
        .compose_from_goal(
            "an unclassifiable chore",
            &TemplateDecomposer::new(),
            serde_json::json!({"ticket": "T-100"}),
            &HashMap::new(),
            &ConfigOverrides::default(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.status, RunState::Complete);
    assert_eq!(outcome.results.len(), 4);
    assert_eq!(outcome.results["verify"], serde_json::json!("verify done"));
    assert!(outcome.failures.is_empty());
    assert_eq!(outcome.stats.steps_total, 4);

    // The terminal run answers status queries with its accumulated result.
    let status = composer.run_status(outcome.run_id).await.unwrap();
    assert_eq!(status.status, RunState::Complete);
    assert_eq!(status.info["verify"], serde_json::json!("verify done"));
}

#[tokio::test]
async fn test_missing_handler_fails_without_retry() {
    // Handlers for the generic template minus "execute".
    let registry = HandlerRegistry::new();
    for step in ["analyze", "plan", "verify"] {
        registry.register_fn(step, move |_| async move {
            Ok(StepOutput::value(serde_json::json!(null)))
        });
    }
    let composer = composer_with(registry);

    let err = composer
        .compose_from_goal(
            "an unclassifiable chore",
            &TemplateDecomposer::new(),
            serde_json::json!({}),
            &HashMap::new(),
            &ConfigOverrides::default(),
        )
        .await
        .unwrap_err();

    match err {
        EngineError::PermanentTaskFailure { step, attempts, .. } => {
            assert_eq!(step, "execute");
            assert_eq!(attempts, 1);
        }
        other => panic!("expected permanent failure, got {other}"),
    }
}

#[tokio::test]
async fn test_compose_from_definition_with_bindings() {
    let registry = HandlerRegistry::new();
    registry.register_fn("http_fetch", |_| async move {
        Ok(StepOutput::value(serde_json::json!({"rows": 3})))
    });
    registry.register_fn("load", |input: serde_json::Value| async move {
        // The definition wired "extract" to http_fetch; its output arrives
        // under the step id.
        let rows = input["extract"]["rows"].as_i64().unwrap_or(0);
        Ok(StepOutput::value(serde_json::json!({"loaded": rows})))
    });

    let definition = WorkflowDefinition {
        name: "mini-etl".to_string(),
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
        max_parallel: Some(1),
    };

    let composer = composer_with(registry);
    let outcome = composer
        .compose_from_definition(&definition, serde_json::json!({}), &ConfigOverrides::default())
        .await
        .unwrap();
    assert_eq!(outcome.status, RunState::Complete);
    assert_eq!(outcome.results["load"], serde_json::json!({"loaded": 3}));
}

/// A decomposer whose plan has a single step with a fixed handler name.
struct SingleStep(&'static str);

#[async_trait]
impl Decomposer for SingleStep {
    fn name(&self) -> &str {
        "single"
    }

    async fn decompose(&self, _goal: &str) -> Result<Vec<TaskDescriptor>, EngineError> {
        Ok(vec![TaskDescriptor::new(self.0, "the only step")])
    }
}

#[tokio::test]
async fn test_compose_multiple_workflows_success() {
    let registry = generic_handlers();
    registry.register_fn("solo", |_| async move {
        Ok(StepOutput::value(serde_json::json!("solo done")))
    });
    let composer = composer_with(registry);

    let template = TemplateDecomposer::new();
    let single = SingleStep("solo");
    let outcomes = composer
        .compose_multiple_workflows(
            "an unclassifiable chore",
            &[&template, &single],
            &serde_json::json!({}),
            &ConfigOverrides::default(),
        )
        .await
        .unwrap();

    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|o| o.status == RunState::Complete));
    // Independent graphs: distinct runs.
    assert_ne!(outcomes[0].run_id, outcomes[1].run_id);
}

#[tokio::test]
async fn test_compose_multiple_workflows_fail_fast() {
    let registry = generic_handlers();
    registry.register_fn("broken", |_| async move {
        Err::<StepOutput, _>(HandlerError::permanent("always down"))
    });
    let composer = composer_with(registry);

    let template = TemplateDecomposer::new();
    let single = SingleStep("broken");
    let err = composer
        .compose_multiple_workflows(
            "an unclassifiable chore",
            &[&template, &single],
            &serde_json::json!({}),
            &ConfigOverrides::default(),
        )
        .await
        .unwrap_err();

    // One failed sub-workflow fails the whole batch, even though the
    // template workflow completed.
    assert_eq!(err.code(), "permanent_task_failure");
}

#[tokio::test]
async fn test_decomposition_bounds_respected_via_overrides() {
    let composer = composer_with(generic_handlers());
    let err = composer
        .compose_from_goal(
            "an unclassifiable chore",
            &TemplateDecomposer::new(),
            serde_json::json!({}),
            &HashMap::new(),
            &ConfigOverrides {
                max_depth: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "validation_error");
}

#[tokio::test]
async fn test_run_status_unknown_run() {
    let composer = composer_with(HandlerRegistry::new());
    let err = composer.run_status(uuid::Uuid::new_v4()).await.unwrap_err();
    assert_eq!(err.code(), "validation_error");
}

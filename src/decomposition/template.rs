//! # Template Decomposer
//!
//! Rule-based template expansion: classifies goal text by keyword match
//! into a category and expands the category's fixed template with its
//! pre-declared dependency chain. Unmatched goals fall back to a generic
//! four-step plan. This is deliberately not free-form planning; callers
//! needing goal-specific decomposition substitute their own [`Decomposer`].

use super::Decomposer;
use crate::error::Result;
use crate::models::TaskDescriptor;
use async_trait::async_trait;
use std::fmt;

/// Goal categories recognized by keyword classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoalCategory {
    Authentication,
    Deployment,
    Microservices,
    DataPipeline,
    MlPipeline,
    Generic,
}

impl fmt::Display for GoalCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authentication => write!(f, "authentication"),
            Self::Deployment => write!(f, "deployment"),
            Self::Microservices => write!(f, "microservices"),
            Self::DataPipeline => write!(f, "data-pipeline"),
            Self::MlPipeline => write!(f, "ml-pipeline"),
            Self::Generic => write!(f, "generic"),
        }
    }
}

const CATEGORY_KEYWORDS: &[(GoalCategory, &[&str])] = &[
    (
        GoalCategory::Authentication,
        &["auth", "login", "sso", "oauth", "session", "credential"],
    ),
    (
        GoalCategory::Deployment,
        &["deploy", "release", "rollout", "blue-green", "canary"],
    ),
    (
        GoalCategory::Microservices,
        &["microservice", "service mesh", "service boundaries"],
    ),
    (
        GoalCategory::DataPipeline,
        &["etl", "data pipeline", "ingest", "warehouse"],
    ),
    (
        GoalCategory::MlPipeline,
        &["machine learning", "ml pipeline", "train", "model"],
    ),
];

/// Classify goal text; the first category with a keyword hit wins.
pub fn classify(goal: &str) -> GoalCategory {
    let lowered = goal.to_lowercase();
    for (category, keywords) in CATEGORY_KEYWORDS {
        if keywords.iter().any(|k| lowered.contains(k)) {
            return *category;
        }
    }
    GoalCategory::Generic
}

fn task(id: &str, description: &str, deps: &[&str]) -> TaskDescriptor {
    TaskDescriptor::new(id, description).depends_on(deps)
}

/// Fixed template for a category.
pub fn template_for(category: GoalCategory) -> Vec<TaskDescriptor> {
    match category {
        GoalCategory::Authentication => vec![
            task("design_auth_schema", "Design the account and credential schema", &[]),
            task(
                "implement_credential_store",
                "Implement hashed credential storage",
                &["design_auth_schema"],
            ),
            task(
                "implement_token_service",
                "Implement token issuing and validation",
                &["design_auth_schema"],
            ),
            task(
                "build_login_flow",
                "Build the login and logout flow",
                &["implement_credential_store", "implement_token_service"],
            ),
            task(
                "add_session_management",
                "Add session persistence and expiry",
                &["build_login_flow"],
            ),
            task(
                "verify_auth_flows",
                "Verify the full authentication flows",
                &["add_session_management"],
            ),
        ],
        GoalCategory::Deployment => vec![
            task("build_artifacts", "Build deployable artifacts", &[]),
            task("provision_environment", "Provision the target environment", &[]),
            task("run_test_suite", "Run the test suite against the build", &["build_artifacts"]),
            task(
                "push_artifacts",
                "Push artifacts to the environment",
                &["run_test_suite", "provision_environment"],
            ),
            task("roll_out", "Roll the new version out", &["push_artifacts"]),
            task("verify_rollout", "Verify health after rollout", &["roll_out"]),
        ],
        GoalCategory::Microservices => vec![
            task("define_service_boundaries", "Define service boundaries", &[]),
            task(
                "scaffold_services",
                "Scaffold the individual services",
                &["define_service_boundaries"],
            ),
            task(
                "wire_service_discovery",
                "Wire up service discovery",
                &["scaffold_services"],
            ),
            task(
                "add_inter_service_auth",
                "Add service-to-service authentication",
                &["wire_service_discovery"],
            ),
            task(
                "integration_test_services",
                "Integration-test the service graph",
                &["add_inter_service_auth"],
            ),
        ],
        GoalCategory::DataPipeline => vec![
            task("profile_sources", "Profile the data sources", &[]),
            task("build_ingestion", "Build the ingestion stage", &["profile_sources"]),
            task(
                "build_transformations",
                "Build the transformation stage",
                &["build_ingestion"],
            ),
            task("load_warehouse", "Load into the warehouse", &["build_transformations"]),
            task("validate_loads", "Validate loaded data", &["load_warehouse"]),
        ],
        GoalCategory::MlPipeline => vec![
            task("collect_training_data", "Collect and label training data", &[]),
            task(
                "engineer_features",
                "Engineer model features",
                &["collect_training_data"],
            ),
            task("train_model", "Train the model", &["engineer_features"]),
            task("evaluate_model", "Evaluate against the holdout set", &["train_model"]),
            task("register_model", "Register the approved model", &["evaluate_model"]),
        ],
        GoalCategory::Generic => vec![
            task("analyze", "Analyze the goal and constraints", &[]),
            task("plan", "Plan the work", &["analyze"]),
            task("execute", "Execute the plan", &["plan"]),
            task("verify", "Verify the outcome", &["execute"]),
        ],
    }
}

/// Built-in keyword-template decomposition strategy.
#[derive(Debug, Default, Clone)]
pub struct TemplateDecomposer;

impl TemplateDecomposer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Decomposer for TemplateDecomposer {
    fn name(&self) -> &str {
        "template"
    }

    async fn decompose(&self, goal: &str) -> Result<Vec<TaskDescriptor>> {
        let category = classify(goal);
        tracing::debug!(goal = goal, category = %category, "goal classified");
        Ok(template_for(category))
    }
}

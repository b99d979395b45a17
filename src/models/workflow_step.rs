use crate::error::Result;
use crate::models::task_graph::GraphStep;
use crate::state_machine::StepState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

/// A DAG node with a handler reference. Maps to `taskweave_workflow_steps`.
///
/// Rows are mutated only by the executor; everything else reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct WorkflowStep {
    pub run_id: Uuid,
    pub slug: String,
    pub description: String,
    pub handler: String,
    pub status: String,
    pub attempt_count: i32,
    pub result: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

const STEP_COLUMNS: &str = "run_id, slug, description, handler, status, attempt_count, result, error, created_at, started_at, completed_at";

impl WorkflowStep {
    pub fn state(&self) -> StepState {
        self.status.parse().unwrap_or_default()
    }

    /// Insert all steps of a graph for a run, in `pending` state.
    pub async fn create_for_run(pool: &PgPool, run_id: Uuid, steps: &[GraphStep]) -> Result<()> {
        for step in steps {
            sqlx::query(
                r#"
                INSERT INTO taskweave_workflow_steps
                    (run_id, slug, description, handler, status, attempt_count, created_at)
                VALUES ($1, $2, $3, $4, 'pending', 0, NOW())
                "#,
            )
            .bind(run_id)
            .bind(&step.slug)
            .bind(&step.description)
            .bind(&step.handler)
            .execute(pool)
            .await?;
        }
        Ok(())
    }

    pub async fn find_by_run(pool: &PgPool, run_id: Uuid) -> Result<Vec<WorkflowStep>> {
        let steps = sqlx::query_as::<_, WorkflowStep>(&format!(
            "SELECT {STEP_COLUMNS} FROM taskweave_workflow_steps WHERE run_id = $1 ORDER BY created_at, slug"
        ))
        .bind(run_id)
        .fetch_all(pool)
        .await?;

        Ok(steps)
    }

    pub async fn find(pool: &PgPool, run_id: Uuid, slug: &str) -> Result<Option<WorkflowStep>> {
        let step = sqlx::query_as::<_, WorkflowStep>(&format!(
            "SELECT {STEP_COLUMNS} FROM taskweave_workflow_steps WHERE run_id = $1 AND slug = $2"
        ))
        .bind(run_id)
        .bind(slug)
        .fetch_optional(pool)
        .await?;

        Ok(step)
    }

    pub async fn mark_ready(pool: &PgPool, run_id: Uuid, slug: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE taskweave_workflow_steps
            SET status = 'ready'
            WHERE run_id = $1 AND slug = $2 AND status = 'pending'
            "#,
        )
        .bind(run_id)
        .bind(slug)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Transition to `running`, incrementing the attempt counter.
    /// Returns the new attempt count.
    pub async fn mark_running(pool: &PgPool, run_id: Uuid, slug: &str) -> Result<i32> {
        let row: (i32,) = sqlx::query_as(
            r#"
            UPDATE taskweave_workflow_steps
            SET status = 'running', attempt_count = attempt_count + 1, started_at = NOW()
            WHERE run_id = $1 AND slug = $2
            RETURNING attempt_count
            "#,
        )
        .bind(run_id)
        .bind(slug)
        .fetch_one(pool)
        .await?;
        Ok(row.0)
    }

    pub async fn mark_complete(
        pool: &PgPool,
        run_id: Uuid,
        slug: &str,
        result: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE taskweave_workflow_steps
            SET status = 'complete', result = $3, completed_at = NOW()
            WHERE run_id = $1 AND slug = $2
            "#,
        )
        .bind(run_id)
        .bind(slug)
        .bind(result)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn mark_failed(
        pool: &PgPool,
        run_id: Uuid,
        slug: &str,
        error: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE taskweave_workflow_steps
            SET status = 'failed', error = $3, completed_at = NOW()
            WHERE run_id = $1 AND slug = $2
            "#,
        )
        .bind(run_id)
        .bind(slug)
        .bind(error)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn mark_retrying(
        pool: &PgPool,
        run_id: Uuid,
        slug: &str,
        error: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE taskweave_workflow_steps
            SET status = 'retrying', error = $3
            WHERE run_id = $1 AND slug = $2
            "#,
        )
        .bind(run_id)
        .bind(slug)
        .bind(error)
        .execute(pool)
        .await?;
        Ok(())
    }
}

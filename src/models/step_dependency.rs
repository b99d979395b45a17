use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

/// A directed dependency edge between two steps within a run.
/// Maps to `taskweave_step_dependencies`.
///
/// Edges are insert-only: there are no update or delete operations, making
/// the table an immutable audit trail of the graph as it was built.
/// Acyclicity is not enforced here; the graph-build path validates before
/// persisting (see `TaskGraph::build`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct StepDependency {
    pub run_id: Uuid,
    pub step_slug: String,
    pub depends_on_step: String,
    pub created_at: DateTime<Utc>,
}

/// Field-presence validation shared by every edge-recording path.
pub(crate) fn validate_edge(run_id: Uuid, step_slug: &str, depends_on_step: &str) -> Result<()> {
    if run_id.is_nil() {
        return Err(EngineError::validation("run_id is required"));
    }
    if step_slug.is_empty() {
        return Err(EngineError::validation("step_slug is required"));
    }
    if depends_on_step.is_empty() {
        return Err(EngineError::validation("depends_on_step is required"));
    }
    Ok(())
}

impl StepDependency {
    /// Record an edge: `step_slug` depends on `depends_on_step`.
    pub async fn record(
        pool: &PgPool,
        run_id: Uuid,
        step_slug: &str,
        depends_on_step: &str,
    ) -> Result<StepDependency> {
        validate_edge(run_id, step_slug, depends_on_step)?;

        let edge = sqlx::query_as::<_, StepDependency>(
            r#"
            INSERT INTO taskweave_step_dependencies (run_id, step_slug, depends_on_step, created_at)
            VALUES ($1, $2, $3, NOW())
            RETURNING run_id, step_slug, depends_on_step, created_at
            "#,
        )
        .bind(run_id)
        .bind(step_slug)
        .bind(depends_on_step)
        .fetch_one(pool)
        .await?;

        Ok(edge)
    }

    /// Slugs that `step_slug` depends on (must complete before it).
    pub async fn find_dependencies(
        pool: &PgPool,
        run_id: Uuid,
        step_slug: &str,
    ) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT depends_on_step
            FROM taskweave_step_dependencies
            WHERE run_id = $1 AND step_slug = $2
            "#,
        )
        .bind(run_id)
        .bind(step_slug)
        .fetch_all(pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    /// Slugs that depend on `step_slug`.
    pub async fn find_dependents(
        pool: &PgPool,
        run_id: Uuid,
        step_slug: &str,
    ) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT step_slug
            FROM taskweave_step_dependencies
            WHERE run_id = $1 AND depends_on_step = $2
            "#,
        )
        .bind(run_id)
        .bind(step_slug)
        .fetch_all(pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    /// All edges recorded for a run.
    pub async fn find_by_run(pool: &PgPool, run_id: Uuid) -> Result<Vec<StepDependency>> {
        let edges = sqlx::query_as::<_, StepDependency>(
            r#"
            SELECT run_id, step_slug, depends_on_step, created_at
            FROM taskweave_step_dependencies
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .fetch_all(pool)
        .await?;

        Ok(edges)
    }

    /// Steps of a run with zero outgoing dependency rows.
    pub async fn find_root_steps(pool: &PgPool, run_id: Uuid) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT ws.slug
            FROM taskweave_workflow_steps ws
            WHERE ws.run_id = $1
              AND NOT EXISTS (
                SELECT 1
                FROM taskweave_step_dependencies sd
                WHERE sd.run_id = ws.run_id AND sd.step_slug = ws.slug
              )
            ORDER BY ws.created_at, ws.slug
            "#,
        )
        .bind(run_id)
        .fetch_all(pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    /// Check whether inserting `step_slug -> depends_on_step` would close a
    /// cycle, i.e. whether a dependency path already leads from
    /// `depends_on_step` back to `step_slug`. For callers inserting edges
    /// incrementally outside the validated build path.
    pub async fn would_create_cycle(
        pool: &PgPool,
        run_id: Uuid,
        step_slug: &str,
        depends_on_step: &str,
    ) -> Result<bool> {
        if step_slug == depends_on_step {
            return Ok(true);
        }
        let row: (i64,) = sqlx::query_as(
            r#"
            WITH RECURSIVE dep_path AS (
                SELECT step_slug, depends_on_step, 1 AS depth
                FROM taskweave_step_dependencies
                WHERE run_id = $1 AND step_slug = $2

                UNION ALL

                SELECT sd.step_slug, sd.depends_on_step, dp.depth + 1
                FROM dep_path dp
                JOIN taskweave_step_dependencies sd
                  ON sd.run_id = $1 AND sd.step_slug = dp.depends_on_step
                WHERE dp.depth < 100
            )
            SELECT COUNT(*) FROM dep_path WHERE depends_on_step = $3
            "#,
        )
        .bind(run_id)
        .bind(depends_on_step)
        .bind(step_slug)
        .fetch_one(pool)
        .await?;

        Ok(row.0 > 0)
    }
}

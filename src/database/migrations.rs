//! Idempotent schema setup for the engine's three tables.

use crate::error::Result;
use sqlx::PgPool;
use tracing::info;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS taskweave_workflow_runs (
        run_id UUID PRIMARY KEY,
        workflow_name TEXT NOT NULL,
        input JSONB NOT NULL,
        status TEXT NOT NULL,
        result JSONB,
        error JSONB,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        completed_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS taskweave_workflow_steps (
        run_id UUID NOT NULL REFERENCES taskweave_workflow_runs(run_id),
        slug TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        handler TEXT NOT NULL,
        status TEXT NOT NULL,
        attempt_count INT NOT NULL DEFAULT 0,
        result JSONB,
        error JSONB,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        started_at TIMESTAMPTZ,
        completed_at TIMESTAMPTZ,
        PRIMARY KEY (run_id, slug)
    )
    "#,
    // Insert-only audit trail; no unique constraint beyond the columns
    // themselves and deliberately no cycle enforcement.
    r#"
    CREATE TABLE IF NOT EXISTS taskweave_step_dependencies (
        run_id UUID NOT NULL,
        step_slug TEXT NOT NULL,
        depends_on_step TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_taskweave_steps_run_status
        ON taskweave_workflow_steps (run_id, status)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_taskweave_deps_step
        ON taskweave_step_dependencies (run_id, step_slug)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_taskweave_deps_depends_on
        ON taskweave_step_dependencies (run_id, depends_on_step)
    "#,
];

/// Apply the schema. Safe to run on every startup.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    info!("schema migrations applied");
    Ok(())
}

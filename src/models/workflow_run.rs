use crate::error::{EngineError, Result};
use crate::state_machine::RunState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

/// One execution instance of a workflow against specific input.
/// Maps to `taskweave_workflow_runs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct WorkflowRun {
    pub run_id: Uuid,
    pub workflow_name: String,
    pub input: serde_json::Value,
    pub status: String,
    pub result: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    pub fn state(&self) -> RunState {
        self.status.parse().unwrap_or_default()
    }

    /// Create a new run in `pending` state.
    pub async fn create(
        pool: &PgPool,
        workflow_name: &str,
        input: &serde_json::Value,
    ) -> Result<WorkflowRun> {
        let run = sqlx::query_as::<_, WorkflowRun>(
            r#"
            INSERT INTO taskweave_workflow_runs (run_id, workflow_name, input, status, created_at)
            VALUES ($1, $2, $3, 'pending', NOW())
            RETURNING run_id, workflow_name, input, status, result, error, created_at, completed_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(workflow_name)
        .bind(input)
        .fetch_one(pool)
        .await?;

        Ok(run)
    }

    pub async fn find_by_id(pool: &PgPool, run_id: Uuid) -> Result<Option<WorkflowRun>> {
        let run = sqlx::query_as::<_, WorkflowRun>(
            r#"
            SELECT run_id, workflow_name, input, status, result, error, created_at, completed_at
            FROM taskweave_workflow_runs
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .fetch_optional(pool)
        .await?;

        Ok(run)
    }

    /// Transition `pending -> in_progress`. The WHERE guard keeps a
    /// concurrent duplicate start from double-transitioning.
    pub async fn mark_in_progress(pool: &PgPool, run_id: Uuid) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE taskweave_workflow_runs
            SET status = 'in_progress'
            WHERE run_id = $1 AND status = 'pending'
            "#,
        )
        .bind(run_id)
        .execute(pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(EngineError::validation(format!(
                "run {run_id} is not pending"
            )));
        }
        Ok(())
    }

    /// Move the run into a terminal state and stamp completion.
    pub async fn finalize(
        pool: &PgPool,
        run_id: Uuid,
        state: RunState,
        result: Option<&serde_json::Value>,
        error: Option<&serde_json::Value>,
    ) -> Result<()> {
        if !state.is_terminal() {
            return Err(EngineError::validation(format!(
                "cannot finalize run {run_id} into non-terminal state {state}"
            )));
        }
        sqlx::query(
            r#"
            UPDATE taskweave_workflow_runs
            SET status = $2, result = $3, error = $4, completed_at = NOW()
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .bind(state.to_string())
        .bind(result)
        .bind(error)
        .execute(pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_run(status: &str) -> WorkflowRun {
        WorkflowRun {
            run_id: Uuid::new_v4(),
            workflow_name: "deploy".to_string(),
            input: serde_json::json!({"env": "staging"}),
            status: status.to_string(),
            result: None,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    #[test]
    fn test_state_parsing() {
        assert_eq!(sample_run("in_progress").state(), RunState::InProgress);
        assert_eq!(sample_run("timed_out").state(), RunState::TimedOut);
        // Unknown strings degrade to the initial state rather than panic
        assert_eq!(sample_run("garbage").state(), RunState::Pending);
    }

    #[test]
    fn test_run_serde_roundtrip() {
        let run = sample_run("complete");
        let json = serde_json::to_string(&run).unwrap();
        let parsed: WorkflowRun = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, run);
    }
}

//! # System Constants
//!
//! Queue names, notify channels, and default tuning values shared across
//! the engine and its external collaborators.

/// Durable queue names for the channels the engine owns or serves.
pub mod queues {
    /// Step execution requests consumed by workers.
    pub const TASK_REQUESTS: &str = "taskweave_task_requests";

    /// Prefix for per-run result reply queues.
    pub const TASK_RESULTS_PREFIX: &str = "taskweave_task_results";

    /// Decomposition requests served by external planners.
    pub const DECOMPOSITION_REQUESTS: &str = "taskweave_decomposition_requests";

    /// Human-in-the-loop approval requests (consumed by the approval UI).
    pub const APPROVAL_REQUESTS: &str = "taskweave_approval_requests";

    /// Approval decisions published back by the approval UI.
    pub const APPROVAL_DECISIONS: &str = "taskweave_approval_decisions";

    /// Rule-update broadcasts from the rule-publishing subsystem.
    pub const RULE_UPDATES: &str = "taskweave_rule_updates";

    /// Reply queue name for a specific run.
    pub fn task_results_for_run(run_id: &uuid::Uuid) -> String {
        format!("{}_{}", TASK_RESULTS_PREFIX, run_id.simple())
    }
}

/// LISTEN/NOTIFY channel used to wake polling executors.
pub const WAKE_CHANNEL: &str = "taskweave_wake";

/// Status string groups used in SQL predicates.
pub mod status_groups {
    /// Step states that satisfy a dependency edge.
    pub const STEP_SATISFIED: &[&str] = &["complete"];

    /// Step states from which no further transition is allowed.
    pub const STEP_TERMINAL: &[&str] = &["complete", "failed"];

    /// Run states from which no further transition is allowed.
    pub const RUN_TERMINAL: &[&str] = &["complete", "failed", "timed_out"];
}

/// Default tuning values, overridable through configuration.
pub mod defaults {
    pub const MAX_DEPTH: u32 = 10;
    pub const MAX_PARALLEL: u32 = 4;
    pub const RETRY_ATTEMPTS: u32 = 3;
    pub const TIMEOUT_SECONDS: u64 = 300;
    pub const TASK_TIMEOUT_SECONDS: u64 = 30;
    pub const RETRY_DELAY_MS: u64 = 1_000;
    pub const BACKOFF_MULTIPLIER: f64 = 2.0;
    pub const POLL_INTERVAL_MS: u64 = 50;
    pub const LEASE_SECONDS: u64 = 30;
    pub const QUEUE_BATCH_SIZE: usize = 10;
    pub const PARALLEL_THRESHOLD: u32 = 8;
}

//! # Workflow Executor
//!
//! Readiness-driven scheduler for one run: dispatches ready steps through
//! the task-request queue under bounded concurrency, consumes outcomes
//! from the run's reply queue, applies per-attempt timeouts and retry
//! backoff, propagates permanent failures to dependent subgraphs, and
//! enforces the overall workflow deadline.
//!
//! Every state transition is persisted through the [`RunStore`] before the
//! executor acts on it; the relational store stays the single source of
//! truth, so a crashed executor leaves a reconstructible run behind.

use crate::config::{ExecutionConfig, OptimizationLevel, Optimizer, RetryPolicy};
use crate::constants::queues;
use crate::error::{EngineError, Result};
use crate::messaging::{
    ElementTask, Envelope, FailureInfo, MessageQueue, OutcomeStatus, RequestMetadata, StepOutcome,
    StepRequest,
};
use crate::models::{RunStore, TaskGraph};
use crate::state_machine::{RunState, StepState};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Aggregate execution statistics for a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub steps_total: usize,
    pub steps_completed: usize,
    pub steps_failed: usize,
    pub retries: u32,
    pub elements_dispatched: usize,
    pub duration_ms: u64,
}

/// Terminal failure information for one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepFailureSummary {
    pub code: String,
    pub message: String,
    pub attempts: u32,
}

/// Final state of an executed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub status: RunState,
    /// Results of completed steps, keyed by slug
    pub results: HashMap<String, serde_json::Value>,
    /// Terminal failures, keyed by slug
    pub failures: HashMap<String, StepFailureSummary>,
    pub stats: ExecutionStats,
}

/// One dispatched unit: a step attempt, or one fan-out element of a step.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct DispatchKey {
    slug: String,
    element: Option<usize>,
}

impl DispatchKey {
    fn step(slug: &str) -> Self {
        Self {
            slug: slug.to_string(),
            element: None,
        }
    }

    fn element(slug: &str, index: usize) -> Self {
        Self {
            slug: slug.to_string(),
            element: Some(index),
        }
    }
}

#[derive(Debug)]
struct InFlight {
    attempt: u32,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct FanOutState {
    items: Vec<serde_json::Value>,
    results: Vec<Option<serde_json::Value>>,
    element_attempts: Vec<u32>,
    remaining: usize,
}

#[derive(Debug)]
struct StepRuntime {
    state: StepState,
    attempts: u32,
    result: Option<serde_json::Value>,
    failure: Option<StepFailureSummary>,
    fan_out: Option<FanOutState>,
}

impl StepRuntime {
    fn new() -> Self {
        Self {
            state: StepState::Pending,
            attempts: 0,
            result: None,
            failure: None,
            fan_out: None,
        }
    }
}

struct ExecutionState<'g> {
    run_id: Uuid,
    graph: &'g TaskGraph,
    run_input: serde_json::Value,
    results_queue: String,
    policy: RetryPolicy,
    /// Total attempts allowed per unit: first attempt + retries
    attempt_budget: u32,
    task_timeout: Duration,
    runtime: HashMap<String, StepRuntime>,
    in_flight: HashMap<DispatchKey, InFlight>,
    dispatchable: VecDeque<DispatchKey>,
    retries: BinaryHeap<Reverse<(Instant, DispatchKey)>>,
    /// Timeouts synthesized by the watchdog, fed through outcome handling
    pending_timeouts: Vec<StepOutcome>,
    stats: ExecutionStats,
}

enum LoopEnd {
    Finished,
    TimedOut,
    Cancelled,
}

/// Executes a single run's task graph to a terminal state.
pub struct WorkflowExecutor {
    store: Arc<dyn RunStore>,
    queue: Arc<dyn MessageQueue>,
    config: ExecutionConfig,
    optimizer: Option<Arc<Optimizer>>,
    optimization_level: Option<OptimizationLevel>,
    decomposer_type: String,
    wake: Option<Arc<Notify>>,
    cancel: CancellationToken,
}

impl WorkflowExecutor {
    pub fn new(
        store: Arc<dyn RunStore>,
        queue: Arc<dyn MessageQueue>,
        config: ExecutionConfig,
    ) -> Self {
        let wake = queue.waker();
        Self {
            store,
            queue,
            config,
            optimizer: None,
            optimization_level: None,
            decomposer_type: "default".to_string(),
            wake,
            cancel: CancellationToken::new(),
        }
    }

    /// Enable adaptive tuning: the optimizer feeds the retry budget and the
    /// level scales per-attempt timeouts.
    pub fn with_optimizer(
        mut self,
        optimizer: Arc<Optimizer>,
        level: OptimizationLevel,
        decomposer_type: impl Into<String>,
    ) -> Self {
        self.optimizer = Some(optimizer);
        self.optimization_level = Some(level);
        self.decomposer_type = decomposer_type.into();
        self
    }

    /// Wake handle from an external notify listener; defaults to the
    /// queue's own waker when it has one.
    pub fn with_wake(mut self, wake: Arc<Notify>) -> Self {
        self.wake = Some(wake);
        self
    }

    /// Token cancelled when the run stops dispatching (deadline or
    /// shutdown). Hand it to co-located workers.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Execute the run's graph to completion, failure, or timeout.
    ///
    /// Returns `Ok` with the outcome for runs reaching `complete` or
    /// `failed` (partial-failure data preserved); `Err` for validation
    /// faults, the workflow deadline, and infrastructure failures. In
    /// every case the run is left in a terminal state first.
    #[instrument(skip(self, graph), fields(run_id = %run_id))]
    pub async fn execute(&self, run_id: Uuid, graph: &TaskGraph) -> Result<RunOutcome> {
        let started = Instant::now();
        let deadline = started + self.config.workflow_timeout;

        let run = self
            .store
            .fetch_run(run_id)
            .await?
            .ok_or_else(|| EngineError::validation(format!("unknown run {run_id}")))?;

        // Queues first: a queue failure here leaves the run untouched in
        // `pending`. Once the run is in_progress, every fault must end in
        // a terminal run state before it crosses the executor boundary.
        let results_queue = queues::task_results_for_run(&run_id);
        self.queue.create_queue(queues::TASK_REQUESTS).await?;
        self.queue.create_queue(&results_queue).await?;
        self.store.mark_run_in_progress(run_id).await?;

        let policy = match &self.optimizer {
            Some(optimizer) => optimizer.policy_for(&self.decomposer_type, &self.config),
            None => RetryPolicy::from_execution_config(&self.config),
        };
        let task_timeout = match self.optimization_level {
            Some(level) => level.scaled_timeout(self.config.task_timeout),
            None => self.config.task_timeout,
        };

        let mut state = ExecutionState {
            run_id,
            graph,
            run_input: run.input,
            results_queue,
            attempt_budget: policy.max_attempts + 1,
            policy,
            task_timeout,
            runtime: graph
                .slugs()
                .iter()
                .map(|slug| (slug.clone(), StepRuntime::new()))
                .collect(),
            in_flight: HashMap::new(),
            dispatchable: VecDeque::new(),
            retries: BinaryHeap::new(),
            pending_timeouts: Vec::new(),
            stats: ExecutionStats {
                steps_total: graph.len(),
                ..Default::default()
            },
        };

        let end = match self.prepare_roots(&mut state).await {
            Ok(()) => self.run_loop(&mut state, deadline).await,
            Err(e) => Err(e),
        };
        state.stats.duration_ms = started.elapsed().as_millis() as u64;

        // Late results on the reply queue are garbage once the run is
        // terminal; drop them.
        let _ = self.queue.purge_queue(&state.results_queue).await;

        match end {
            Ok(LoopEnd::Finished) => self.finalize_finished(state).await,
            Ok(LoopEnd::TimedOut) => {
                self.cancel.cancel();
                let error = serde_json::json!({
                    "code": "workflow_timeout",
                    "message": format!(
                        "workflow exceeded {}s",
                        self.config.workflow_timeout.as_secs()
                    ),
                });
                self.store
                    .finalize_run(run_id, RunState::TimedOut, None, Some(error))
                    .await?;
                Err(EngineError::WorkflowTimeout {
                    run_id,
                    timeout_seconds: self.config.workflow_timeout.as_secs(),
                })
            }
            Ok(LoopEnd::Cancelled) => {
                let error = serde_json::json!({
                    "code": "cancelled",
                    "message": "execution cancelled before completion",
                });
                self.store
                    .finalize_run(run_id, RunState::Failed, None, Some(error))
                    .await?;
                Err(EngineError::infrastructure(
                    "execution cancelled before completion",
                ))
            }
            Err(e) => {
                // Infrastructure fault: stop dispatching and surface it,
                // but leave the run terminal first.
                self.cancel.cancel();
                let error = serde_json::json!({
                    "code": e.code(),
                    "message": e.to_string(),
                });
                let _ = self
                    .store
                    .finalize_run(run_id, RunState::Failed, None, Some(error))
                    .await;
                Err(e)
            }
        }
    }

    /// Root steps (zero dependency rows) are ready immediately.
    async fn prepare_roots(&self, state: &mut ExecutionState<'_>) -> Result<()> {
        for slug in self.store.find_root_steps(state.run_id).await? {
            self.store.mark_step_ready(state.run_id, &slug).await?;
            if let Some(step) = state.runtime.get_mut(&slug) {
                step.state = StepState::Ready;
            }
            state.dispatchable.push_back(DispatchKey::step(&slug));
        }
        Ok(())
    }

    async fn run_loop(
        &self,
        state: &mut ExecutionState<'_>,
        deadline: Instant,
    ) -> Result<LoopEnd> {
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(LoopEnd::TimedOut);
            }

            // Promote retries whose backoff has elapsed.
            while let Some(Reverse((due, _))) = state.retries.peek() {
                if *due > now {
                    break;
                }
                let Some(Reverse((_, key))) = state.retries.pop() else {
                    break;
                };
                state.dispatchable.push_back(key);
            }

            // Dispatch up to the concurrency bound.
            while state.in_flight.len() < self.config.max_parallel as usize {
                let Some(key) = state.dispatchable.pop_front() else {
                    break;
                };
                self.dispatch(state, key).await?;
            }

            if self.all_terminal(state) {
                return Ok(LoopEnd::Finished);
            }

            // Sleep until something can happen: a result poll, a retry
            // becoming due, an in-flight deadline, or the run deadline.
            let mut wait = self.config.poll_interval;
            if let Some(Reverse((due, _))) = state.retries.peek() {
                wait = wait.min(due.saturating_duration_since(now));
            }
            for inflight in state.in_flight.values() {
                wait = wait.min(inflight.deadline.saturating_duration_since(now));
            }
            wait = wait
                .min(deadline.saturating_duration_since(now))
                .max(Duration::from_millis(1));

            let cancelled = self.wait_for_activity(wait).await;
            if cancelled {
                return Ok(LoopEnd::Cancelled);
            }

            self.drain_results(state).await?;
            self.sweep_overdue(state);
            let timeouts: Vec<StepOutcome> = state.pending_timeouts.drain(..).collect();
            for outcome in timeouts {
                self.handle_outcome(state, outcome).await?;
            }
        }
    }

    async fn wait_for_activity(&self, wait: Duration) -> bool {
        match &self.wake {
            Some(wake) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => true,
                    _ = wake.notified() => false,
                    _ = tokio::time::sleep(wait) => false,
                }
            }
            None => {
                tokio::select! {
                    _ = self.cancel.cancelled() => true,
                    _ = tokio::time::sleep(wait) => false,
                }
            }
        }
    }

    async fn dispatch(&self, state: &mut ExecutionState<'_>, key: DispatchKey) -> Result<()> {
        let Some(step) = state.graph.get(&key.slug) else {
            return Err(EngineError::dependency(format!(
                "dispatched unknown step '{}'",
                key.slug
            )));
        };
        let input = self.accumulated_input(state, &key.slug);

        let (attempt, element) = match key.element {
            None => {
                let attempt = self.store.mark_step_running(state.run_id, &key.slug).await?;
                let runtime = state
                    .runtime
                    .get_mut(&key.slug)
                    .expect("runtime entry exists for graph step");
                runtime.state = StepState::Running;
                runtime.attempts = attempt;
                (attempt, None)
            }
            Some(index) => {
                let runtime = state
                    .runtime
                    .get_mut(&key.slug)
                    .expect("runtime entry exists for graph step");
                let fan = runtime
                    .fan_out
                    .as_mut()
                    .expect("element dispatch implies fan-out state");
                fan.element_attempts[index] += 1;
                let attempt = fan.element_attempts[index];
                let item = fan.items[index].clone();
                state.stats.elements_dispatched += 1;
                (attempt, Some(ElementTask { index, item }))
            }
        };

        let request = StepRequest {
            run_id: state.run_id,
            step_slug: key.slug.clone(),
            handler: step.handler.clone(),
            input,
            element,
            metadata: RequestMetadata {
                attempt,
                max_attempts: state.attempt_budget,
                timeout_ms: state.task_timeout.as_millis() as u64,
                enqueued_at: Utc::now(),
            },
        };
        let envelope = Envelope::wrap(&request)?.with_response_queue(state.results_queue.clone());
        self.queue
            .publish(queues::TASK_REQUESTS, &envelope.to_value()?)
            .await?;

        debug!(step = %key.slug, element = ?key.element, attempt = attempt, "dispatched");
        // Executor-side watchdog: generous slack past the worker's own
        // timeout so a lost worker cannot wedge the run.
        let slack = self.config.poll_interval * 4 + Duration::from_millis(250);
        state.in_flight.insert(
            key,
            InFlight {
                attempt,
                deadline: Instant::now() + state.task_timeout + slack,
            },
        );
        Ok(())
    }

    /// Accumulated input: the run input object merged with each satisfied
    /// dependency's named output.
    fn accumulated_input(&self, state: &ExecutionState<'_>, slug: &str) -> serde_json::Value {
        let mut merged = match &state.run_input {
            serde_json::Value::Object(map) => map.clone(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("input".to_string(), other.clone());
                map
            }
        };
        for dep in state.graph.dependencies_of(slug) {
            if let Some(result) = state.runtime.get(dep).and_then(|r| r.result.clone()) {
                merged.insert(dep.to_string(), result);
            }
        }
        serde_json::Value::Object(merged)
    }

    async fn drain_results(&self, state: &mut ExecutionState<'_>) -> Result<()> {
        loop {
            let messages = self
                .queue
                .read_messages(
                    &state.results_queue,
                    Duration::from_secs(30),
                    self.config.max_parallel as usize,
                )
                .await?;
            if messages.is_empty() {
                return Ok(());
            }
            for message in messages {
                match Envelope::from_value(&message.payload).and_then(|e| e.open::<StepOutcome>())
                {
                    Ok(outcome) => self.handle_outcome(state, outcome).await?,
                    Err(e) => warn!(error = %e, "dropping undecodable outcome"),
                }
                self.queue.ack(&state.results_queue, message.id).await?;
            }
        }
    }

    /// Synthesize timeout failures for dispatches whose results never
    /// arrived (lost worker, lost reply).
    fn sweep_overdue(&self, state: &mut ExecutionState<'_>) {
        let now = Instant::now();
        let overdue: Vec<(DispatchKey, u32)> = state
            .in_flight
            .iter()
            .filter(|(_, info)| info.deadline <= now)
            .map(|(key, info)| (key.clone(), info.attempt))
            .collect();
        for (key, attempt) in overdue {
            warn!(step = %key.slug, element = ?key.element, "no result before watchdog deadline");
            state.pending_timeouts.push(StepOutcome {
                run_id: state.run_id,
                step_slug: key.slug.clone(),
                attempt,
                element_index: key.element,
                status: OutcomeStatus::TimedOut,
                output: None,
                fan_out: None,
                error: Some(FailureInfo {
                    code: "task_timeout".to_string(),
                    message: "no result before the attempt deadline".to_string(),
                    retryable: true,
                }),
                execution_time_ms: state.task_timeout.as_millis() as u64,
                completed_at: Utc::now(),
            });
        }
    }

    async fn handle_outcome(
        &self,
        state: &mut ExecutionState<'_>,
        outcome: StepOutcome,
    ) -> Result<()> {
        let key = match outcome.element_index {
            Some(index) => DispatchKey::element(&outcome.step_slug, index),
            None => DispatchKey::step(&outcome.step_slug),
        };

        // Late or duplicate results (redelivery, abandoned attempts) are
        // dropped by attempt matching.
        let matches = state
            .in_flight
            .get(&key)
            .map(|info| info.attempt == outcome.attempt)
            .unwrap_or(false);
        if !matches {
            debug!(step = %outcome.step_slug, attempt = outcome.attempt, "dropping stale outcome");
            return Ok(());
        }
        let step_state = state
            .runtime
            .get(&outcome.step_slug)
            .map(|r| r.state)
            .unwrap_or(StepState::Failed);
        if step_state != StepState::Running {
            debug!(step = %outcome.step_slug, "dropping outcome for non-running step");
            state.in_flight.remove(&key);
            return Ok(());
        }
        state.in_flight.remove(&key);

        if let Some(optimizer) = &self.optimizer {
            optimizer.record_outcome(
                &self.decomposer_type,
                outcome.status == OutcomeStatus::Success,
                Duration::from_millis(outcome.execution_time_ms),
            );
        }

        match key.element {
            None => self.handle_step_outcome(state, key, outcome).await,
            Some(index) => self.handle_element_outcome(state, key, index, outcome).await,
        }
    }

    async fn handle_step_outcome(
        &self,
        state: &mut ExecutionState<'_>,
        key: DispatchKey,
        outcome: StepOutcome,
    ) -> Result<()> {
        let slug = key.slug;
        if outcome.status == OutcomeStatus::Success {
            if let Some(items) = outcome.fan_out {
                if items.is_empty() {
                    // A collection with nothing in it completes with an
                    // empty mapping.
                    return self
                        .complete_step(state, &slug, serde_json::json!({}))
                        .await;
                }
                let count = items.len();
                let runtime = state
                    .runtime
                    .get_mut(&slug)
                    .expect("runtime entry exists for graph step");
                runtime.fan_out = Some(FanOutState {
                    results: vec![None; count],
                    element_attempts: vec![0; count],
                    remaining: count,
                    items,
                });
                for index in 0..count {
                    state
                        .dispatchable
                        .push_back(DispatchKey::element(&slug, index));
                }
                debug!(step = %slug, elements = count, "fan-out triggered");
                return Ok(());
            }
            let output = outcome.output.unwrap_or(serde_json::Value::Null);
            return self.complete_step(state, &slug, output).await;
        }

        let error = outcome.error.unwrap_or(FailureInfo {
            code: "handler_failed".to_string(),
            message: "step failed without error detail".to_string(),
            retryable: false,
        });
        let attempt = outcome.attempt;
        if error.retryable && attempt < state.attempt_budget {
            self.schedule_retry(state, DispatchKey::step(&slug), attempt, &slug, error)
                .await
        } else {
            self.fail_step_permanently(state, &slug, error, attempt).await
        }
    }

    async fn handle_element_outcome(
        &self,
        state: &mut ExecutionState<'_>,
        _key: DispatchKey,
        index: usize,
        outcome: StepOutcome,
    ) -> Result<()> {
        let slug = outcome.step_slug.clone();
        let runtime = state
            .runtime
            .get_mut(&slug)
            .expect("runtime entry exists for graph step");
        let Some(fan) = runtime.fan_out.as_mut() else {
            debug!(step = %slug, "element outcome without fan-out state; dropping");
            return Ok(());
        };

        if outcome.status == OutcomeStatus::Success {
            if fan.results[index].is_none() {
                fan.results[index] = Some(outcome.output.unwrap_or(serde_json::Value::Null));
                fan.remaining -= 1;
            }
            if fan.remaining == 0 {
                let mapping = aggregate_fan_out(fan);
                return self.complete_step(state, &slug, mapping).await;
            }
            return Ok(());
        }

        let error = outcome.error.unwrap_or(FailureInfo {
            code: "handler_failed".to_string(),
            message: "element failed without error detail".to_string(),
            retryable: false,
        });
        let attempt = fan.element_attempts[index];
        if error.retryable && attempt < state.attempt_budget {
            self.schedule_retry(
                state,
                DispatchKey::element(&slug, index),
                attempt,
                &slug,
                error,
            )
            .await
        } else {
            // One exhausted element fails the whole map-step. Undispatched
            // sibling elements are withdrawn; in-flight ones get dropped by
            // the non-running-state guard when their results arrive.
            state
                .dispatchable
                .retain(|k| !(k.slug == slug && k.element.is_some()));
            let attempts = state
                .runtime
                .get(&slug)
                .map(|r| r.attempts)
                .unwrap_or(attempt);
            self.fail_step_permanently(state, &slug, error, attempts).await
        }
    }

    async fn schedule_retry(
        &self,
        state: &mut ExecutionState<'_>,
        key: DispatchKey,
        attempt: u32,
        slug: &str,
        error: FailureInfo,
    ) -> Result<()> {
        let delay = state.policy.delay_for_attempt(attempt);
        state.stats.retries += 1;
        if key.element.is_none() {
            self.store
                .mark_step_retrying(
                    state.run_id,
                    slug,
                    &serde_json::json!({"code": error.code, "message": error.message}),
                )
                .await?;
            if let Some(runtime) = state.runtime.get_mut(slug) {
                runtime.state = StepState::Retrying;
            }
        }
        debug!(step = %slug, element = ?key.element, attempt = attempt, delay_ms = delay.as_millis() as u64, "retry scheduled");
        state.retries.push(Reverse((Instant::now() + delay, key)));
        Ok(())
    }

    async fn complete_step(
        &self,
        state: &mut ExecutionState<'_>,
        slug: &str,
        result: serde_json::Value,
    ) -> Result<()> {
        self.store
            .mark_step_complete(state.run_id, slug, &result)
            .await?;
        if let Some(runtime) = state.runtime.get_mut(slug) {
            runtime.state = StepState::Complete;
            runtime.result = Some(result);
            runtime.fan_out = None;
        }
        state.stats.steps_completed += 1;
        info!(step = %slug, "step complete");
        self.promote_dependents(state, slug).await
    }

    /// Recompute readiness of the completed step's dependents: a dependent
    /// becomes ready once every one of its dependencies is complete.
    async fn promote_dependents(&self, state: &mut ExecutionState<'_>, slug: &str) -> Result<()> {
        for dependent in self.store.find_dependents(state.run_id, slug).await? {
            let dependent_state = state
                .runtime
                .get(&dependent)
                .map(|r| r.state)
                .unwrap_or(StepState::Failed);
            if dependent_state != StepState::Pending {
                continue;
            }
            let deps = self.store.find_dependencies(state.run_id, &dependent).await?;
            let satisfied = deps.iter().all(|dep| {
                state
                    .runtime
                    .get(dep)
                    .map(|r| r.state.satisfies_dependencies())
                    .unwrap_or(false)
            });
            if satisfied {
                self.store.mark_step_ready(state.run_id, &dependent).await?;
                if let Some(runtime) = state.runtime.get_mut(&dependent) {
                    runtime.state = StepState::Ready;
                }
                state.dispatchable.push_back(DispatchKey::step(&dependent));
            }
        }
        Ok(())
    }

    async fn fail_step_permanently(
        &self,
        state: &mut ExecutionState<'_>,
        slug: &str,
        error: FailureInfo,
        attempts: u32,
    ) -> Result<()> {
        let summary = StepFailureSummary {
            code: error.code.clone(),
            message: error.message.clone(),
            attempts,
        };
        self.store
            .mark_step_failed(
                state.run_id,
                slug,
                &serde_json::json!({"code": error.code, "message": error.message, "attempts": attempts}),
            )
            .await?;
        if let Some(runtime) = state.runtime.get_mut(slug) {
            runtime.state = StepState::Failed;
            runtime.failure = Some(summary);
            runtime.fan_out = None;
        }
        state.stats.steps_failed += 1;
        warn!(step = %slug, attempts = attempts, "step permanently failed");
        self.cascade_failure(state, slug).await
    }

    /// Short-circuit the failed step's transitive dependents: they are
    /// marked failed without ever running, while independent branches keep
    /// executing.
    async fn cascade_failure(&self, state: &mut ExecutionState<'_>, origin: &str) -> Result<()> {
        let mut to_visit = VecDeque::from([origin.to_string()]);
        let mut seen = HashSet::new();
        while let Some(slug) = to_visit.pop_front() {
            for dependent in self.store.find_dependents(state.run_id, &slug).await? {
                if !seen.insert(dependent.clone()) {
                    continue;
                }
                let dependent_state = state
                    .runtime
                    .get(&dependent)
                    .map(|r| r.state)
                    .unwrap_or(StepState::Failed);
                if dependent_state.is_terminal() {
                    continue;
                }
                let error = serde_json::json!({
                    "code": "dependency_failed",
                    "message": format!("upstream step '{origin}' failed permanently"),
                });
                self.store
                    .mark_step_failed(state.run_id, &dependent, &error)
                    .await?;
                if let Some(runtime) = state.runtime.get_mut(&dependent) {
                    runtime.state = StepState::Failed;
                    runtime.failure = Some(StepFailureSummary {
                        code: "dependency_failed".to_string(),
                        message: format!("upstream step '{origin}' failed permanently"),
                        attempts: 0,
                    });
                }
                state.stats.steps_failed += 1;
                state.dispatchable.retain(|k| k.slug != dependent);
                to_visit.push_back(dependent);
            }
        }
        Ok(())
    }

    fn all_terminal(&self, state: &ExecutionState<'_>) -> bool {
        state.runtime.values().all(|r| r.state.is_terminal())
    }

    async fn finalize_finished(&self, state: ExecutionState<'_>) -> Result<RunOutcome> {
        let mut results = HashMap::new();
        let mut failures = HashMap::new();
        for (slug, runtime) in &state.runtime {
            if let Some(result) = &runtime.result {
                results.insert(slug.clone(), result.clone());
            }
            if let Some(failure) = &runtime.failure {
                failures.insert(slug.clone(), failure.clone());
            }
        }

        let status = if failures.is_empty() {
            RunState::Complete
        } else {
            RunState::Failed
        };
        let (result_json, error_json) = if failures.is_empty() {
            (Some(serde_json::to_value(&results).unwrap_or_default()), None)
        } else {
            (
                Some(serde_json::to_value(&results).unwrap_or_default()),
                Some(serde_json::json!({
                    "code": "permanent_task_failure",
                    "failed_steps": failures.keys().cloned().collect::<Vec<_>>(),
                })),
            )
        };
        self.store
            .finalize_run(state.run_id, status, result_json, error_json)
            .await?;

        info!(
            run_id = %state.run_id,
            status = %status,
            completed = state.stats.steps_completed,
            failed = state.stats.steps_failed,
            retries = state.stats.retries,
            "run finalized"
        );
        Ok(RunOutcome {
            run_id: state.run_id,
            status,
            results,
            failures,
            stats: state.stats,
        })
    }
}

/// Aggregate element results under the step id as a mapping from source
/// item to per-item result. Non-string items use their JSON form; a
/// duplicate item gets an index suffix so no entry is lost.
fn aggregate_fan_out(fan: &FanOutState) -> serde_json::Value {
    let mut mapping = serde_json::Map::new();
    for (index, item) in fan.items.iter().enumerate() {
        let base = match item {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let key = if mapping.contains_key(&base) {
            format!("{base}#{index}")
        } else {
            base
        };
        let value = fan.results[index].clone().unwrap_or(serde_json::Value::Null);
        mapping.insert(key, value);
    }
    serde_json::Value::Object(mapping)
}

//! Executor integration tests against the in-memory store and queue with
//! embedded queue workers. These exercise the scheduling semantics
//! end-to-end: causal ordering, bounded parallelism, retry policy,
//! failure propagation, fan-out, and the workflow deadline.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use taskweave_core::config::{ConfigOverrides, EngineConfig, ExecutionConfig};
use taskweave_core::error::EngineError;
use taskweave_core::messaging::{InMemoryQueue, MessageQueue};
use taskweave_core::models::{MemoryRunStore, RunStore, TaskDescriptor, TaskGraph};
use taskweave_core::orchestration::{
    HandlerError, HandlerRegistry, QueueWorker, RunOutcome, StepHandler, StepOutput,
    WorkflowExecutor,
};
use taskweave_core::state_machine::{RunState, StepState};
use uuid::Uuid;

fn exec_config() -> ExecutionConfig {
    let mut config = EngineConfig::default().execution_config(&ConfigOverrides::default());
    config.retry_delay = Duration::from_millis(10);
    config.jitter = false;
    config.poll_interval = Duration::from_millis(10);
    config
}

struct Harness {
    store: Arc<MemoryRunStore>,
    run_id: Uuid,
    outcome: Result<RunOutcome, EngineError>,
}

/// Persist the graph, run it with embedded workers, and return everything
/// a test might want to inspect.
async fn execute_graph(
    tasks: &[TaskDescriptor],
    registry: HandlerRegistry,
    input: serde_json::Value,
    config: ExecutionConfig,
    workers: usize,
) -> Harness {
    let graph = TaskGraph::build(tasks).expect("valid graph");
    let store = Arc::new(MemoryRunStore::new());
    let queue = Arc::new(InMemoryQueue::new());
    let registry = Arc::new(registry);

    let run_id = store.create_run("test", &input).await.unwrap();
    let steps: Vec<_> = graph.steps().cloned().collect();
    store.insert_steps(run_id, &steps).await.unwrap();
    for step in &steps {
        for dep in &step.depends_on {
            store.record_dependency(run_id, &step.slug, dep).await.unwrap();
        }
    }

    let executor = WorkflowExecutor::new(
        Arc::clone(&store) as Arc<dyn RunStore>,
        Arc::clone(&queue) as Arc<dyn MessageQueue>,
        config,
    );
    let cancel = executor.cancellation_token();
    let handles: Vec<_> = (0..workers)
        .map(|_| {
            QueueWorker::new(
                Arc::clone(&queue) as Arc<dyn MessageQueue>,
                Arc::clone(&registry),
            )
            .spawn(cancel.clone())
        })
        .collect();

    let outcome = executor.execute(run_id, &graph).await;

    cancel.cancel();
    for handle in handles {
        handle.abort();
    }

    Harness {
        store,
        run_id,
        outcome,
    }
}

type EventLog = Arc<parking_lot::Mutex<Vec<String>>>;

fn logging_handler(registry: &HandlerRegistry, name: &str, log: EventLog) {
    let slug = name.to_string();
    registry.register_fn(name, move |_input| {
        let log = Arc::clone(&log);
        let slug = slug.clone();
        async move {
            log.lock().push(format!("start:{slug}"));
            tokio::time::sleep(Duration::from_millis(10)).await;
            log.lock().push(format!("end:{slug}"));
            Ok(StepOutput::value(serde_json::json!({"step": slug})))
        }
    });
}

#[tokio::test]
async fn test_diamond_causal_order() {
    // a -> {b, c} -> d: d must never start before both b and c completed.
    let tasks = vec![
        TaskDescriptor::new("a", "start"),
        TaskDescriptor::new("b", "left").depends_on(&["a"]),
        TaskDescriptor::new("c", "right").depends_on(&["a"]),
        TaskDescriptor::new("d", "join").depends_on(&["b", "c"]),
    ];
    let log: EventLog = Default::default();
    let registry = HandlerRegistry::new();
    for step in ["a", "b", "c", "d"] {
        logging_handler(&registry, step, Arc::clone(&log));
    }

    let harness = execute_graph(&tasks, registry, serde_json::json!({}), exec_config(), 3).await;
    let outcome = harness.outcome.unwrap();
    assert_eq!(outcome.status, RunState::Complete);
    assert_eq!(outcome.results.len(), 4);

    let events = log.lock().clone();
    let index_of = |needle: &str| {
        events
            .iter()
            .position(|e| e == needle)
            .unwrap_or_else(|| panic!("missing event {needle} in {events:?}"))
    };
    assert!(index_of("start:d") > index_of("end:b"));
    assert!(index_of("start:d") > index_of("end:c"));
    assert!(index_of("start:b") > index_of("end:a"));
    assert!(index_of("start:c") > index_of("end:a"));
}

#[tokio::test]
async fn test_chain_failure_short_circuits_but_sibling_completes() {
    // a -> b -> c with an independent sibling branch.
    let tasks = vec![
        TaskDescriptor::new("a", "fails"),
        TaskDescriptor::new("b", "downstream").depends_on(&["a"]),
        TaskDescriptor::new("c", "further downstream").depends_on(&["b"]),
        TaskDescriptor::new("sibling", "independent"),
    ];
    let sibling_ran = Arc::new(AtomicU32::new(0));
    let downstream_ran = Arc::new(AtomicU32::new(0));

    let registry = HandlerRegistry::new();
    registry.register_fn("a", |_| async move {
        Err::<StepOutput, _>(HandlerError::permanent("unrecoverable"))
    });
    for step in ["b", "c"] {
        let counter = Arc::clone(&downstream_ran);
        registry.register_fn(step, move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(StepOutput::value(serde_json::json!(null)))
            }
        });
    }
    {
        let counter = Arc::clone(&sibling_ran);
        registry.register_fn("sibling", move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(StepOutput::value(serde_json::json!("ok")))
            }
        });
    }

    let harness = execute_graph(&tasks, registry, serde_json::json!({}), exec_config(), 2).await;
    let outcome = harness.outcome.unwrap();
    assert_eq!(outcome.status, RunState::Failed);

    // The sibling ran to completion; the dependent chain never executed.
    assert_eq!(sibling_ran.load(Ordering::SeqCst), 1);
    assert_eq!(downstream_ran.load(Ordering::SeqCst), 0);
    assert!(outcome.results.contains_key("sibling"));
    assert_eq!(outcome.failures["b"].code, "dependency_failed");
    assert_eq!(outcome.failures["c"].code, "dependency_failed");

    // Permanent failure without retries for a non-retryable error.
    let step = harness
        .store
        .fetch_step(harness.run_id, "a")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(step.state(), StepState::Failed);
    assert_eq!(step.attempt_count, 1);

    // Dependents were failed without ever being started.
    let step_b = harness
        .store
        .fetch_step(harness.run_id, "b")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(step_b.state(), StepState::Failed);
    assert_eq!(step_b.attempt_count, 0);
}

#[tokio::test]
async fn test_transient_failure_retries_then_succeeds() {
    let tasks = vec![TaskDescriptor::new("flaky", "fails once")];
    let calls = Arc::new(AtomicU32::new(0));

    let registry = HandlerRegistry::new();
    {
        let calls = Arc::clone(&calls);
        registry.register_fn("flaky", move |_| {
            let calls = Arc::clone(&calls);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(HandlerError::transient("first attempt wobbles"))
                } else {
                    Ok(StepOutput::value(serde_json::json!("recovered")))
                }
            }
        });
    }

    let harness = execute_graph(&tasks, registry, serde_json::json!({}), exec_config(), 1).await;
    let outcome = harness.outcome.unwrap();
    assert_eq!(outcome.status, RunState::Complete);
    assert_eq!(outcome.stats.retries, 1);
    assert_eq!(outcome.results["flaky"], serde_json::json!("recovered"));

    let step = harness
        .store
        .fetch_step(harness.run_id, "flaky")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(step.attempt_count, 2);
}

#[tokio::test]
async fn test_retry_exhaustion_becomes_permanent_failure() {
    let tasks = vec![TaskDescriptor::new("doomed", "always fails")];
    let calls = Arc::new(AtomicU32::new(0));

    let registry = HandlerRegistry::new();
    {
        let calls = Arc::clone(&calls);
        registry.register_fn("doomed", move |_| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<StepOutput, _>(HandlerError::transient("still broken"))
            }
        });
    }

    let mut config = exec_config();
    config.retry_attempts = 2;
    let harness = execute_graph(&tasks, registry, serde_json::json!({}), config, 1).await;
    let outcome = harness.outcome.unwrap();
    assert_eq!(outcome.status, RunState::Failed);

    // retry_attempts = 2 means 3 total attempts.
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let step = harness
        .store
        .fetch_step(harness.run_id, "doomed")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(step.state(), StepState::Failed);
    assert_eq!(step.attempt_count, 3);

    let run = harness.store.fetch_run(harness.run_id).await.unwrap().unwrap();
    assert_eq!(run.state(), RunState::Failed);
}

#[tokio::test]
async fn test_attempt_timeout_counts_as_failed_attempt() {
    let tasks = vec![TaskDescriptor::new("sluggish", "slow first attempt")];
    let calls = Arc::new(AtomicU32::new(0));

    let registry = HandlerRegistry::new();
    {
        let calls = Arc::clone(&calls);
        registry.register_fn("sluggish", move |_| {
            let calls = Arc::clone(&calls);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                Ok(StepOutput::value(serde_json::json!("eventually")))
            }
        });
    }

    let mut config = exec_config();
    config.task_timeout = Duration::from_millis(50);
    let harness = execute_graph(&tasks, registry, serde_json::json!({}), config, 1).await;
    let outcome = harness.outcome.unwrap();
    assert_eq!(outcome.status, RunState::Complete);
    assert_eq!(outcome.stats.retries, 1);

    let step = harness
        .store
        .fetch_step(harness.run_id, "sluggish")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(step.attempt_count, 2);
}

#[tokio::test]
async fn test_workflow_timeout_forces_terminal_state() {
    let tasks = vec![TaskDescriptor::new("stuck", "never finishes in time")];
    let registry = HandlerRegistry::new();
    registry.register_fn("stuck", |_| async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        Ok(StepOutput::value(serde_json::json!(null)))
    });

    let mut config = exec_config();
    config.workflow_timeout = Duration::from_millis(150);
    let harness = execute_graph(&tasks, registry, serde_json::json!({}), config, 1).await;

    match harness.outcome {
        Err(EngineError::WorkflowTimeout { .. }) => {}
        other => panic!("expected workflow timeout, got {other:?}"),
    }
    let run = harness.store.fetch_run(harness.run_id).await.unwrap().unwrap();
    assert_eq!(run.state(), RunState::TimedOut);
    assert!(run.completed_at.is_some());
}

/// Map-step handler: returns three shards, then transforms each element.
struct ShardHandler;

#[async_trait]
impl StepHandler for ShardHandler {
    async fn handle(&self, _input: &serde_json::Value) -> Result<StepOutput, HandlerError> {
        Ok(StepOutput::Items(vec![
            serde_json::json!("shard-a"),
            serde_json::json!("shard-b"),
            serde_json::json!("shard-c"),
        ]))
    }

    async fn handle_item(
        &self,
        item: &serde_json::Value,
        _input: &serde_json::Value,
    ) -> Result<serde_json::Value, HandlerError> {
        let name = item.as_str().unwrap_or("?");
        Ok(serde_json::json!(format!("{name}:done")))
    }
}

#[tokio::test]
async fn test_map_step_fan_out_aggregates_three_entries() {
    let tasks = vec![
        TaskDescriptor::new("shards", "produce shards"),
        TaskDescriptor::new("summarize", "consume mapping").depends_on(&["shards"]),
    ];
    let seen_by_summarize: Arc<parking_lot::Mutex<Option<serde_json::Value>>> =
        Default::default();

    let registry = HandlerRegistry::new();
    registry.register("shards", Arc::new(ShardHandler));
    {
        let seen = Arc::clone(&seen_by_summarize);
        registry.register_fn("summarize", move |input| {
            let seen = Arc::clone(&seen);
            async move {
                *seen.lock() = Some(input.clone());
                Ok(StepOutput::value(serde_json::json!("summarized")))
            }
        });
    }

    let harness = execute_graph(&tasks, registry, serde_json::json!({}), exec_config(), 2).await;
    let outcome = harness.outcome.unwrap();
    assert_eq!(outcome.status, RunState::Complete);
    assert_eq!(outcome.stats.elements_dispatched, 3);

    let mapping = outcome.results["shards"].as_object().unwrap();
    assert_eq!(mapping.len(), 3);
    assert_eq!(mapping["shard-a"], serde_json::json!("shard-a:done"));
    assert_eq!(mapping["shard-b"], serde_json::json!("shard-b:done"));
    assert_eq!(mapping["shard-c"], serde_json::json!("shard-c:done"));

    // The dependent's accumulated input carries the aggregated mapping
    // under the map-step's id.
    let input = seen_by_summarize.lock().clone().unwrap();
    assert_eq!(input["shards"].as_object().unwrap().len(), 3);
}

#[tokio::test]
async fn test_max_parallel_bounds_in_flight_steps() {
    let tasks: Vec<TaskDescriptor> = (0..6)
        .map(|i| TaskDescriptor::new(format!("w{i}"), "independent work"))
        .collect();

    let gauge = Arc::new(AtomicI32::new(0));
    let peak = Arc::new(AtomicI32::new(0));
    let registry = HandlerRegistry::new();
    for i in 0..6 {
        let gauge = Arc::clone(&gauge);
        let peak = Arc::clone(&peak);
        registry.register_fn(format!("w{i}"), move |_| {
            let gauge = Arc::clone(&gauge);
            let peak = Arc::clone(&peak);
            async move {
                let current = gauge.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(current, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                gauge.fetch_sub(1, Ordering::SeqCst);
                Ok(StepOutput::value(serde_json::json!(null)))
            }
        });
    }

    let mut config = exec_config();
    config.max_parallel = 2;
    let harness = execute_graph(&tasks, registry, serde_json::json!({}), config, 4).await;
    let outcome = harness.outcome.unwrap();
    assert_eq!(outcome.status, RunState::Complete);
    assert_eq!(outcome.results.len(), 6);
    assert!(
        peak.load(Ordering::SeqCst) <= 2,
        "observed concurrency {} exceeds max_parallel",
        peak.load(Ordering::SeqCst)
    );
}

#[tokio::test]
async fn test_accumulated_input_merges_dependency_outputs() {
    let tasks = vec![
        TaskDescriptor::new("fetch", "produce"),
        TaskDescriptor::new("transform", "consume").depends_on(&["fetch"]),
    ];
    let seen: Arc<parking_lot::Mutex<Option<serde_json::Value>>> = Default::default();

    let registry = HandlerRegistry::new();
    registry.register_fn("fetch", |_| async move {
        Ok(StepOutput::value(serde_json::json!({"rows": 42})))
    });
    {
        let seen = Arc::clone(&seen);
        registry.register_fn("transform", move |input| {
            let seen = Arc::clone(&seen);
            async move {
                *seen.lock() = Some(input);
                Ok(StepOutput::value(serde_json::json!(null)))
            }
        });
    }

    let harness = execute_graph(
        &tasks,
        registry,
        serde_json::json!({"source": "s3://bucket"}),
        exec_config(),
        1,
    )
    .await;
    assert_eq!(harness.outcome.unwrap().status, RunState::Complete);

    let input = seen.lock().clone().unwrap();
    // Original run input and the named dependency output, merged.
    assert_eq!(input["source"], serde_json::json!("s3://bucket"));
    assert_eq!(input["fetch"], serde_json::json!({"rows": 42}));
}

#[tokio::test]
async fn test_wide_acyclic_graph_terminates() {
    // Layered graph: 3 layers of 4 steps, each depending on the whole
    // previous layer. Termination within the test runtime is the bound
    // we care about; completeness is the correctness check.
    let mut tasks = Vec::new();
    for layer in 0..3 {
        for i in 0..4 {
            let mut task = TaskDescriptor::new(format!("l{layer}_{i}"), "layer work");
            if layer > 0 {
                task.depends_on = (0..4).map(|p| format!("l{}_{p}", layer - 1)).collect();
            }
            tasks.push(task);
        }
    }
    let registry = HandlerRegistry::new();
    for task in &tasks {
        registry.register_fn(task.id.clone(), |_| async move {
            Ok(StepOutput::value(serde_json::json!(null)))
        });
    }

    let harness = execute_graph(&tasks, registry, serde_json::json!({}), exec_config(), 3).await;
    let outcome = harness.outcome.unwrap();
    assert_eq!(outcome.status, RunState::Complete);
    assert_eq!(outcome.stats.steps_completed, 12);
    assert_eq!(outcome.stats.steps_failed, 0);
}

#[tokio::test]
async fn test_store_roots_match_graph_roots() {
    let tasks = vec![
        TaskDescriptor::new("r1", "root"),
        TaskDescriptor::new("r2", "root"),
        TaskDescriptor::new("joined", "join").depends_on(&["r1", "r2"]),
    ];
    let graph = TaskGraph::build(&tasks).unwrap();

    let store = MemoryRunStore::new();
    let run_id = store.create_run("roots", &serde_json::json!({})).await.unwrap();
    let steps: Vec<_> = graph.steps().cloned().collect();
    store.insert_steps(run_id, &steps).await.unwrap();
    for step in &steps {
        for dep in &step.depends_on {
            store.record_dependency(run_id, &step.slug, dep).await.unwrap();
        }
    }

    // The graph's computed roots equal the store's zero-dependency steps.
    let store_roots = store.find_root_steps(run_id).await.unwrap();
    assert_eq!(store_roots, graph.roots().to_vec());
}

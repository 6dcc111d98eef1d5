//! End-to-end tests through the public API: pools behind a manager, failures
//! parked in the dead-letter queue, results synced by the aggregator.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use pool_forge::adapter::TaskAdapter;
use pool_forge::config::{AggregatorConfig, DlqConfig, ManagerConfig};
use pool_forge::dlq::DlqStatus;
use pool_forge::events::{noop_sink, BroadcastEventSink};
use pool_forge::pool::LocalBackend;
use pool_forge::sinks::{InMemoryDurableSink, SqliteDurableSink, TracingAnalyticsSink};
use pool_forge::{
    AdapterError, DeadLetterQueue, MemoryAggregator, Pool, PoolConfig, PoolManager, RetryPolicy,
    Submission, SubmissionOutcome, Task, TaskState, Topology,
};

/// Fails the first `failures` calls, then echoes the payload.
struct FlakyAdapter {
    failures: u32,
    calls: AtomicU32,
}

impl FlakyAdapter {
    fn new(failures: u32) -> Self {
        Self {
            failures,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl TaskAdapter for FlakyAdapter {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn execute(&self, task: &Task) -> Result<serde_json::Value, AdapterError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(AdapterError::Unreachable(format!("attempt {}", call + 1)));
        }
        Ok(json!({ "echo": task.payload }))
    }
}

async fn flaky_pool(name: &str, failures: u32) -> Pool {
    Pool::spawn(
        PoolConfig::new(name, 1, 2),
        LocalBackend::new(Arc::new(FlakyAdapter::new(failures))),
        noop_sink(),
    )
    .await
    .expect("pool should spawn")
}

#[tokio::test]
async fn test_failed_task_is_retried_and_synced() {
    let dlq = Arc::new(DeadLetterQueue::new(DlqConfig::default(), noop_sink()));
    let manager = Arc::new(
        PoolManager::new(ManagerConfig::default(), noop_sink())
            .with_dead_letter_queue(Arc::clone(&dlq)),
    );
    manager.register(flaky_pool("edge", 1).await).unwrap();

    let submission = Submission::new(Task::new(json!({"job": "Nightly Report"})))
        .with_retry_policy(RetryPolicy::Immediate, 3);
    let task_id = submission.task.id;

    let outcome = manager.submit(submission).await.unwrap();
    assert!(matches!(outcome, SubmissionOutcome::QueuedForRetry { .. }));
    assert_eq!(dlq.get(task_id).unwrap().status, DlqStatus::Pending);

    dlq.set_handler(manager.clone());
    let report = dlq.process_due().await.unwrap();
    assert_eq!(report.attempted, 1);
    assert_eq!(report.succeeded, 1);

    let entry = dlq.get(task_id).unwrap();
    assert_eq!(entry.status, DlqStatus::Completed);
    assert_eq!(entry.retry_count, 0);
    assert_eq!(entry.attempts.len(), 1);
    assert!(entry.attempts[0].success);

    let durable = Arc::new(InMemoryDurableSink::new());
    let analytics = Arc::new(TracingAnalyticsSink::new());
    let aggregator = MemoryAggregator::new(
        manager.clone(),
        durable.clone(),
        analytics.clone(),
        AggregatorConfig::default(),
        noop_sink(),
    );

    let report = aggregator.collect_and_sync().await;
    assert_eq!(report.synced_count, 1);
    assert_eq!(report.pools_failed, 0);
    assert_eq!(durable.len(), 1);
    assert_eq!(analytics.last_summary().unwrap().items_per_pool["edge"], 1);

    let found = aggregator.cross_pool_search("nightly  REPORT", 10).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].task_id, Some(task_id));

    aggregator.cross_pool_search("nightly report", 10).await.unwrap();
    assert_eq!(durable.search_calls(), 1);

    manager.close_all().await;
}

#[tokio::test]
async fn test_async_submission_completes_in_background() {
    let manager = Arc::new(PoolManager::new(
        ManagerConfig::default(),
        Arc::new(BroadcastEventSink::new()),
    ));
    manager.register(flaky_pool("a", 0).await).unwrap();

    let submission = Submission::new(Task::new(json!({"n": 7}))).asynchronous();
    let task_id = submission.task.id;
    let outcome = manager.submit(submission).await.unwrap();
    assert!(matches!(outcome, SubmissionOutcome::Accepted { task_id: id } if id == task_id));

    let mut state = manager.task_state(task_id);
    for _ in 0..100 {
        if matches!(state, Some(TaskState::Completed(_))) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        state = manager.task_state(task_id);
    }
    match state {
        Some(TaskState::Completed(output)) => {
            assert_eq!(output.pool_id, "a");
            assert_eq!(output.output["echo"]["n"], 7);
        }
        other => panic!("task did not complete: {:?}", other),
    }

    manager.close_all().await;
}

#[tokio::test]
async fn test_topology_runs_shell_tasks_into_sqlite() {
    let topology = Topology::from_yaml_str(
        r#"
routing_strategy: round_robin
pools:
  - name: shell-a
    kind: local
    min_workers: 1
    max_workers: 2
    tags: [cpu]
  - name: shell-b
    kind: local
    min_workers: 1
    max_workers: 1
"#,
    )
    .unwrap();

    let config = ManagerConfig {
        routing_strategy: topology.routing_strategy.unwrap_or_default(),
        ..Default::default()
    };
    let manager = Arc::new(PoolManager::new(config, noop_sink()));
    for spec in &topology.pools {
        let pool = Pool::spawn(spec.pool_config(), spec.build_backend().unwrap(), noop_sink())
            .await
            .unwrap();
        manager.register(pool).unwrap();
    }

    for word in ["alpha", "beta"] {
        let task = Task::new(json!({"command": format!("echo {}", word)}));
        match manager.submit(Submission::new(task)).await.unwrap() {
            SubmissionOutcome::Completed(output) => {
                assert_eq!(output.output["stdout"], format!("{}\n", word));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(SqliteDurableSink::open(&dir.path().join("results.db")).await.unwrap());
    let aggregator = MemoryAggregator::new(
        manager.clone(),
        sink.clone(),
        Arc::new(TracingAnalyticsSink::new()),
        AggregatorConfig::default(),
        noop_sink(),
    );

    let report = aggregator.collect_and_sync().await;
    assert_eq!(report.synced_count, 2);
    assert_eq!(report.pools_collected, 2);
    assert_eq!(sink.count().await.unwrap(), 2);

    let found = aggregator.cross_pool_search("beta", 10).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].pool_id, "shell-b");

    manager.close_all().await;
    sink.close().await;
}

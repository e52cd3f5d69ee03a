
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use queuectl::queue::{ExecutionMode, JobState};
use queuectl::worker::{RetryPolicy, StepOutcome};
use test_harness::{assert_eventually, TestQueue, TEST_BACKOFF_UNIT};

fn payload(value: Value) -> Option<Map<String, Value>> {
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

#[tokio::test]
async fn test_idle_when_queue_empty() {
    let queue = TestQueue::new().await;
    let worker = queue.worker(1);

    let outcome = worker.run_once(&CancellationToken::new()).await.unwrap();
    assert_eq!(outcome, StepOutcome::Idle);
}

#[tokio::test]
async fn test_shell_job_completes() {
    let queue = TestQueue::new().await;
    let job = queue
        .manager
        .enqueue("echo done", ExecutionMode::Shell, None, None)
        .await
        .unwrap();
    let worker = queue.worker(1);

    let outcome = worker.run_once(&CancellationToken::new()).await.unwrap();
    assert_eq!(outcome, StepOutcome::Completed(job.id));

    let stored = queue.manager.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Completed);
    assert_eq!(stored.attempts, 0);
    assert_eq!(stored.result, Some(Value::String("done".to_string())));
    assert!(stored.created_at <= stored.updated_at);
}

#[tokio::test]
async fn test_dynamic_job_stores_result() {
    let queue = TestQueue::new().await;
    let job = queue
        .manager
        .enqueue(
            "jobs.add.run",
            ExecutionMode::Dynamic,
            payload(json!({"a": 2, "b": 3})),
            None,
        )
        .await
        .unwrap();
    let worker = queue.worker(1);

    worker.run_once(&CancellationToken::new()).await.unwrap();

    let stored = queue.manager.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Completed);
    assert_eq!(stored.result, Some(json!(5)));
    assert_eq!(queue.metrics.snapshot().processed, 1);
}

#[tokio::test]
async fn test_failing_job_retries_then_dies() {
    let queue = TestQueue::new().await;
    let job = queue
        .manager
        .enqueue("exit 1", ExecutionMode::Shell, None, Some(2))
        .await
        .unwrap();
    let worker = queue.worker(1);
    let shutdown = CancellationToken::new();
    let policy = RetryPolicy::new(2.0).with_unit(TEST_BACKOFF_UNIT);
    assert!(policy.delay(2) > policy.delay(1));

    // Attempts 1 and 2 are retried with growing backoff
    for expected_attempt in 1..=2u32 {
        let outcome = worker.run_once(&shutdown).await.unwrap();
        assert_eq!(
            outcome,
            StepOutcome::Retried {
                job_id: job.id,
                attempt: expected_attempt,
                delay: policy.delay(expected_attempt),
            }
        );

        let stored = queue.manager.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Pending);
        assert_eq!(stored.attempts, expected_attempt);
        assert!(stored.last_error.as_deref().unwrap().contains("no stderr"));
    }

    // The third failure exceeds max_retries
    let outcome = worker.run_once(&shutdown).await.unwrap();
    assert_eq!(outcome, StepOutcome::DeadLettered(job.id));

    assert!(queue.manager.get_job(&job.id).await.unwrap().is_none());
    let entry = queue.dlq.get(&job.id).await.unwrap().unwrap();
    assert_eq!(entry.attempts, 3);
    assert_eq!(entry.max_retries, 2);
    assert_eq!(entry.command, "exit 1");

    let snapshot = queue.metrics.snapshot();
    assert_eq!(snapshot.failed, 3);
    assert_eq!(snapshot.processed, 0);
}

#[tokio::test]
async fn test_zero_retries_dies_on_first_failure() {
    let queue = TestQueue::new().await;
    let job = queue
        .manager
        .enqueue("tests.fail", ExecutionMode::Dynamic, None, Some(0))
        .await
        .unwrap();
    let worker = queue.worker(1);

    let outcome = worker.run_once(&CancellationToken::new()).await.unwrap();
    assert_eq!(outcome, StepOutcome::DeadLettered(job.id));

    let entry = queue.dlq.get(&job.id).await.unwrap().unwrap();
    assert_eq!(entry.mode, ExecutionMode::Dynamic);
    assert_eq!(entry.attempts, 1);
    assert!(entry.last_error.unwrap().contains("boom"));
}

#[tokio::test]
async fn test_undecodable_payload_dead_letters_without_retries() {
    let queue = TestQueue::new().await;
    let job = queue
        .manager
        .enqueue(
            "jobs.add.run",
            ExecutionMode::Dynamic,
            payload(json!({"a": 2, "b": 3})),
            Some(0),
        )
        .await
        .unwrap();
    queue.write_raw_column(&job.id, "payload", "{not json").await;
    let worker = queue.worker(1);
    let shutdown = CancellationToken::new();

    let outcome = worker.run_once(&shutdown).await.unwrap();
    assert_eq!(outcome, StepOutcome::DeadLettered(job.id));
    assert_eq!(worker.run_once(&shutdown).await.unwrap(), StepOutcome::Idle);

    assert!(queue.manager.list_jobs().await.unwrap().is_empty());
    let entry = queue.dlq.get(&job.id).await.unwrap().unwrap();
    assert_eq!(entry.attempts, 1);
    assert!(entry.payload.is_none());
    let error = entry.last_error.unwrap();
    assert!(error.contains("invalid payload"), "unexpected error: {}", error);
    assert_eq!(queue.metrics.snapshot().failed, 1);
}

#[tokio::test]
async fn test_undecodable_payload_counts_as_attempt() {
    let queue = TestQueue::new().await;
    let job = queue
        .manager
        .enqueue(
            "jobs.add.run",
            ExecutionMode::Dynamic,
            payload(json!({"a": 2, "b": 3})),
            Some(1),
        )
        .await
        .unwrap();
    queue.write_raw_column(&job.id, "payload", "[1, 2").await;
    let worker = queue.worker(1);
    let shutdown = CancellationToken::new();

    assert!(matches!(
        worker.run_once(&shutdown).await.unwrap(),
        StepOutcome::Retried { attempt: 1, .. }
    ));
    let stored = queue.manager.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Pending);
    assert!(stored.payload.is_none());

    // Without its arguments the handler fails again and the job is buried
    assert_eq!(
        worker.run_once(&shutdown).await.unwrap(),
        StepOutcome::DeadLettered(job.id)
    );
    assert_eq!(queue.dlq.get(&job.id).await.unwrap().unwrap().attempts, 2);
}

#[tokio::test]
async fn test_stderr_recorded_as_last_error() {
    let queue = TestQueue::new().await;
    let job = queue
        .manager
        .enqueue("echo 'disk full' >&2; exit 2", ExecutionMode::Shell, None, Some(1))
        .await
        .unwrap();
    let worker = queue.worker(1);

    worker.run_once(&CancellationToken::new()).await.unwrap();

    let stored = queue.manager.get_job(&job.id).await.unwrap().unwrap();
    let error = stored.last_error.unwrap();
    assert!(error.contains("disk full"));
    assert!(error.contains('2'));
}

#[tokio::test]
async fn test_success_after_failure_clears_error() {
    let queue = TestQueue::new().await;
    let marker = queue.dir.path().join("marker");
    // Fails the first time, succeeds once the marker exists
    let command = format!(
        "if [ -f {0} ]; then echo ok; else touch {0}; exit 1; fi",
        marker.display()
    );
    let job = queue
        .manager
        .enqueue(&command, ExecutionMode::Shell, None, Some(3))
        .await
        .unwrap();
    let worker = queue.worker(1);
    let shutdown = CancellationToken::new();

    assert!(matches!(
        worker.run_once(&shutdown).await.unwrap(),
        StepOutcome::Retried { attempt: 1, .. }
    ));
    assert_eq!(
        worker.run_once(&shutdown).await.unwrap(),
        StepOutcome::Completed(job.id)
    );

    let stored = queue.manager.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Completed);
    assert_eq!(stored.attempts, 1);
    assert!(stored.last_error.is_none());
}

#[tokio::test]
async fn test_run_loop_processes_queue_and_stops() {
    let queue = TestQueue::new().await;
    for i in 0..3 {
        queue
            .manager
            .enqueue(&format!("echo {}", i), ExecutionMode::Shell, None, None)
            .await
            .unwrap();
    }

    let shutdown = CancellationToken::new();
    let worker = queue.worker(1);
    let token = shutdown.clone();
    let handle = tokio::spawn(async move { worker.run(token).await });

    let manager = queue.manager.clone();
    assert_eventually(
        || {
            let manager = manager.clone();
            async move {
                let completed = manager.jobs_in_state(JobState::Completed).await.unwrap();
                completed.len() == 3
            }
        },
        Duration::from_secs(10),
        "worker should complete all jobs",
    )
    .await;

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker should stop after shutdown")
        .unwrap();

    assert_eq!(queue.metrics.snapshot().active_workers, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_multiple_workers_share_queue() {
    let queue = TestQueue::with_pool_size(6).await;
    for i in 0..12 {
        queue
            .manager
            .enqueue(&format!("echo {}", i), ExecutionMode::Shell, None, None)
            .await
            .unwrap();
    }

    let shutdown = CancellationToken::new();
    let mut handles = Vec::new();
    for worker_id in 1..=3 {
        let worker = queue.worker(worker_id);
        let token = shutdown.clone();
        handles.push(tokio::spawn(async move { worker.run(token).await }));
    }

    let manager = queue.manager.clone();
    assert_eventually(
        || {
            let manager = manager.clone();
            async move {
                let completed = manager.jobs_in_state(JobState::Completed).await.unwrap();
                completed.len() == 12
            }
        },
        Duration::from_secs(15),
        "workers should complete all jobs",
    )
    .await;

    shutdown.cancel();
    for handle in handles {
        handle.await.unwrap();
    }

    // Each job ran exactly once
    assert_eq!(queue.metrics.snapshot().processed, 12);
    let jobs = queue.manager.list_jobs().await.unwrap();
    assert!(jobs.iter().all(|j| j.attempts == 0));
}

#[tokio::test]
async fn test_shutdown_during_backoff_requeues() {
    let queue = TestQueue::new().await;
    let job = queue
        .manager
        .enqueue("exit 1", ExecutionMode::Shell, None, Some(5))
        .await
        .unwrap();
    let worker = queue
        .worker(1)
        .with_retry_policy(RetryPolicy::new(2.0));

    // Already cancelled: the multi-second backoff is skipped
    let shutdown = CancellationToken::new();
    shutdown.cancel();
    let outcome = tokio::time::timeout(Duration::from_secs(2), worker.run_once(&shutdown))
        .await
        .expect("backoff should be cut short")
        .unwrap();
    assert!(matches!(outcome, StepOutcome::Retried { attempt: 1, .. }));

    let stored = queue.manager.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Pending);
}

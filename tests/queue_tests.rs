
use std::time::Duration;

use serde_json::{json, Value};

use queuectl::error::QueueError;
use queuectl::queue::manager::parse_payload;
use queuectl::queue::{ExecutionMode, Job, JobState};
use test_harness::{expect_ready, TestQueue};

#[test]
fn test_job_creation() {
    let job = Job::new("echo hello".to_string(), ExecutionMode::Shell, None, 3);
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.command, "echo hello");
    assert_eq!(job.attempts, 0);
    assert_eq!(job.created_at, job.updated_at);
    assert_eq!(job.mode, ExecutionMode::Shell);
}

#[tokio::test]
async fn test_enqueue_shell_job() {
    let queue = TestQueue::new().await;

    let job = queue
        .manager
        .enqueue("  echo hello  ", ExecutionMode::Shell, None, None)
        .await
        .unwrap();

    assert_eq!(job.command, "echo hello");
    assert_eq!(job.max_retries, queue.config.max_retries);

    let stored = queue.manager.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Pending);
    assert_eq!(stored.attempts, 0);
    assert!(stored.created_at <= stored.updated_at);
}

#[tokio::test]
async fn test_enqueue_overrides_max_retries() {
    let queue = TestQueue::new().await;

    let job = queue
        .manager
        .enqueue("echo hi", ExecutionMode::Shell, None, Some(7))
        .await
        .unwrap();

    assert_eq!(job.max_retries, 7);
}

#[tokio::test]
async fn test_enqueue_rejects_empty_command() {
    let queue = TestQueue::new().await;

    for command in ["", "   "] {
        let err = queue
            .manager
            .enqueue(command, ExecutionMode::Shell, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));
    }
    assert!(queue.manager.list_jobs().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_enqueue_dynamic_job() {
    let queue = TestQueue::new().await;
    let payload = parse_payload(r#"{"a": 2, "b": 3}"#).unwrap();

    let job = queue
        .manager
        .enqueue("jobs.add.run", ExecutionMode::Dynamic, Some(payload), None)
        .await
        .unwrap();

    let stored = queue.manager.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.mode, ExecutionMode::Dynamic);
    assert_eq!(Value::Object(stored.payload.unwrap()), json!({"a": 2, "b": 3}));
}

#[tokio::test]
async fn test_enqueue_rejects_unknown_handler() {
    let queue = TestQueue::new().await;

    for command in ["add", "jobs.add.missing", "nowhere.run"] {
        let err = queue
            .manager
            .enqueue(command, ExecutionMode::Dynamic, None, None)
            .await
            .unwrap_err();
        assert!(
            matches!(err, QueueError::Validation(_)),
            "{} should be rejected",
            command
        );
    }
    assert!(queue.manager.list_jobs().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_enqueue_rejects_payload_for_shell() {
    let queue = TestQueue::new().await;
    let payload = parse_payload(r#"{"a": 1}"#).unwrap();

    let err = queue
        .manager
        .enqueue("echo hi", ExecutionMode::Shell, Some(payload), None)
        .await
        .unwrap_err();

    assert!(matches!(err, QueueError::Validation(_)));
}

#[tokio::test]
async fn test_list_and_counts() {
    let queue = TestQueue::new().await;
    let mut ids = Vec::new();
    for i in 0..3 {
        let job = queue
            .manager
            .enqueue(&format!("echo {}", i), ExecutionMode::Shell, None, None)
            .await
            .unwrap();
        ids.push(job.id);
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    // Oldest first
    let listed: Vec<_> = queue
        .manager
        .list_jobs()
        .await
        .unwrap()
        .into_iter()
        .map(|j| j.id)
        .collect();
    assert_eq!(listed, ids);

    let mut claimed = expect_ready(queue.manager.claim_next().await.unwrap());
    assert_eq!(claimed.id, ids[0]);
    queue
        .manager
        .mark_completed(&mut claimed, Value::String("0".into()))
        .await
        .unwrap();

    let counts = queue.manager.counts().await.unwrap();
    assert_eq!(counts.get(&JobState::Pending), Some(&2));
    assert_eq!(counts.get(&JobState::Completed), Some(&1));

    let completed = queue
        .manager
        .jobs_in_state(JobState::Completed)
        .await
        .unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].id, ids[0]);
}

#[tokio::test]
async fn test_manual_failure_and_requeue() {
    let queue = TestQueue::new().await;
    queue
        .manager
        .enqueue("false", ExecutionMode::Shell, None, Some(1))
        .await
        .unwrap();

    let mut job = expect_ready(queue.manager.claim_next().await.unwrap());
    queue
        .manager
        .mark_failed(&mut job, "exit code Some(1): no stderr".to_string())
        .await
        .unwrap();
    let stored = queue.manager.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Failed);
    assert_eq!(stored.attempts, 1);

    queue.manager.mark_requeued(&mut job).await.unwrap();
    let stored = queue.manager.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Pending);

    // A second failure exhausts the single retry
    let mut job = expect_ready(queue.manager.claim_next().await.unwrap());
    queue
        .manager
        .mark_failed(&mut job, "again".to_string())
        .await
        .unwrap();
    assert!(matches!(
        queue.manager.mark_requeued(&mut job).await,
        Err(QueueError::InvalidTransition { .. })
    ));
    queue.manager.mark_dead(&mut job).await.unwrap();

    assert!(queue.manager.get_job(&job.id).await.unwrap().is_none());
    assert!(queue.dlq.get(&job.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_completed_job_cannot_be_failed() {
    let queue = TestQueue::new().await;
    queue
        .manager
        .enqueue("true", ExecutionMode::Shell, None, None)
        .await
        .unwrap();

    let mut job = expect_ready(queue.manager.claim_next().await.unwrap());
    queue
        .manager
        .mark_completed(&mut job, Value::String(String::new()))
        .await
        .unwrap();

    assert!(matches!(
        queue.manager.mark_failed(&mut job, "late".to_string()).await,
        Err(QueueError::InvalidTransition {
            from: JobState::Completed,
            to: JobState::Failed
        })
    ));
    let stored = queue.manager.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Completed);
}

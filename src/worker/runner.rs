use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::{DispatchError, Result};
use crate::metrics::Metrics;
use crate::queue::{Job, QueueManager};
use crate::store::Claim;
use crate::worker::executor::JobExecutor;
use crate::worker::retry::RetryPolicy;

/// What a single [`Worker::run_once`] step did.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Nothing was pending (or the claim was contended).
    Idle,
    Completed(Uuid),
    /// Failed, waited out the backoff, and went back to pending.
    Retried {
        job_id: Uuid,
        attempt: u32,
        delay: Duration,
    },
    /// Failed with no retries left and moved to the dead-letter store.
    DeadLettered(Uuid),
}

/// A single sequential poller: claim, execute, reconcile.
pub struct Worker {
    id: u64,
    manager: QueueManager,
    executor: JobExecutor,
    retry: RetryPolicy,
    poll_interval: Duration,
    metrics: Arc<Metrics>,
}

impl Worker {
    pub fn new(
        id: u64,
        manager: QueueManager,
        executor: JobExecutor,
        config: &QueueConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            id,
            manager,
            executor,
            retry: RetryPolicy::from_config(config),
            poll_interval: config.poll_interval(),
            metrics,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Poll until `shutdown` is cancelled.
    ///
    /// Shutdown is observed between jobs and while sleeping; a running job is
    /// always allowed to finish. Storage errors are logged and retried after
    /// one poll interval.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(worker_id = self.id, poll_interval = ?self.poll_interval, "Worker started");

        while !shutdown.is_cancelled() {
            self.metrics.heartbeat(self.id);

            let idle = match self.run_once(&shutdown).await {
                Ok(StepOutcome::Idle) => true,
                Ok(_) => false,
                Err(e) => {
                    tracing::error!(worker_id = self.id, error = %e, "Worker step failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    _ = shutdown.cancelled() => break,
                }
            }
        }

        tracing::info!(worker_id = self.id, "Worker stopped");
    }

    /// Claim one job, run it, and apply the retry policy to the outcome.
    pub async fn run_once(&self, shutdown: &CancellationToken) -> Result<StepOutcome> {
        let Some(claim) = self.manager.claim_next().await? else {
            return Ok(StepOutcome::Idle);
        };
        let picked = claim.job();
        tracing::info!(worker_id = self.id, job_id = %picked.id, command = %picked.command, "Picked job");

        let mut job = match claim {
            Claim::Ready(job) => job,
            Claim::Corrupt { mut job, error } => {
                // Not executable, but it still costs an attempt
                let error = DispatchError::InvalidPayload(error);
                return self.fail(&mut job, error, shutdown).await;
            }
        };

        let started = Instant::now();
        match self.executor.execute(&job).await {
            Ok(result) => {
                self.metrics.on_job_success(started.elapsed());
                self.manager.mark_completed(&mut job, result).await?;
                tracing::info!(worker_id = self.id, job_id = %job.id, "Job completed");
                Ok(StepOutcome::Completed(job.id))
            }
            Err(error) => self.fail(&mut job, error, shutdown).await,
        }
    }

    /// Record a failed attempt, then either bury the job or back off and
    /// requeue it.
    async fn fail(
        &self,
        job: &mut Job,
        error: DispatchError,
        shutdown: &CancellationToken,
    ) -> Result<StepOutcome> {
        self.metrics.on_job_failure();
        tracing::error!(
            worker_id = self.id,
            job_id = %job.id,
            error = %error,
            validation = error.is_validation(),
            "Job failed"
        );
        self.manager.mark_failed(job, error.to_string()).await?;

        if job.retries_exhausted() {
            tracing::error!(
                job_id = %job.id,
                attempts = job.attempts,
                max_retries = job.max_retries,
                "Retries exhausted, moving job to dead-letter store"
            );
            self.manager.mark_dead(job).await?;
            return Ok(StepOutcome::DeadLettered(job.id));
        }

        let delay = self.retry.delay(job.attempts);
        tracing::warn!(
            job_id = %job.id,
            attempt = job.attempts,
            max_retries = job.max_retries,
            delay_secs = delay.as_secs_f64(),
            "Retrying job after backoff"
        );

        // The backoff holds this worker; cut it short on shutdown so the job
        // is not left in `failed`.
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.cancelled() => {
                tracing::info!(job_id = %job.id, "Shutdown during backoff, requeueing now");
            }
        }

        self.manager.mark_requeued(job).await?;
        Ok(StepOutcome::Retried {
            job_id: job.id,
            attempt: job.attempts,
            delay,
        })
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{QueueError, Result};
use crate::queue::job::{ExecutionMode, Job, JobState};
use crate::store::{Claim, JobStore};
use crate::worker::registry::HandlerRegistry;

/// Parse a `--payload` argument. Payloads must be JSON objects since their
/// keys become handler argument names.
pub fn parse_payload(raw: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(QueueError::Validation(format!(
            "payload must be a JSON object, got {other}"
        ))),
        Err(e) => Err(QueueError::Validation(format!("invalid JSON payload: {e}"))),
    }
}

/// Enqueue, lookup and state-transition operations over the job store.
#[derive(Debug, Clone)]
pub struct QueueManager {
    store: JobStore,
    registry: Arc<HandlerRegistry>,
    default_max_retries: u32,
}

impl QueueManager {
    pub fn new(store: JobStore, registry: Arc<HandlerRegistry>, default_max_retries: u32) -> Self {
        Self {
            store,
            registry,
            default_max_retries,
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Validate and persist a new pending job.
    ///
    /// Dynamic commands must name a registered handler; payloads are only
    /// accepted for dynamic jobs.
    pub async fn enqueue(
        &self,
        command: &str,
        mode: ExecutionMode,
        payload: Option<Map<String, Value>>,
        max_retries: Option<u32>,
    ) -> Result<Job> {
        let command = command.trim();
        if command.is_empty() {
            return Err(QueueError::Validation("command must not be empty".to_string()));
        }

        match mode {
            ExecutionMode::Dynamic => {
                self.registry
                    .resolve(command)
                    .map_err(|e| QueueError::Validation(e.to_string()))?;
            }
            ExecutionMode::Shell => {
                if payload.is_some() {
                    return Err(QueueError::Validation(
                        "payload is only used by dynamic jobs".to_string(),
                    ));
                }
            }
        }

        let job = Job::new(
            command.to_string(),
            mode,
            payload,
            max_retries.unwrap_or(self.default_max_retries),
        );
        self.store.insert(&job).await?;
        tracing::info!(job_id = %job.id, mode = %job.mode, command = %job.command, "Job enqueued");
        Ok(job)
    }

    /// All live jobs, oldest first.
    pub async fn list_jobs(&self) -> Result<Vec<Job>> {
        self.store.fetch_all().await
    }

    pub async fn jobs_in_state(&self, state: JobState) -> Result<Vec<Job>> {
        self.store.fetch_by_state(state).await
    }

    pub async fn get_job(&self, id: &Uuid) -> Result<Option<Job>> {
        self.store.fetch_by_id(id).await
    }

    pub async fn counts(&self) -> Result<HashMap<JobState, u64>> {
        self.store.count_by_state().await
    }

    /// Claim the next pending job for execution.
    pub async fn claim_next(&self) -> Result<Option<Claim>> {
        self.store.claim_next().await
    }

    pub async fn mark_completed(&self, job: &mut Job, result: Value) -> Result<()> {
        job.mark_completed(result)?;
        self.store.update(job).await?;
        tracing::debug!(job_id = %job.id, "Job -> completed");
        Ok(())
    }

    pub async fn mark_failed(&self, job: &mut Job, error: String) -> Result<()> {
        job.mark_failed(error)?;
        self.store.update(job).await?;
        tracing::debug!(job_id = %job.id, attempts = job.attempts, "Job -> failed");
        Ok(())
    }

    pub async fn mark_requeued(&self, job: &mut Job) -> Result<()> {
        job.mark_requeued()?;
        self.store.update(job).await?;
        tracing::debug!(job_id = %job.id, attempts = job.attempts, "Job -> pending");
        Ok(())
    }

    /// Mark the job dead and move it to the dead-letter store. The live row
    /// is removed in the same transaction, so it is never seen as dead there.
    pub async fn mark_dead(&self, job: &mut Job) -> Result<()> {
        job.mark_dead()?;
        self.store.bury(job).await?;
        tracing::debug!(job_id = %job.id, attempts = job.attempts, "Job -> dead");
        Ok(())
    }
}

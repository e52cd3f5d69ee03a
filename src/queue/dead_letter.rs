use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::Result;
use crate::queue::job::{self, ExecutionMode, Job, JobState};
use crate::store::JobStore;

/// A job that exhausted its retries, kept for inspection or replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: Uuid,
    pub command: String,
    pub payload: Option<Map<String, Value>>,
    pub mode: ExecutionMode,
    pub attempts: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl DeadLetter {
    pub fn from_job(job: &Job) -> Self {
        Self {
            id: job.id,
            command: job.command.clone(),
            payload: job.payload.clone(),
            mode: job.mode,
            attempts: job.attempts,
            max_retries: job.max_retries,
            created_at: job.created_at,
            updated_at: job.updated_at,
            last_error: job.last_error.clone(),
        }
    }

    /// Rebuild the live job as `Pending`. Id, mode, payload, attempt count
    /// and creation time carry over unchanged.
    pub fn into_pending_job(self) -> Job {
        Job {
            id: self.id,
            command: self.command,
            payload: self.payload,
            mode: self.mode,
            state: JobState::Pending,
            attempts: self.attempts,
            max_retries: self.max_retries,
            created_at: self.created_at,
            updated_at: job::now().max(self.created_at),
            last_error: self.last_error,
            result: None,
        }
    }
}

/// List, replay and purge operations over the dead-letter table.
#[derive(Debug, Clone)]
pub struct DeadLetterQueue {
    store: JobStore,
}

impl DeadLetterQueue {
    pub fn new(store: JobStore) -> Self {
        Self { store }
    }

    pub async fn list(&self) -> Result<Vec<DeadLetter>> {
        let entries = self.store.list_dead().await?;
        tracing::debug!(count = entries.len(), "Listed dead-letter entries");
        Ok(entries)
    }

    pub async fn get(&self, id: &Uuid) -> Result<Option<DeadLetter>> {
        self.store.fetch_dead(id).await
    }

    /// Move a job out of the dead-letter table and back into the queue as
    /// pending. Returns `false` if no entry has this id.
    pub async fn retry(&self, id: &Uuid) -> Result<bool> {
        match self.store.restore_dead(id).await? {
            Some(job) => {
                tracing::info!(
                    job_id = %id,
                    mode = %job.mode,
                    attempts = job.attempts,
                    "Dead-letter entry restored"
                );
                Ok(true)
            }
            None => {
                tracing::warn!(job_id = %id, "Dead-letter entry not found");
                Ok(false)
            }
        }
    }

    /// Drop every entry. Returns how many were removed.
    pub async fn purge(&self) -> Result<u64> {
        let purged = self.store.purge_dead().await?;
        tracing::warn!(purged, "Dead-letter queue purged");
        Ok(purged)
    }
}

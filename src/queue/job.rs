use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{QueueError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
    Dead,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }

    /// Completed and dead jobs never run again without an explicit restore.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Dead)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "dead" => Ok(JobState::Dead),
            other => Err(QueueError::Corrupt(format!("unknown job state {other:?}"))),
        }
    }
}

/// How the dispatcher runs a job's command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// `sh -c <command>`
    #[default]
    Shell,
    /// `target.callable` looked up in the handler registry
    Dynamic,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Shell => "shell",
            ExecutionMode::Dynamic => "dynamic",
        }
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "shell" => Ok(ExecutionMode::Shell),
            "dynamic" => Ok(ExecutionMode::Dynamic),
            other => Err(QueueError::Corrupt(format!(
                "unknown execution mode {other:?}"
            ))),
        }
    }
}

/// Current time at the precision rows are stored with (microseconds), so a
/// job compares equal to itself after a round trip through the store.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub command: String,
    pub payload: Option<Map<String, Value>>,
    pub mode: ExecutionMode,
    pub state: JobState,
    pub attempts: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
    /// Return value of the successful run
    pub result: Option<Value>,
}

impl Job {
    /// Create a pending job. Ids are v7 UUIDs so they sort by creation time,
    /// which keeps the claim tie-break in insertion order.
    pub fn new(
        command: String,
        mode: ExecutionMode,
        payload: Option<Map<String, Value>>,
        max_retries: u32,
    ) -> Self {
        let now = now();
        Self {
            id: Uuid::now_v7(),
            command,
            payload,
            mode,
            state: JobState::Pending,
            attempts: 0,
            max_retries,
            created_at: now,
            updated_at: now,
            last_error: None,
            result: None,
        }
    }

    /// True once the job has failed more times than it may be retried.
    pub fn retries_exhausted(&self) -> bool {
        self.attempts > self.max_retries
    }

    /// `Processing -> Completed`
    pub fn mark_completed(&mut self, result: Value) -> Result<()> {
        self.transition(&[JobState::Processing], JobState::Completed)?;
        self.last_error = None;
        self.result = Some(result);
        Ok(())
    }

    /// `Processing -> Failed`, counting the failure.
    pub fn mark_failed(&mut self, error: String) -> Result<()> {
        self.transition(&[JobState::Processing], JobState::Failed)?;
        self.attempts += 1;
        self.last_error = Some(error);
        Ok(())
    }

    /// `Failed -> Pending`, only while retries remain.
    pub fn mark_requeued(&mut self) -> Result<()> {
        if self.retries_exhausted() {
            return Err(QueueError::InvalidTransition {
                from: self.state,
                to: JobState::Pending,
            });
        }
        self.transition(&[JobState::Failed], JobState::Pending)
    }

    /// `Processing | Failed -> Dead`, only once retries are exhausted.
    pub fn mark_dead(&mut self) -> Result<()> {
        if !self.retries_exhausted() {
            return Err(QueueError::InvalidTransition {
                from: self.state,
                to: JobState::Dead,
            });
        }
        self.transition(&[JobState::Processing, JobState::Failed], JobState::Dead)
    }

    fn transition(&mut self, allowed: &[JobState], to: JobState) -> Result<()> {
        if !allowed.contains(&self.state) {
            return Err(QueueError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        self.updated_at = now().max(self.created_at);
        Ok(())
    }
}

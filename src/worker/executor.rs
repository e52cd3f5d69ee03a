use std::process::Stdio;
use std::sync::Arc;

use serde_json::Value;
use tokio::process::Command;

use crate::config::ExecutorConfig;
use crate::error::DispatchError;
use crate::queue::job::{ExecutionMode, Job};
use crate::worker::registry::{HandlerRegistry, JobArgs};

/// Executes a claimed job's command.
///
/// Shell jobs run as `sh -c <command>` with a hard timeout. Dynamic jobs call
/// a handler from the [`HandlerRegistry`]; they have no timeout and occupy the
/// calling worker until the handler returns.
///
/// The executor never reads or writes the store.
#[derive(Debug, Clone)]
pub struct JobExecutor {
    config: ExecutorConfig,
    registry: Arc<HandlerRegistry>,
}

impl JobExecutor {
    pub fn new(config: ExecutorConfig, registry: Arc<HandlerRegistry>) -> Self {
        Self { config, registry }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Run `job` and return its result value.
    pub async fn execute(&self, job: &Job) -> Result<Value, DispatchError> {
        tracing::info!(job_id = %job.id, mode = %job.mode, command = %job.command, "Executing job");
        match job.mode {
            ExecutionMode::Shell => self.execute_shell(job).await,
            ExecutionMode::Dynamic => self.execute_dynamic(job).await,
        }
    }

    async fn execute_shell(&self, job: &Job) -> Result<Value, DispatchError> {
        let child = Command::new("sh")
            .arg("-c")
            .arg(&job.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // On timeout the wait future is dropped, which drops and kills the child.
        let output = tokio::time::timeout(self.config.shell_timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                tracing::error!(job_id = %job.id, "Shell job timed out");
                DispatchError::Timeout(self.config.shell_timeout.as_secs())
            })??;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let exit_code = output.status.code();

        if !output.status.success() {
            let stderr = if stderr.is_empty() {
                "no stderr".to_string()
            } else {
                truncate(&stderr, self.config.stderr_limit)
            };
            tracing::error!(job_id = %job.id, exit_code = ?exit_code, stderr = %stderr, "Shell job failed");
            return Err(DispatchError::NonZeroExit {
                code: exit_code,
                stderr,
            });
        }

        tracing::info!(job_id = %job.id, exit_code = ?exit_code, "Shell job succeeded");
        Ok(Value::String(stdout))
    }

    async fn execute_dynamic(&self, job: &Job) -> Result<Value, DispatchError> {
        let handler = self.registry.resolve(&job.command)?;
        let args: JobArgs = job.payload.clone().unwrap_or_default();

        let logged_args = serde_json::Value::Object(args.clone());
        tracing::debug!(job_id = %job.id, args = %logged_args, "Calling handler");
        let result = tokio::task::spawn_blocking(move || handler.call(&args))
            .await
            .map_err(|e| DispatchError::Handler(format!("handler panicked: {e}")))?;

        match &result {
            Ok(value) => tracing::info!(job_id = %job.id, result = %value, "Handler returned"),
            Err(e) => tracing::error!(job_id = %job.id, error = %e, "Handler failed"),
        }
        result
    }
}

/// Cut `text` to at most `limit` characters, marking the cut.
pub fn truncate(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}...(truncated)", &text[..cut]),
        None => text.to_string(),
    }
}

use std::time::Duration;

use crate::config::QueueConfig;

/// Exponential backoff between a failed attempt and the job's requeue.
///
/// `delay(attempt) = unit * base ^ attempt`, where `attempt` is the failure
/// count after incrementing (so the first retry waits `base ^ 1` units).
/// The unit is one second outside of tests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    backoff_base: f64,
    unit: Duration,
}

impl RetryPolicy {
    pub fn new(backoff_base: f64) -> Self {
        Self {
            backoff_base,
            unit: Duration::from_secs(1),
        }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.retry_backoff_base)
    }

    pub fn with_unit(mut self, unit: Duration) -> Self {
        self.unit = unit;
        self
    }

    pub fn backoff_base(&self) -> f64 {
        self.backoff_base
    }

    /// Backoff multiplier for `attempt`, in units.
    pub fn factor(&self, attempt: u32) -> f64 {
        let exponent = i32::try_from(attempt.max(1)).unwrap_or(i32::MAX);
        self.backoff_base.powi(exponent)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let secs = self.unit.as_secs_f64() * self.factor(attempt);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(QueueConfig::default().retry_backoff_base)
    }
}

//! In-process job metrics.
//!
//! Workers report each outcome and a heartbeat per loop iteration; the
//! [`MetricsReporter`] logs a snapshot on a fixed interval when metrics are
//! enabled.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// A worker without a heartbeat for this long no longer counts as active.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub processed: u64,
    pub failed: u64,
    /// Mean seconds per successful job
    pub avg_exec_time: f64,
    pub active_workers: usize,
}

#[derive(Debug, Default)]
struct Counters {
    processed: u64,
    failed: u64,
    total_exec_time: Duration,
    heartbeats: HashMap<u64, Instant>,
}

#[derive(Debug, Default)]
pub struct Metrics {
    counters: Mutex<Counters>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock cannot leave the counters inconsistent.
    fn lock(&self) -> MutexGuard<'_, Counters> {
        self.counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn on_job_success(&self, exec_time: Duration) {
        let mut counters = self.lock();
        counters.processed += 1;
        counters.total_exec_time += exec_time;
    }

    pub fn on_job_failure(&self) {
        self.lock().failed += 1;
    }

    pub fn heartbeat(&self, worker_id: u64) {
        self.lock().heartbeats.insert(worker_id, Instant::now());
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self.lock();
        let avg = if counters.processed == 0 {
            0.0
        } else {
            counters.total_exec_time.as_secs_f64() / counters.processed as f64
        };
        MetricsSnapshot {
            processed: counters.processed,
            failed: counters.failed,
            avg_exec_time: (avg * 10_000.0).round() / 10_000.0,
            active_workers: counters
                .heartbeats
                .values()
                .filter(|seen| seen.elapsed() <= HEARTBEAT_TIMEOUT)
                .count(),
        }
    }
}

/// Periodically logs a [`MetricsSnapshot`].
pub struct MetricsReporter {
    interval: Duration,
}

impl MetricsReporter {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Log snapshots until `shutdown` is cancelled.
    pub async fn run(&self, metrics: Arc<Metrics>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let snapshot = metrics.snapshot();
                    tracing::info!(
                        processed = snapshot.processed,
                        failed = snapshot.failed,
                        avg_exec_time = snapshot.avg_exec_time,
                        active_workers = snapshot.active_workers,
                        "Metrics"
                    );
                }
                _ = shutdown.cancelled() => break,
            }
        }
    }
}

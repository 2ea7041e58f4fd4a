//! Worker harness: single-flight execution with a timeout race.
//!
//! Processors only implement [`JobProcessor::process`]; claiming, timing out and stats
//! live here once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kindred_core::error::{KindredError, Result};
use serde::{Deserialize, Serialize};

use crate::job::{Job, JobType};

/// A strategy for one job type.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// Display name for logs and status.
    fn name(&self) -> &str;

    /// The job type this processor handles.
    fn job_type(&self) -> JobType;

    /// Run the job and return its result payload.
    async fn process(&self, job: &Job) -> Result<serde_json::Value>;
}

/// Per-worker counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerStats {
    pub processed: u64,
    pub failed: u64,
    pub total_processing_ms: u64,
    pub avg_processing_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub name: String,
    pub job_type: JobType,
    pub is_running: bool,
    pub current_job: Option<String>,
    pub stats: WorkerStats,
}

/// One registered executor.
pub struct Worker {
    processor: Arc<dyn JobProcessor>,
    running: AtomicBool,
    current_job: Mutex<Option<String>>,
    stats: Mutex<WorkerStats>,
}

/// Proof that the worker was claimed. Dropping it frees the worker.
pub struct WorkerLease {
    worker: Arc<Worker>,
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        if let Ok(mut current) = self.worker.current_job.lock() {
            *current = None;
        }
        self.worker.running.store(false, Ordering::Release);
    }
}

impl Worker {
    pub fn new(processor: Arc<dyn JobProcessor>) -> Arc<Self> {
        Arc::new(Self {
            processor,
            running: AtomicBool::new(false),
            current_job: Mutex::new(None),
            stats: Mutex::new(WorkerStats::default()),
        })
    }

    pub fn name(&self) -> &str {
        self.processor.name()
    }

    pub fn job_type(&self) -> JobType {
        self.processor.job_type()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Claim the worker for one job, or `None` if it is busy.
    pub fn try_claim(self: &Arc<Self>) -> Option<WorkerLease> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| WorkerLease {
                worker: self.clone(),
            })
    }

    /// Claim and run in one step.
    pub async fn run(self: &Arc<Self>, job: Job) -> Result<serde_json::Value> {
        let lease = self
            .try_claim()
            .ok_or_else(|| KindredError::WorkerBusy(self.name().to_string()))?;
        self.execute(lease, job).await
    }

    /// Run `job` under a claimed lease, racing it against `job.timeout_ms`.
    ///
    /// On timeout the processor task is detached, not aborted: it keeps running to
    /// completion in the background and its result is discarded.
    pub async fn execute(&self, lease: WorkerLease, job: Job) -> Result<serde_json::Value> {
        debug_assert!(std::ptr::eq(Arc::as_ptr(&lease.worker), self));
        if let Ok(mut current) = self.current_job.lock() {
            *current = Some(job.id.clone());
        }
        let started = tokio::time::Instant::now();
        let timeout_ms = job.timeout_ms;
        let job_id = job.id.clone();

        let processor = self.processor.clone();
        let task = tokio::spawn(async move { processor.process(&job).await });

        let outcome = match tokio::time::timeout(Duration::from_millis(timeout_ms), task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(KindredError::JobFailed(format!(
                "processor task ended abnormally: {join_err}"
            ))),
            Err(_) => {
                tracing::warn!("⏱️ Worker '{}' timed out on {job_id} after {timeout_ms} ms", self.name());
                Err(KindredError::JobTimeout { job_id, timeout_ms })
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        if let Ok(mut stats) = self.stats.lock() {
            match outcome {
                Ok(_) => {
                    stats.processed += 1;
                    stats.total_processing_ms += elapsed_ms;
                    stats.avg_processing_ms =
                        stats.total_processing_ms as f64 / stats.processed as f64;
                }
                Err(_) => stats.failed += 1,
            }
        }

        drop(lease);
        outcome
    }

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus {
            name: self.name().to_string(),
            job_type: self.job_type(),
            is_running: self.is_running(),
            current_job: self.current_job.lock().ok().and_then(|c| c.clone()),
            stats: self.stats.lock().map(|s| s.clone()).unwrap_or_default(),
        }
    }
}

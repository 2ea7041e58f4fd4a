//! Queue manager: routes job types onto their category queue.

use std::sync::Arc;

use kindred_core::config::{QueueConfig, WorkerConfig};
use kindred_core::error::{KindredError, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::job::{Job, JobOptions, JobType};
use crate::queue::{FailOutcome, JobQueue, JobQueueSettings, QueueCategory, QueueSnapshot, QueueStatus};

/// Status of every queue plus totals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverallStatus {
    pub queues: Vec<QueueStatus>,
    pub total_pending: usize,
    pub total_running: usize,
    pub total_completed: usize,
    pub total_failed: usize,
}

/// Owns the fixed set of category queues.
pub struct QueueManager {
    queues: Vec<(QueueCategory, Arc<Mutex<JobQueue>>)>,
}

impl QueueManager {
    /// Build one queue per category with the configured limits.
    pub fn new(queues: &QueueConfig, workers: &WorkerConfig) -> Self {
        let queues = QueueCategory::ALL
            .into_iter()
            .map(|category| {
                let settings = JobQueueSettings {
                    max_concurrent: category.max_concurrent(queues),
                    enable_retry: queues.enable_retry,
                    retry_delay_ms: queues.retry_delay_ms,
                    max_queue_size: queues.max_queue_size,
                    history_size: queues.history_size,
                    default_max_retries: workers.default_max_retries,
                    default_timeout_ms: workers.default_timeout_ms,
                };
                (
                    category,
                    Arc::new(Mutex::new(JobQueue::new(category.as_str(), settings))),
                )
            })
            .collect();
        Self { queues }
    }

    /// Same settings for every category. Handy in tests.
    pub fn with_settings(settings: JobQueueSettings) -> Self {
        let queues = QueueCategory::ALL
            .into_iter()
            .map(|category| {
                (
                    category,
                    Arc::new(Mutex::new(JobQueue::new(category.as_str(), settings.clone()))),
                )
            })
            .collect();
        Self { queues }
    }

    pub fn queue(&self, category: QueueCategory) -> Arc<Mutex<JobQueue>> {
        self.queues
            .iter()
            .find(|(c, _)| *c == category)
            .map(|(_, q)| q.clone())
            .unwrap_or_else(|| self.queues[0].1.clone())
    }

    pub fn queues(&self) -> impl Iterator<Item = (QueueCategory, Arc<Mutex<JobQueue>>)> + '_ {
        self.queues.iter().map(|(c, q)| (*c, q.clone()))
    }

    /// Admit a job by type name.
    pub async fn add_job(
        &self,
        job_type: &str,
        data: serde_json::Value,
        options: JobOptions,
    ) -> Result<Job> {
        let job_type: JobType = job_type.parse()?;
        self.add_typed(job_type, data, options).await
    }

    pub async fn add_typed(
        &self,
        job_type: JobType,
        data: serde_json::Value,
        options: JobOptions,
    ) -> Result<Job> {
        let queue = self.queue(job_type.category());
        let job = queue.lock().await.add(job_type, data, &options)?;
        tracing::info!(
            "📥 Job added: {} {} → {} (priority {})",
            job.job_type,
            job.id,
            job.job_type.category(),
            job.priority
        );
        Ok(job)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Job> {
        for (_, queue) in &self.queues {
            if let Some(job) = queue.lock().await.get(job_id) {
                return Ok(job);
            }
        }
        Err(KindredError::NotFound(format!("job '{job_id}'")))
    }

    /// Cancel a pending job in whichever queue holds it.
    pub async fn cancel_job(&self, job_id: &str) -> bool {
        for (_, queue) in &self.queues {
            if queue.lock().await.cancel(job_id) {
                tracing::info!("🚫 Job cancelled: {job_id}");
                return true;
            }
        }
        false
    }

    pub async fn queue_status(&self, name: &str) -> Result<QueueStatus> {
        let category: QueueCategory = name.parse()?;
        Ok(self.queue(category).lock().await.status())
    }

    pub async fn queue_snapshot(&self, name: &str) -> Result<QueueSnapshot> {
        let category: QueueCategory = name.parse()?;
        Ok(self.queue(category).lock().await.snapshot())
    }

    pub async fn overall_status(&self) -> OverallStatus {
        let mut queues = Vec::with_capacity(self.queues.len());
        for (_, queue) in &self.queues {
            queues.push(queue.lock().await.status());
        }
        OverallStatus {
            total_pending: queues.iter().map(|q| q.pending).sum(),
            total_running: queues.iter().map(|q| q.running).sum(),
            total_completed: queues.iter().map(|q| q.completed).sum(),
            total_failed: queues.iter().map(|q| q.failed).sum(),
            queues,
        }
    }

    /// Drop pending work from one queue. Returns how many jobs were dropped.
    pub async fn clear_queue(&self, name: &str) -> Result<usize> {
        let category: QueueCategory = name.parse()?;
        let dropped = self.queue(category).lock().await.clear();
        tracing::info!("🧹 Queue '{name}' cleared ({dropped} pending dropped)");
        Ok(dropped)
    }

    pub async fn clear_all(&self) -> usize {
        let mut dropped = 0;
        for (_, queue) in &self.queues {
            dropped += queue.lock().await.clear();
        }
        tracing::info!("🧹 All queues cleared ({dropped} pending dropped)");
        dropped
    }

    pub async fn complete(&self, job: &Job, result: serde_json::Value) {
        let queue = self.queue(job.job_type.category());
        let done = queue.lock().await.complete(&job.id, result);
        if let Some(done) = done {
            tracing::info!(
                "✅ Job completed: {} {} ({} ms)",
                done.job_type,
                done.id,
                done.processing_ms().unwrap_or_default()
            );
        }
    }

    /// Apply the retry policy to a failed run. A retried job is re-admitted after the
    /// queue's fixed delay by a detached timer task.
    pub async fn fail(&self, job: &Job, error: &KindredError) -> FailOutcome {
        let queue = self.queue(job.job_type.category());
        let outcome = if error.is_retryable() {
            queue.lock().await.fail(&job.id, &error.to_string())
        } else {
            queue.lock().await.fail_permanently(&job.id, &error.to_string())
        };

        match outcome {
            FailOutcome::Retrying { attempt, delay } => {
                tracing::warn!(
                    "🔄 Job {} failed ({error}), retry {attempt}/{} in {} ms",
                    job.id,
                    job.max_retries,
                    delay.as_millis()
                );
                let job_id = job.id.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    queue.lock().await.readmit(&job_id);
                });
            }
            FailOutcome::Failed => {
                tracing::warn!("❌ Job failed permanently: {} {} ({error})", job.job_type, job.id);
            }
            FailOutcome::Ignored => {}
        }
        outcome
    }
}

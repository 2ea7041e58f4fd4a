//! Worker manager: the polling dispatch loop.
//!
//! Every tick visits each category queue and hands at most one ready job to the
//! worker registered for its type. Execution runs on its own task, so a slow job
//! never blocks the loop; completion and failure report back to the queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use kindred_core::error::KindredError;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::job::JobType;
use crate::manager::QueueManager;
use crate::queue::QueueStatus;
use crate::worker::{JobProcessor, Worker, WorkerStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerManagerStatus {
    pub running: bool,
    pub workers: Vec<WorkerStatus>,
    pub queues: Vec<QueueStatus>,
}

/// Registry of workers plus the dispatch loop handle.
pub struct WorkerManager {
    queues: Arc<QueueManager>,
    workers: HashMap<JobType, Arc<Worker>>,
    dispatcher: StdMutex<Option<JoinHandle<()>>>,
}

impl WorkerManager {
    pub fn new(queues: Arc<QueueManager>) -> Self {
        Self {
            queues,
            workers: HashMap::new(),
            dispatcher: StdMutex::new(None),
        }
    }

    /// Register (or replace) the processor for its job type.
    pub fn register(&mut self, processor: Arc<dyn JobProcessor>) {
        let job_type = processor.job_type();
        tracing::debug!("🧩 Worker registered: {} → {}", processor.name(), job_type);
        self.workers.insert(job_type, Worker::new(processor));
    }

    pub fn worker(&self, job_type: JobType) -> Option<Arc<Worker>> {
        self.workers.get(&job_type).cloned()
    }

    pub fn is_running(&self) -> bool {
        self.dispatcher
            .lock()
            .map(|d| d.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }

    /// Spawn the dispatch loop. A second call while running is a no-op.
    pub fn start(self: &Arc<Self>, poll_interval_ms: u64) {
        let Ok(mut slot) = self.dispatcher.lock() else {
            return;
        };
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            tracing::info!("⚙️ Worker manager already running");
            return;
        }

        tracing::info!(
            "⚙️ Worker manager started (poll every {poll_interval_ms} ms, {} workers)",
            self.workers.len()
        );
        let manager = self.clone();
        *slot = Some(tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(poll_interval_ms.max(1)));
            loop {
                interval.tick().await;
                manager.poll_once().await;
            }
        }));
    }

    /// Stop dispatching. Jobs already executing run to completion.
    pub fn stop(&self) {
        let handle = self.dispatcher.lock().ok().and_then(|mut d| d.take());
        match handle {
            Some(handle) => {
                handle.abort();
                tracing::info!("⚙️ Worker manager stopped");
            }
            None => tracing::info!("⚙️ Worker manager not running"),
        }
    }

    /// One dispatch pass over every queue. Returns how many jobs were launched.
    pub async fn poll_once(&self) -> usize {
        let mut launched = 0;
        for (_, queue) in self.queues.queues() {
            let mut q = queue.lock().await;
            let Some(job) = q.get_next() else {
                continue;
            };

            let Some(worker) = self.workers.get(&job.job_type).cloned() else {
                let err = KindredError::WorkerMissing(job.job_type.to_string());
                tracing::error!("🚨 No worker registered for '{}', failing {}", job.job_type, job.id);
                q.fail_permanently(&job.id, &err.to_string());
                continue;
            };

            let Some(lease) = worker.try_claim() else {
                tracing::debug!("⏳ Worker '{}' busy, {} back to front", worker.name(), job.id);
                q.requeue_front(&job.id);
                continue;
            };

            let Some(job) = q.start(&job.id) else {
                continue;
            };
            drop(q);

            tracing::debug!("▶️ Dispatching {} {} to '{}'", job.job_type, job.id, worker.name());
            let queues = self.queues.clone();
            tokio::spawn(async move {
                match worker.execute(lease, job.clone()).await {
                    Ok(result) => queues.complete(&job, result).await,
                    Err(err) => {
                        queues.fail(&job, &err).await;
                    }
                }
            });
            launched += 1;
        }
        launched
    }

    pub async fn status(&self) -> WorkerManagerStatus {
        let mut workers: Vec<WorkerStatus> = self.workers.values().map(|w| w.status()).collect();
        workers.sort_by_key(|w| w.job_type);
        WorkerManagerStatus {
            running: self.is_running(),
            workers,
            queues: self.queues.overall_status().await.queues,
        }
    }
}

impl Drop for WorkerManager {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.dispatcher.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobOptions, JobStatus};
    use crate::queue::{JobQueueSettings, QueueCategory};
    use crate::worker::tests::ScriptedProcessor;
    use crate::workers::builtin_processors;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn setup(settings: JobQueueSettings) -> (Arc<QueueManager>, WorkerManager) {
        let queues = Arc::new(QueueManager::with_settings(settings));
        let manager = WorkerManager::new(queues.clone());
        (queues, manager)
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_completes_job() {
        let (queues, mut manager) = setup(JobQueueSettings::default());
        for p in builtin_processors() {
            manager.register(p);
        }
        let job = queues
            .add_job("analyze_sentiment", json!({"text": "great"}), JobOptions::default())
            .await
            .unwrap();

        assert_eq!(manager.poll_once().await, 1);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let done = queues.get_job(&job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.result.unwrap()["sentiment"], "positive");
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_worker_fails_without_retry() {
        let (queues, manager) = setup(JobQueueSettings::default());
        let job = queues.add_job("tts", json!({}), JobOptions::default()).await.unwrap();

        manager.poll_once().await;
        let failed = queues.get_job(&job.id).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.retries, 0);
        assert!(failed.error.unwrap().contains("tts"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_worker_requeues_at_front() {
        let (queues, mut manager) = setup(JobQueueSettings {
            max_concurrent: 2,
            ..Default::default()
        });
        let processor = ScriptedProcessor::new(JobType::Summarize, Duration::from_secs(1), false);
        let calls = processor.calls.clone();
        manager.register(Arc::new(processor));

        let first = queues
            .add_job("summarize", json!({}), JobOptions::default().priority(9))
            .await
            .unwrap();
        let second = queues
            .add_job("summarize", json!({}), JobOptions::default().priority(1))
            .await
            .unwrap();

        manager.poll_once().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.poll_once().await;

        // Worker is single-flight, so the second job waits in pending.
        let queue = queues.queue(QueueCategory::Summarization);
        assert_eq!(queue.lock().await.running_len(), 1);
        assert_eq!(queue.lock().await.pending_len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        manager.poll_once().await;
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(queues.get_job(&first.id).await.unwrap().status, JobStatus::Completed);
        assert_eq!(queues.get_job(&second.id).await.unwrap().status, JobStatus::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_retry_until_failed() {
        let (queues, mut manager) = setup(JobQueueSettings {
            retry_delay_ms: 100,
            ..Default::default()
        });
        manager.register(Arc::new(ScriptedProcessor::new(
            JobType::Cleanup,
            Duration::from_secs(10),
            false,
        )));
        let manager = Arc::new(manager);
        let job = queues
            .add_job(
                "cleanup",
                json!({}),
                JobOptions::default().max_retries(2).timeout_ms(50),
            )
            .await
            .unwrap();

        manager.start(20);
        let mut seen_retries = Vec::new();
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let current = queues.get_job(&job.id).await.unwrap();
            if seen_retries.last() != Some(&current.retries) {
                seen_retries.push(current.retries);
            }
            if current.status == JobStatus::Failed {
                break;
            }
        }
        manager.stop();

        let failed = queues.get_job(&job.id).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.retries, 2);
        assert!(failed.error.unwrap().contains("timed out"));
        assert!(seen_retries.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(queues.queue(QueueCategory::Maintenance).lock().await.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_stop_are_idempotent() {
        let (_queues, manager) = setup(JobQueueSettings::default());
        let manager = Arc::new(manager);
        assert!(!manager.is_running());
        manager.start(100);
        manager.start(100);
        assert!(manager.is_running());
        manager.stop();
        manager.stop();
        tokio::task::yield_now().await;
        assert!(!manager.is_running());
        assert!(!manager.status().await.running);
    }
}

//! Composition root: wires queues, workers, schedules and the proactive loop.
//!
//! One `SchedulerRuntime` per process, built explicitly and passed around by handle.

use std::sync::Arc;

use kindred_core::config::KindredConfig;
use kindred_core::error::Result;

use crate::delivery::DeliveryChannel;
use crate::job::{Job, JobOptions};
use crate::manager::{OverallStatus, QueueManager};
use crate::persistence::SchedulerDb;
use crate::pool::{WorkerManager, WorkerManagerStatus};
use crate::proactive::{ActivityTracker, ProactiveTriggerEvaluator};
use crate::queue::QueueStatus;
use crate::scheduled::{ScheduleReceipt, ScheduleUpdate, ScheduledMessageScheduler};
use crate::store::PersistedSchedule;
use crate::worker::JobProcessor;
use crate::workers::builtin_processors;

pub struct SchedulerRuntime {
    config: KindredConfig,
    queues: Arc<QueueManager>,
    workers: Arc<WorkerManager>,
    schedules: Arc<ScheduledMessageScheduler>,
    proactive: Arc<ProactiveTriggerEvaluator>,
    activity: ActivityTracker,
}

impl SchedulerRuntime {
    /// Build every service. Built-in processors are registered first, so `extra`
    /// processors for the same job type replace them.
    pub fn new(
        config: KindredConfig,
        db: Arc<SchedulerDb>,
        channel: Arc<dyn DeliveryChannel>,
        extra: Vec<Arc<dyn JobProcessor>>,
    ) -> Self {
        let queues = Arc::new(QueueManager::new(&config.queues, &config.workers));

        let mut workers = WorkerManager::new(queues.clone());
        for processor in builtin_processors().into_iter().chain(extra) {
            workers.register(processor);
        }

        let schedules = Arc::new(ScheduledMessageScheduler::new(db.clone(), channel.clone()));
        let activity = ActivityTracker::new();
        let proactive = Arc::new(ProactiveTriggerEvaluator::new(
            &config.proactive,
            db,
            channel,
            activity.clone(),
        ));

        Self {
            config,
            queues,
            workers: Arc::new(workers),
            schedules,
            proactive,
            activity,
        }
    }

    pub fn config(&self) -> &KindredConfig {
        &self.config
    }

    /// Restore schedules, then start the store sync, dispatch and (if enabled) the
    /// proactive loop.
    pub async fn start(&self) -> Result<()> {
        self.schedules.restore_scheduled_messages().await?;
        self.schedules.start_sync(self.config.schedule.sync_interval_secs);
        self.start_workers(self.config.workers.poll_interval_ms);
        if self.config.proactive.enabled {
            self.proactive.start(self.config.proactive.interval_secs);
        }
        Ok(())
    }

    /// Stop loops and timers. Pending schedules stay in storage.
    pub async fn shutdown(&self) {
        self.stop_workers();
        self.proactive.stop();
        self.schedules.shutdown().await;
        tracing::info!("🛑 Scheduler runtime stopped");
    }

    // ── Jobs ───────────────────────────────────────────────

    pub async fn add_job(
        &self,
        job_type: &str,
        data: serde_json::Value,
        options: JobOptions,
    ) -> Result<Job> {
        self.queues.add_job(job_type, data, options).await
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Job> {
        self.queues.get_job(job_id).await
    }

    pub async fn cancel_job(&self, job_id: &str) -> bool {
        self.queues.cancel_job(job_id).await
    }

    pub async fn queue_status(&self, name: &str) -> Result<QueueStatus> {
        self.queues.queue_status(name).await
    }

    pub async fn overall_status(&self) -> OverallStatus {
        self.queues.overall_status().await
    }

    pub fn start_workers(&self, poll_interval_ms: u64) {
        self.workers.start(poll_interval_ms);
    }

    pub fn stop_workers(&self) {
        self.workers.stop();
    }

    pub async fn worker_status(&self) -> WorkerManagerStatus {
        self.workers.status().await
    }

    // ── Schedules ──────────────────────────────────────────

    pub async fn schedule(&self, message: &str, delay_seconds: i64) -> Result<ScheduleReceipt> {
        self.schedules.schedule(message, delay_seconds).await
    }

    pub async fn cancel_schedule(&self, id: i64) -> Result<String> {
        self.schedules.cancel(id).await
    }

    pub async fn update_schedule(&self, id: i64, update: ScheduleUpdate) -> Result<ScheduleReceipt> {
        self.schedules.update(id, update).await
    }

    pub fn list_schedules(&self) -> Result<Vec<PersistedSchedule>> {
        self.schedules.list()
    }

    // ── Proactive ──────────────────────────────────────────

    pub fn activity(&self) -> &ActivityTracker {
        &self.activity
    }

    pub fn proactive(&self) -> &Arc<ProactiveTriggerEvaluator> {
        &self.proactive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::tests::RecordingChannel;
    use crate::job::JobStatus;
    use serde_json::json;
    use std::time::Duration;

    fn runtime() -> (Arc<RecordingChannel>, SchedulerRuntime) {
        let mut config = KindredConfig::default();
        config.workers.poll_interval_ms = 10;
        config.proactive.enabled = false;
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let channel = Arc::new(RecordingChannel::new());
        let runtime = SchedulerRuntime::new(config, db, channel.clone(), Vec::new());
        (channel, runtime)
    }

    #[tokio::test(start_paused = true)]
    async fn test_jobs_and_schedules_end_to_end() {
        let (channel, rt) = runtime();
        rt.start().await.unwrap();

        let job = rt
            .add_job(
                "generate_tags",
                json!({"text": "tokio tokio runtime"}),
                JobOptions::default(),
            )
            .await
            .unwrap();
        let missing = rt.add_job("stt", json!({}), JobOptions::default()).await.unwrap();
        let receipt = rt.schedule("hydrate", 2).await.unwrap();
        assert_eq!(rt.list_schedules().unwrap().len(), 1);

        tokio::time::sleep(Duration::from_secs(3)).await;

        let done = rt.get_job(&job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.result.unwrap()["tags"][0], "tokio");
        assert_eq!(rt.get_job(&missing.id).await.unwrap().status, JobStatus::Failed);
        assert_eq!(channel.messages(), vec!["hydrate"]);
        assert!(rt.list_schedules().unwrap().is_empty());
        assert!(rt.cancel_schedule(receipt.id).await.is_err());

        let status = rt.worker_status().await;
        assert!(status.running);
        assert_eq!(status.workers.len(), 6);

        rt.shutdown().await;
        assert!(!rt.worker_status().await.running);
    }

    #[tokio::test]
    async fn test_overall_status_counts() {
        let (_channel, rt) = runtime();
        rt.add_job("archive", json!({"sessionId": "s"}), JobOptions::default())
            .await
            .unwrap();
        let status = rt.overall_status().await;
        assert_eq!(status.total_pending, 1);
        assert_eq!(rt.queue_status("maintenance").await.unwrap().pending, 1);
    }
}

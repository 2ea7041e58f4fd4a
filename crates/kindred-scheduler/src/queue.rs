//! Category job queue: priority-ordered pending list with a bounded in-flight set.
//!
//! One queue per job family, each with its own concurrency budget, so an expensive
//! category (media) cannot hog the slots cheap categories (tagging) need.
//! `JobQueue` itself is plain synchronous state; `QueueManager` wraps each one in a
//! mutex and owns the async parts (delayed retry re-admission).

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use chrono::Utc;
use kindred_core::config::QueueConfig;
use kindred_core::error::{KindredError, Result};
use serde::{Deserialize, Serialize};

use crate::job::{Job, JobOptions, JobStatus, JobType};

/// Queue family. Determines which concurrency budget a job draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueCategory {
    Default,
    Summarization,
    Analysis,
    Media,
    Maintenance,
}

impl QueueCategory {
    pub const ALL: [QueueCategory; 5] = [
        QueueCategory::Default,
        QueueCategory::Summarization,
        QueueCategory::Analysis,
        QueueCategory::Media,
        QueueCategory::Maintenance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueCategory::Default => "default",
            QueueCategory::Summarization => "summarization",
            QueueCategory::Analysis => "analysis",
            QueueCategory::Media => "media",
            QueueCategory::Maintenance => "maintenance",
        }
    }

    /// Configured concurrency budget for this category.
    pub fn max_concurrent(&self, config: &QueueConfig) -> usize {
        let limits = &config.max_concurrent;
        match self {
            QueueCategory::Default => limits.default,
            QueueCategory::Summarization => limits.summarization,
            QueueCategory::Analysis => limits.analysis,
            QueueCategory::Media => limits.media,
            QueueCategory::Maintenance => limits.maintenance,
        }
    }
}

impl std::fmt::Display for QueueCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QueueCategory {
    type Err = KindredError;

    fn from_str(s: &str) -> Result<Self> {
        QueueCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| KindredError::NotFound(format!("queue '{s}'")))
    }
}

/// Per-queue limits and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobQueueSettings {
    pub max_concurrent: usize,
    pub enable_retry: bool,
    pub retry_delay_ms: u64,
    pub max_queue_size: usize,
    pub history_size: usize,
    pub default_max_retries: u32,
    pub default_timeout_ms: u64,
}

impl Default for JobQueueSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            enable_retry: true,
            retry_delay_ms: 5000,
            max_queue_size: 1000,
            history_size: 100,
            default_max_retries: 3,
            default_timeout_ms: 60_000,
        }
    }
}

/// Running counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub total_jobs: u64,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    /// Mean processing time of completed jobs, in milliseconds.
    pub avg_processing_time: f64,
}

/// Aggregate counts for one queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatus {
    pub name: String,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub max_concurrent: usize,
    pub stats: QueueStats,
}

/// Status plus the job lists, for inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub settings: JobQueueSettings,
    pub status: QueueStatus,
    pub pending: Vec<Job>,
    pub running: Vec<Job>,
    pub completed: Vec<Job>,
    pub failed: Vec<Job>,
}

/// What `fail` decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Re-admit after `delay`.
    Retrying { attempt: u32, delay: Duration },
    /// Permanently failed and moved to history.
    Failed,
    /// The job was no longer running (cleared or unknown id).
    Ignored,
}

const SNAPSHOT_TAIL: usize = 10;

/// A single category queue.
pub struct JobQueue {
    name: String,
    settings: JobQueueSettings,
    /// Live jobs: pending, retrying, or running.
    jobs: HashMap<String, Job>,
    /// Ids of pending jobs, sorted by descending priority.
    pending: Vec<String>,
    running: HashSet<String>,
    completed: VecDeque<Job>,
    failed: VecDeque<Job>,
    stats: QueueStats,
}

impl JobQueue {
    pub fn new(name: impl Into<String>, settings: JobQueueSettings) -> Self {
        Self {
            name: name.into(),
            settings,
            jobs: HashMap::new(),
            pending: Vec::new(),
            running: HashSet::new(),
            completed: VecDeque::new(),
            failed: VecDeque::new(),
            stats: QueueStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &JobQueueSettings {
        &self.settings
    }

    /// Admit a new job. Fails with `QueueFull` without touching any state.
    pub fn add(
        &mut self,
        job_type: JobType,
        data: serde_json::Value,
        options: &JobOptions,
    ) -> Result<Job> {
        if self.pending.len() >= self.settings.max_queue_size {
            return Err(KindredError::QueueFull {
                queue: self.name.clone(),
                capacity: self.settings.max_queue_size,
            });
        }

        let job = Job::new(job_type, data).with_options(
            options,
            self.settings.default_max_retries,
            self.settings.default_timeout_ms,
        );
        self.pending.push(job.id.clone());
        self.jobs.insert(job.id.clone(), job.clone());
        self.sort_pending();
        self.stats.total_jobs += 1;

        tracing::debug!(
            "📥 Queue[{}] add: {} {} (priority {}, pending {}, running {})",
            self.name,
            job.job_type,
            job.id,
            job.priority,
            self.pending.len(),
            self.running.len()
        );
        Ok(job)
    }

    /// Pop the highest-priority pending job, if a concurrency slot is free.
    ///
    /// A steady stream of high-priority work can starve low priorities; categories are
    /// narrow and volumes low, so no ageing is applied.
    pub fn get_next(&mut self) -> Option<Job> {
        if self.pending.is_empty() || self.running.len() >= self.settings.max_concurrent {
            return None;
        }
        let id = self.pending.remove(0);
        self.jobs.get(&id).cloned()
    }

    /// Put a job taken by `get_next` back at the head of the pending list.
    pub fn requeue_front(&mut self, job_id: &str) {
        if self.jobs.contains_key(job_id) && !self.pending.iter().any(|id| id == job_id) {
            self.pending.insert(0, job_id.to_string());
        }
    }

    /// Mark a job running. Returns the updated job.
    pub fn start(&mut self, job_id: &str) -> Option<Job> {
        let job = self.jobs.get_mut(job_id)?;
        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now());
        self.running.insert(job_id.to_string());
        Some(job.clone())
    }

    /// Record a successful run and move the job to history.
    pub fn complete(&mut self, job_id: &str, result: serde_json::Value) -> Option<Job> {
        if !self.running.remove(job_id) {
            return None;
        }
        let mut job = self.jobs.remove(job_id)?;
        job.status = JobStatus::Completed;
        job.completed_at = Some(Utc::now());
        job.result = Some(result);

        self.stats.completed_jobs += 1;
        if let Some(ms) = job.processing_ms() {
            let n = self.stats.completed_jobs as f64;
            self.stats.avg_processing_time =
                (self.stats.avg_processing_time * (n - 1.0) + ms as f64) / n;
        }
        push_bounded(&mut self.completed, job.clone(), self.settings.history_size);
        Some(job)
    }

    /// Record a failed run. Retries (with a fixed delay) while attempts remain;
    /// the caller re-admits with [`JobQueue::readmit`] once the delay has passed.
    pub fn fail(&mut self, job_id: &str, error: &str) -> FailOutcome {
        let retry_allowed = match self.jobs.get(job_id) {
            Some(job) => self.settings.enable_retry && job.retries < job.max_retries,
            None => return FailOutcome::Ignored,
        };
        if !retry_allowed {
            return self.fail_permanently(job_id, error);
        }
        if !self.running.remove(job_id) {
            return FailOutcome::Ignored;
        }
        let Some(job) = self.jobs.get_mut(job_id) else {
            return FailOutcome::Ignored;
        };
        job.error = Some(error.to_string());
        job.status = JobStatus::Retrying;
        job.retries += 1;
        FailOutcome::Retrying {
            attempt: job.retries,
            delay: Duration::from_millis(self.settings.retry_delay_ms),
        }
    }

    /// Fail without consulting the retry policy.
    pub fn fail_permanently(&mut self, job_id: &str, error: &str) -> FailOutcome {
        self.running.remove(job_id);
        self.pending.retain(|id| id != job_id);
        let Some(mut job) = self.jobs.remove(job_id) else {
            return FailOutcome::Ignored;
        };
        job.error = Some(error.to_string());
        job.status = JobStatus::Failed;
        job.completed_at = Some(Utc::now());
        self.stats.failed_jobs += 1;
        push_bounded(&mut self.failed, job, self.settings.history_size);
        FailOutcome::Failed
    }

    /// Return a retrying job to the pending list. No-op for anything else.
    pub fn readmit(&mut self, job_id: &str) -> bool {
        match self.jobs.get_mut(job_id) {
            Some(job) if job.status == JobStatus::Retrying => {
                job.status = JobStatus::Pending;
            }
            _ => return false,
        }
        self.pending.push(job_id.to_string());
        self.sort_pending();
        true
    }

    /// Look a job up in any state.
    pub fn get(&self, job_id: &str) -> Option<Job> {
        self.jobs
            .get(job_id)
            .or_else(|| self.completed.iter().find(|j| j.id == job_id))
            .or_else(|| self.failed.iter().find(|j| j.id == job_id))
            .cloned()
    }

    /// Remove a job that has not started yet. Running and finished jobs cannot be cancelled.
    pub fn cancel(&mut self, job_id: &str) -> bool {
        match self.jobs.get(job_id) {
            Some(job) if job.status == JobStatus::Pending => {}
            _ => return false,
        }
        let Some(index) = self.pending.iter().position(|id| id == job_id) else {
            return false;
        };
        self.pending.remove(index);
        self.jobs.remove(job_id);
        tracing::debug!("🗑️ Queue[{}] cancelled {}", self.name, job_id);
        true
    }

    /// Drop all pending work. In-flight jobs and history are kept.
    pub fn clear(&mut self) -> usize {
        let dropped = std::mem::take(&mut self.pending);
        for id in &dropped {
            self.jobs.remove(id);
        }
        dropped.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn running_len(&self) -> usize {
        self.running.len()
    }

    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            name: self.name.clone(),
            pending: self.pending.len(),
            running: self.running.len(),
            completed: self.completed.len(),
            failed: self.failed.len(),
            max_concurrent: self.settings.max_concurrent,
            stats: self.stats.clone(),
        }
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            settings: self.settings.clone(),
            status: self.status(),
            pending: self.lookup(self.pending.iter()),
            running: self.lookup(self.running.iter()),
            completed: tail(&self.completed, SNAPSHOT_TAIL),
            failed: tail(&self.failed, SNAPSHOT_TAIL),
        }
    }

    fn lookup<'a>(&self, ids: impl Iterator<Item = &'a String>) -> Vec<Job> {
        ids.filter_map(|id| self.jobs.get(id).cloned()).collect()
    }

    fn sort_pending(&mut self) {
        let jobs = &self.jobs;
        // Stable: equal priorities keep admission order.
        self.pending.sort_by_key(|id| {
            std::cmp::Reverse(jobs.get(id).map_or(i32::MIN, |j| j.priority))
        });
    }
}

fn push_bounded(buffer: &mut VecDeque<Job>, job: Job, limit: usize) {
    buffer.push_back(job);
    while buffer.len() > limit {
        buffer.pop_front();
    }
}

fn tail(buffer: &VecDeque<Job>, n: usize) -> Vec<Job> {
    buffer.iter().skip(buffer.len().saturating_sub(n)).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queue(max_concurrent: usize) -> JobQueue {
        JobQueue::new(
            "test",
            JobQueueSettings {
                max_concurrent,
                ..Default::default()
            },
        )
    }

    fn add(q: &mut JobQueue, priority: i32) -> Job {
        q.add(
            JobType::Summarize,
            json!({"n": priority}),
            &JobOptions::default().priority(priority),
        )
        .unwrap()
    }

    #[test]
    fn test_priority_order_with_single_slot() {
        let mut q = queue(1);
        for p in [1, 9, 3, 9, 2] {
            add(&mut q, p);
        }

        let mut served = Vec::new();
        while let Some(job) = q.get_next() {
            q.start(&job.id);
            assert!(q.running_len() <= 1);
            // Slot is taken until completion.
            assert!(q.get_next().is_none());
            q.complete(&job.id, json!(null));
            served.push(job.priority);
        }
        assert_eq!(served, vec![9, 9, 3, 2, 1]);
    }

    #[test]
    fn test_equal_priorities_keep_admission_order() {
        let mut q = queue(5);
        let a = add(&mut q, 5);
        let b = add(&mut q, 5);
        let c = add(&mut q, 7);
        assert_eq!(q.get_next().unwrap().id, c.id);
        assert_eq!(q.get_next().unwrap().id, a.id);
        assert_eq!(q.get_next().unwrap().id, b.id);
    }

    #[test]
    fn test_queue_full_leaves_state_untouched() {
        let mut q = JobQueue::new(
            "tiny",
            JobQueueSettings {
                max_queue_size: 2,
                ..Default::default()
            },
        );
        add(&mut q, 1);
        add(&mut q, 2);
        let before = q.status();

        let err = q
            .add(JobType::Summarize, json!({}), &JobOptions::default())
            .unwrap_err();
        assert!(matches!(err, KindredError::QueueFull { capacity: 2, .. }));

        let after = q.status();
        assert_eq!(after.pending, before.pending);
        assert_eq!(after.stats.total_jobs, before.stats.total_jobs);
    }

    #[test]
    fn test_concurrency_bound() {
        let mut q = queue(2);
        for p in 0..5 {
            add(&mut q, p);
        }
        let a = q.get_next().unwrap();
        q.start(&a.id);
        let b = q.get_next().unwrap();
        q.start(&b.id);
        assert!(q.get_next().is_none());
        assert_eq!(q.running_len(), 2);

        q.complete(&a.id, json!("ok"));
        assert!(q.get_next().is_some());
    }

    #[test]
    fn test_retry_until_exhausted() {
        let mut q = queue(1);
        let job = q
            .add(
                JobType::Cleanup,
                json!({}),
                &JobOptions::default().max_retries(2),
            )
            .unwrap();

        let mut attempts = Vec::new();
        loop {
            let next = q.get_next().unwrap();
            q.start(&next.id);
            match q.fail(&next.id, "boom") {
                FailOutcome::Retrying { attempt, delay } => {
                    assert_eq!(delay, Duration::from_millis(5000));
                    assert_eq!(q.get(&job.id).unwrap().status, JobStatus::Retrying);
                    assert_eq!(q.pending_len(), 0);
                    attempts.push(attempt);
                    assert!(q.readmit(&job.id));
                }
                FailOutcome::Failed => break,
                FailOutcome::Ignored => panic!("job vanished"),
            }
        }

        assert_eq!(attempts, vec![1, 2]);
        let failed = q.get(&job.id).unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.retries, 2);
        assert_eq!(failed.error.as_deref(), Some("boom"));
        assert!(!q.readmit(&job.id));
        assert_eq!(q.pending_len(), 0);
        assert_eq!(q.status().stats.failed_jobs, 1);
    }

    #[test]
    fn test_retry_disabled_fails_at_once() {
        let mut q = JobQueue::new(
            "noretry",
            JobQueueSettings {
                enable_retry: false,
                ..Default::default()
            },
        );
        let job = add(&mut q, 5);
        q.get_next();
        q.start(&job.id);
        assert_eq!(q.fail(&job.id, "nope"), FailOutcome::Failed);
        assert_eq!(q.running_len(), 0);
    }

    #[test]
    fn test_cancel_only_pending() {
        let mut q = queue(3);
        let pending = add(&mut q, 1);
        let running = add(&mut q, 9);

        let next = q.get_next().unwrap();
        assert_eq!(next.id, running.id);
        q.start(&running.id);

        assert!(!q.cancel(&running.id));
        assert!(q.cancel(&pending.id));
        assert!(!q.cancel(&pending.id));
        assert!(q.get(&pending.id).is_none());

        q.complete(&running.id, json!(1));
        assert!(!q.cancel(&running.id));
        assert_eq!(q.get(&running.id).unwrap().status, JobStatus::Completed);
    }

    #[test]
    fn test_requeue_front_keeps_job_first() {
        let mut q = queue(3);
        let high = add(&mut q, 9);
        add(&mut q, 1);
        let taken = q.get_next().unwrap();
        q.requeue_front(&taken.id);
        assert_eq!(q.pending_len(), 2);
        assert_eq!(q.get_next().unwrap().id, high.id);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut q = JobQueue::new(
            "bounded",
            JobQueueSettings {
                history_size: 3,
                max_concurrent: 10,
                ..Default::default()
            },
        );
        let mut ids = Vec::new();
        for p in 0..5 {
            let job = add(&mut q, p);
            ids.push(job.id.clone());
        }
        while let Some(job) = q.get_next() {
            q.start(&job.id);
            q.complete(&job.id, json!(null));
        }
        let status = q.status();
        assert_eq!(status.completed, 3);
        assert_eq!(status.stats.completed_jobs, 5);
        // Lowest priorities finished last and are the ones retained.
        assert!(q.get(&ids[0]).is_some());
        assert!(q.get(&ids[4]).is_none());
    }

    #[test]
    fn test_clear_and_snapshot() {
        let mut q = queue(1);
        let running = add(&mut q, 9);
        add(&mut q, 1);
        add(&mut q, 2);
        q.get_next();
        q.start(&running.id);

        let snap = q.snapshot();
        assert_eq!(snap.pending.len(), 2);
        assert_eq!(snap.running.len(), 1);

        assert_eq!(q.clear(), 2);
        assert_eq!(q.pending_len(), 0);
        assert_eq!(q.running_len(), 1);
        assert!(q.complete(&running.id, json!("done")).is_some());
    }
}

//! Job definitions: one deferred unit of background work and its lifecycle.

use chrono::{DateTime, Utc};
use kindred_core::error::{KindredError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::queue::QueueCategory;

/// Named priorities. Higher runs first; any `i32` is accepted.
pub struct JobPriority;

impl JobPriority {
    pub const LOW: i32 = 1;
    pub const NORMAL: i32 = 5;
    pub const HIGH: i32 = 8;
    pub const URGENT: i32 = 10;
}

/// Supported kinds of background work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Summarize,
    ExtractEntities,
    GenerateTags,
    AnalyzeSentiment,
    Vision,
    Tts,
    Stt,
    Archive,
    Cleanup,
}

impl JobType {
    pub const ALL: [JobType; 9] = [
        JobType::Summarize,
        JobType::ExtractEntities,
        JobType::GenerateTags,
        JobType::AnalyzeSentiment,
        JobType::Vision,
        JobType::Tts,
        JobType::Stt,
        JobType::Archive,
        JobType::Cleanup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Summarize => "summarize",
            JobType::ExtractEntities => "extract_entities",
            JobType::GenerateTags => "generate_tags",
            JobType::AnalyzeSentiment => "analyze_sentiment",
            JobType::Vision => "vision",
            JobType::Tts => "tts",
            JobType::Stt => "stt",
            JobType::Archive => "archive",
            JobType::Cleanup => "cleanup",
        }
    }

    /// Category queue this type is routed to.
    pub fn category(&self) -> QueueCategory {
        match self {
            JobType::Summarize | JobType::GenerateTags => QueueCategory::Summarization,
            JobType::ExtractEntities | JobType::AnalyzeSentiment => QueueCategory::Analysis,
            JobType::Vision | JobType::Tts | JobType::Stt => QueueCategory::Media,
            JobType::Archive | JobType::Cleanup => QueueCategory::Maintenance,
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = KindredError;

    fn from_str(s: &str) -> Result<Self> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| KindredError::InvalidType(s.to_string()))
    }
}

/// Lifecycle state.
///
/// `Pending → Running → Completed`, or `Running → Retrying → Pending → ...`
/// until retries run out, then `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Retrying,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Caller-supplied admission options. Unset fields take the queue defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobOptions {
    pub priority: Option<i32>,
    pub max_retries: Option<u32>,
    pub timeout_ms: Option<u64>,
}

impl JobOptions {
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// A queued unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub job_type: JobType,
    /// Opaque payload handed to the processor.
    pub data: serde_json::Value,
    pub priority: i32,
    pub status: JobStatus,
    pub retries: u32,
    pub max_retries: u32,
    pub timeout_ms: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
}

impl Job {
    pub fn new(job_type: JobType, data: serde_json::Value) -> Self {
        Self {
            id: format!("job_{}", uuid::Uuid::new_v4().simple()),
            job_type,
            data,
            priority: JobPriority::NORMAL,
            status: JobStatus::Pending,
            retries: 0,
            max_retries: 3,
            timeout_ms: 60_000,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            result: None,
        }
    }

    /// Apply caller options on top of the given defaults.
    pub fn with_options(mut self, options: &JobOptions, max_retries: u32, timeout_ms: u64) -> Self {
        self.priority = options.priority.unwrap_or(JobPriority::NORMAL);
        self.max_retries = options.max_retries.unwrap_or(max_retries);
        self.timeout_ms = options.timeout_ms.unwrap_or(timeout_ms);
        self
    }

    /// Wall time between start and completion, in milliseconds.
    pub fn processing_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

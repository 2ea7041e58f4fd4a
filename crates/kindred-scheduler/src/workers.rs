//! Built-in job processors.
//!
//! These are lightweight local strategies; a host that has real model clients
//! registers its own [`JobProcessor`] for the same type and replaces them.
//! Vision, TTS and STT have no built-in processor.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use kindred_core::error::{KindredError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::job::{Job, JobType};
use crate::worker::JobProcessor;

/// Every built-in processor, ready for `WorkerManager::register`.
pub fn builtin_processors() -> Vec<Arc<dyn JobProcessor>> {
    vec![
        Arc::new(SummarizationWorker),
        Arc::new(EntityExtractionWorker),
        Arc::new(TagGenerationWorker),
        Arc::new(SentimentAnalysisWorker),
        Arc::new(ArchiveWorker),
        Arc::new(CleanupWorker),
    ]
}

fn text_field<'a>(data: &'a Value, field: &str) -> Option<&'a str> {
    data.get(field).and_then(Value::as_str).filter(|s| !s.is_empty())
}

// ── Summarize ──────────────────────────────────────────────

pub struct SummarizationWorker;

impl SummarizationWorker {
    /// First `max_length / 5` words; the whole text when it is already short.
    fn summarize(contents: &[&str], max_length: usize) -> String {
        let combined = contents.join(" ");
        let words: Vec<&str> = combined.split_whitespace().collect();
        let keep = max_length / 5;
        if words.len() <= keep {
            return combined;
        }
        format!("{}...", words[..keep].join(" "))
    }
}

#[async_trait]
impl JobProcessor for SummarizationWorker {
    fn name(&self) -> &str {
        "summarization"
    }

    fn job_type(&self) -> JobType {
        JobType::Summarize
    }

    async fn process(&self, job: &Job) -> Result<Value> {
        let messages = job
            .data
            .get("messages")
            .and_then(Value::as_array)
            .filter(|m| !m.is_empty())
            .ok_or_else(|| KindredError::JobFailed("No messages to summarize".into()))?;
        let max_length = job
            .data
            .get("maxLength")
            .and_then(Value::as_u64)
            .unwrap_or(200) as usize;

        let contents: Vec<&str> = messages
            .iter()
            .filter_map(|m| m.get("content").and_then(Value::as_str))
            .collect();

        Ok(json!({
            "summary": Self::summarize(&contents, max_length),
            "messageCount": messages.len(),
        }))
    }
}

// ── Entity extraction ─────────────────────────────────────

static PERSON_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b([A-Z][a-z]+ [A-Z][a-z]+)\b").expect("valid person regex"));
static TECH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(React|Vue|Angular|Node\.js|Python|Java|TypeScript|JavaScript|MongoDB|PostgreSQL|Redis|Docker|Kubernetes|Rust)\b",
    )
    .expect("valid technology regex")
});
static FILE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b([a-z0-9_-]+\.(?:js|ts|py|java|rs|md|json|yaml|yml|toml))\b")
        .expect("valid file regex")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Person,
    Technology,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntityKind,
    pub mentions: u32,
}

pub struct EntityExtractionWorker;

impl EntityExtractionWorker {
    /// Pattern-based extraction, in first-seen order, with mention counts.
    pub fn extract(text: &str) -> Vec<Entity> {
        let mut entities: Vec<Entity> = Vec::new();
        let passes: [(&Regex, EntityKind); 3] = [
            (&*PERSON_RE, EntityKind::Person),
            (&*TECH_RE, EntityKind::Technology),
            (&*FILE_RE, EntityKind::File),
        ];
        for (re, kind) in passes {
            for caps in re.captures_iter(text) {
                let name = &caps[1];
                match entities.iter_mut().find(|e| e.name == name) {
                    Some(existing) => existing.mentions += 1,
                    None => entities.push(Entity {
                        name: name.to_string(),
                        kind: kind.clone(),
                        mentions: 1,
                    }),
                }
            }
        }
        entities
    }
}

#[async_trait]
impl JobProcessor for EntityExtractionWorker {
    fn name(&self) -> &str {
        "entity-extraction"
    }

    fn job_type(&self) -> JobType {
        JobType::ExtractEntities
    }

    async fn process(&self, job: &Job) -> Result<Value> {
        let text = text_field(&job.data, "text")
            .ok_or_else(|| KindredError::JobFailed("No text to extract entities from".into()))?;
        let entities = Self::extract(text);
        Ok(json!({
            "count": entities.len(),
            "entities": entities,
        }))
    }
}

// ── Tags ───────────────────────────────────────────────────

pub struct TagGenerationWorker;

impl TagGenerationWorker {
    /// Most frequent lower-cased words longer than three characters.
    /// Ties keep first-seen order.
    pub fn tags(text: &str, max_tags: usize) -> Vec<String> {
        let lower = text.to_lowercase();
        let mut freq: Vec<(&str, usize)> = Vec::new();
        for word in lower
            .split(|c: char| !(c.is_alphanumeric() || c == '_'))
            .filter(|w| w.chars().count() > 3)
        {
            match freq.iter_mut().find(|(w, _)| *w == word) {
                Some((_, count)) => *count += 1,
                None => freq.push((word, 1)),
            }
        }
        freq.sort_by(|a, b| b.1.cmp(&a.1));
        freq.into_iter()
            .take(max_tags)
            .map(|(w, _)| w.to_string())
            .collect()
    }
}

#[async_trait]
impl JobProcessor for TagGenerationWorker {
    fn name(&self) -> &str {
        "tag-generation"
    }

    fn job_type(&self) -> JobType {
        JobType::GenerateTags
    }

    async fn process(&self, job: &Job) -> Result<Value> {
        let text = text_field(&job.data, "text")
            .ok_or_else(|| KindredError::JobFailed("No text to tag".into()))?;
        let max_tags = job
            .data
            .get("maxTags")
            .and_then(Value::as_u64)
            .unwrap_or(5) as usize;
        let tags = Self::tags(text, max_tags);
        Ok(json!({ "tags": tags, "count": tags.len() }))
    }
}

// ── Sentiment ──────────────────────────────────────────────

const POSITIVE_WORDS: &[&str] = &[
    "good", "great", "excellent", "perfect", "success", "awesome", "thanks", "love",
];
const NEGATIVE_WORDS: &[&str] = &[
    "bad", "error", "fail", "problem", "sorry", "wrong", "terrible", "hate",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sentiment {
    /// positive, negative or neutral.
    pub sentiment: String,
    pub score: f64,
    pub confidence: f64,
    #[serde(rename = "positiveCount")]
    pub positive_count: usize,
    #[serde(rename = "negativeCount")]
    pub negative_count: usize,
}

pub struct SentimentAnalysisWorker;

impl SentimentAnalysisWorker {
    pub fn analyze(text: &str) -> Sentiment {
        let lower = text.to_lowercase();
        let hits = |words: &[&str]| words.iter().filter(|w| lower.contains(*w)).count();
        let positive_count = hits(POSITIVE_WORDS);
        let negative_count = hits(NEGATIVE_WORDS);
        let total = positive_count + negative_count;

        if total == 0 {
            return Sentiment {
                sentiment: "neutral".into(),
                score: 0.0,
                confidence: 0.5,
                positive_count,
                negative_count,
            };
        }

        let score = (positive_count as f64 - negative_count as f64) / total as f64;
        let sentiment = if score > 0.2 {
            "positive"
        } else if score < -0.2 {
            "negative"
        } else {
            "neutral"
        };
        Sentiment {
            sentiment: sentiment.into(),
            score,
            confidence: score.abs(),
            positive_count,
            negative_count,
        }
    }
}

#[async_trait]
impl JobProcessor for SentimentAnalysisWorker {
    fn name(&self) -> &str {
        "sentiment-analysis"
    }

    fn job_type(&self) -> JobType {
        JobType::AnalyzeSentiment
    }

    async fn process(&self, job: &Job) -> Result<Value> {
        let text = text_field(&job.data, "text")
            .ok_or_else(|| KindredError::JobFailed("No text to analyze".into()))?;
        Ok(serde_json::to_value(Self::analyze(text))?)
    }
}

// ── Maintenance ────────────────────────────────────────────

pub struct ArchiveWorker;

#[async_trait]
impl JobProcessor for ArchiveWorker {
    fn name(&self) -> &str {
        "archive"
    }

    fn job_type(&self) -> JobType {
        JobType::Archive
    }

    async fn process(&self, job: &Job) -> Result<Value> {
        let session_id = text_field(&job.data, "sessionId")
            .ok_or_else(|| KindredError::JobFailed("No sessionId provided".into()))?;
        tracing::debug!("📦 Archiving session {session_id}");
        Ok(json!({
            "sessionId": session_id,
            "archived": true,
            "timestamp": Utc::now().to_rfc3339(),
        }))
    }
}

pub struct CleanupWorker;

#[async_trait]
impl JobProcessor for CleanupWorker {
    fn name(&self) -> &str {
        "cleanup"
    }

    fn job_type(&self) -> JobType {
        JobType::Cleanup
    }

    async fn process(&self, job: &Job) -> Result<Value> {
        let kind = job.data.get("type").and_then(Value::as_str).unwrap_or("");
        let max_age = |default: u64| {
            job.data
                .pointer("/options/maxAge")
                .and_then(Value::as_u64)
                .unwrap_or(default)
        };
        // maxAge is in days.
        let max_age = match kind {
            "expired_sessions" => max_age(30),
            "old_logs" => max_age(7),
            other => {
                return Err(KindredError::JobFailed(format!("Unknown cleanup type: {other}")));
            }
        };
        Ok(json!({ "type": kind, "cleaned": 0, "maxAge": max_age }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(job_type: JobType, data: Value) -> Job {
        Job::new(job_type, data)
    }

    #[tokio::test]
    async fn test_summarize_truncates() {
        let words: Vec<String> = (0..50).map(|i| format!("w{i}")).collect();
        let data = json!({
            "messages": [{"content": words[..25].join(" ")}, {"content": words[25..].join(" ")}],
            "maxLength": 50
        });
        let out = SummarizationWorker
            .process(&job(JobType::Summarize, data))
            .await
            .unwrap();
        assert_eq!(out["summary"], "w0 w1 w2 w3 w4 w5 w6 w7 w8 w9...");
        assert_eq!(out["messageCount"], 2);
    }

    #[tokio::test]
    async fn test_summarize_short_text_kept() {
        let data = json!({"messages": [{"content": "hello there"}]});
        let out = SummarizationWorker
            .process(&job(JobType::Summarize, data))
            .await
            .unwrap();
        assert_eq!(out["summary"], "hello there");
    }

    #[tokio::test]
    async fn test_summarize_requires_messages() {
        let err = SummarizationWorker
            .process(&job(JobType::Summarize, json!({"messages": []})))
            .await
            .unwrap_err();
        assert!(matches!(err, KindredError::JobFailed(_)));
    }

    #[test]
    fn test_extract_entities() {
        let entities = EntityExtractionWorker::extract(
            "Jane Doe moved main.rs to Docker. jane said docker and Jane Doe agreed; see notes.md",
        );
        let find = |name: &str| entities.iter().find(|e| e.name == name).unwrap();
        assert_eq!(find("Jane Doe").mentions, 2);
        assert_eq!(find("Jane Doe").kind, EntityKind::Person);
        assert_eq!(find("Docker").kind, EntityKind::Technology);
        assert_eq!(find("main.rs").kind, EntityKind::File);
        assert_eq!(find("notes.md").kind, EntityKind::File);
    }

    #[test]
    fn test_tags_by_frequency() {
        let tags = TagGenerationWorker::tags(
            "Rust rust RUST tokio tokio sqlite a an the queue",
            3,
        );
        assert_eq!(tags, vec!["rust", "tokio", "sqlite"]);
    }

    #[test]
    fn test_sentiment_labels() {
        assert_eq!(
            SentimentAnalysisWorker::analyze("great job, thanks!").sentiment,
            "positive"
        );
        let negative = SentimentAnalysisWorker::analyze("terrible error, sorry");
        assert_eq!(negative.sentiment, "negative");
        assert_eq!(negative.score, -1.0);
        assert_eq!(negative.confidence, 1.0);

        let neutral = SentimentAnalysisWorker::analyze("the sky is blue");
        assert_eq!(neutral.sentiment, "neutral");
        assert_eq!(neutral.confidence, 0.5);
    }

    #[tokio::test]
    async fn test_cleanup_types() {
        let out = CleanupWorker
            .process(&job(
                JobType::Cleanup,
                json!({"type": "old_logs", "options": {"maxAge": 3}}),
            ))
            .await
            .unwrap();
        assert_eq!(out["maxAge"], 3);

        let out = CleanupWorker
            .process(&job(JobType::Cleanup, json!({"type": "expired_sessions"})))
            .await
            .unwrap();
        assert_eq!(out["maxAge"], 30);

        assert!(
            CleanupWorker
                .process(&job(JobType::Cleanup, json!({"type": "disk"})))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_archive_requires_session() {
        assert!(
            ArchiveWorker
                .process(&job(JobType::Archive, json!({})))
                .await
                .is_err()
        );
        let out = ArchiveWorker
            .process(&job(JobType::Archive, json!({"sessionId": "s1"})))
            .await
            .unwrap();
        assert_eq!(out["archived"], true);
    }

    #[test]
    fn test_builtin_set_has_no_media() {
        let types: Vec<JobType> = builtin_processors().iter().map(|p| p.job_type()).collect();
        assert_eq!(types.len(), 6);
        assert!(!types.contains(&JobType::Vision));
        assert!(!types.contains(&JobType::Tts));
        assert!(!types.contains(&JobType::Stt));
    }
}

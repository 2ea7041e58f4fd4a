//! Kindred configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{KindredError, Result};
use crate::types::{QuietHours, TriggerCondition, TriggerSpec};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KindredConfig {
    #[serde(default)]
    pub queues: QueueConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub proactive: ProactiveConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

impl KindredConfig {
    /// Load config from the default path (~/.kindred/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| KindredError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| KindredError::Config(format!("Failed to parse config: {e}")))?;
        tracing::debug!("📄 Loaded config from {}", path.display());
        Ok(config)
    }

    /// Save config to the given path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| KindredError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Kindred home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".kindred")
    }
}

/// Category queue limits and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "bool_true")]
    pub enable_retry: bool,
    #[serde(default)]
    pub max_concurrent: ConcurrencyLimits,
}

fn bool_true() -> bool { true }
fn default_max_queue_size() -> usize { 1000 }
fn default_history_size() -> usize { 100 }
fn default_retry_delay_ms() -> u64 { 5000 }

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            history_size: default_history_size(),
            retry_delay_ms: default_retry_delay_ms(),
            enable_retry: true,
            max_concurrent: ConcurrencyLimits::default(),
        }
    }
}

/// Per-category concurrency budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyLimits {
    #[serde(default = "default_general_limit")]
    pub default: usize,
    #[serde(default = "default_light_limit")]
    pub summarization: usize,
    #[serde(default = "default_light_limit")]
    pub analysis: usize,
    #[serde(default = "default_heavy_limit")]
    pub media: usize,
    #[serde(default = "default_heavy_limit")]
    pub maintenance: usize,
}

fn default_general_limit() -> usize { 3 }
fn default_light_limit() -> usize { 2 }
fn default_heavy_limit() -> usize { 1 }

impl Default for ConcurrencyLimits {
    fn default() -> Self {
        Self {
            default: default_general_limit(),
            summarization: default_light_limit(),
            analysis: default_light_limit(),
            media: default_heavy_limit(),
            maintenance: default_heavy_limit(),
        }
    }
}

/// Worker pool defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
}

fn default_poll_interval_ms() -> u64 { 1000 }
fn default_timeout_ms() -> u64 { 60_000 }
fn default_max_retries() -> u32 { 3 }

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            default_timeout_ms: default_timeout_ms(),
            default_max_retries: default_max_retries(),
        }
    }
}

/// Persisted schedule storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// How often a running daemon picks up schedule rows changed by other processes.
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,
}

fn default_db_path() -> String { "~/.kindred/scheduler.db".into() }
fn default_sync_interval() -> u64 { 30 }

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            sync_interval_secs: default_sync_interval(),
        }
    }
}

/// Proactive check-in loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProactiveConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_proactive_interval")]
    pub interval_secs: u64,
    /// Ceiling on proactive deliveries (any rule) in a trailing 24 hours.
    #[serde(default = "default_daily_cap")]
    pub daily_cap: u32,
    /// Offset of the user's wall clock from UTC, used for quiet hours.
    #[serde(default)]
    pub utc_offset_minutes: i32,
    #[serde(default)]
    pub quiet_hours: Option<QuietHours>,
    /// How many history entries to keep for rate-limit arithmetic.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Empty means the built-in rule set.
    #[serde(default)]
    pub conditions: Vec<TriggerCondition>,
}

fn default_proactive_interval() -> u64 { 300 }
fn default_daily_cap() -> u32 { 3 }
fn default_history_limit() -> usize { 500 }

impl Default for ProactiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_proactive_interval(),
            daily_cap: default_daily_cap(),
            utc_offset_minutes: 0,
            quiet_hours: None,
            history_limit: default_history_limit(),
            conditions: Vec::new(),
        }
    }
}

impl ProactiveConfig {
    /// Configured rules, or the built-in set when none are configured.
    pub fn effective_conditions(&self) -> Vec<TriggerCondition> {
        if self.conditions.is_empty() {
            builtin_conditions()
        } else {
            self.conditions.clone()
        }
    }
}

/// Built-in proactive rules.
pub fn builtin_conditions() -> Vec<TriggerCondition> {
    vec![
        TriggerCondition {
            id: "long_silence".into(),
            enabled: true,
            trigger: TriggerSpec::Silence { min_hours: 24.0 },
            messages: vec![
                "It's been a while. How have you been?".into(),
                "Haven't heard from you in a day or so. Everything okay?".into(),
                "Just checking in. What have you been up to?".into(),
            ],
            cooldown_hours: 72.0,
            max_per_week: 2,
        },
        TriggerCondition {
            id: "good_morning".into(),
            enabled: true,
            trigger: TriggerSpec::AfterEvent {
                event: "sleep".into(),
                min_minutes: 7 * 60,
            },
            messages: vec![
                "Good morning! Did you sleep well?".into(),
                "Morning! Ready for today?".into(),
            ],
            cooldown_hours: 20.0,
            max_per_week: 7,
        },
        TriggerCondition {
            id: "event_overdue".into(),
            enabled: true,
            trigger: TriggerSpec::EventOverdue { grace_minutes: 60 },
            messages: vec![
                "That took longer than expected. All good?".into(),
                "Still busy? Take your time.".into(),
            ],
            cooldown_hours: 12.0,
            max_per_week: 3,
        },
    ]
}

/// Where outbound messages go.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// POST JSON here; unset means log-only delivery.
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

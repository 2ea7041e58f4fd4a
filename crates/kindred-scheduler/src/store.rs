//! Storage contracts the scheduler depends on.
//!
//! The scheduled-message timer and the proactive gate only need these two narrow
//! traits; `SchedulerDb` is the SQLite implementation.

use chrono::{DateTime, Utc};
use kindred_core::error::{KindredError, Result};
use serde::{Deserialize, Serialize};

/// Lifecycle of a persisted send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Pending,
    Sent,
    Cancelled,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleStatus::Pending => "pending",
            ScheduleStatus::Sent => "sent",
            ScheduleStatus::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for ScheduleStatus {
    type Err = KindredError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ScheduleStatus::Pending),
            "sent" => Ok(ScheduleStatus::Sent),
            "cancelled" => Ok(ScheduleStatus::Cancelled),
            other => Err(KindredError::Database(format!("unknown schedule status '{other}'"))),
        }
    }
}

/// A durable one-shot send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSchedule {
    pub id: i64,
    pub message: String,
    pub send_at: DateTime<Utc>,
    pub status: ScheduleStatus,
    pub created_at: DateTime<Utc>,
}

/// One proactive delivery, kept for rate limiting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryHistoryEntry {
    pub condition_id: String,
    pub message: String,
    pub sent_at: DateTime<Utc>,
}

/// Persistence for scheduled messages.
pub trait ScheduleStore: Send + Sync {
    /// Current maximum id + 1.
    fn next_schedule_id(&self) -> Result<i64>;

    fn insert_schedule(&self, schedule: &PersistedSchedule) -> Result<()>;

    fn get_schedule(&self, id: i64) -> Result<Option<PersistedSchedule>>;

    /// Every `pending` record, earliest `send_at` first.
    fn pending_schedules(&self) -> Result<Vec<PersistedSchedule>>;

    fn set_schedule_status(&self, id: i64, status: ScheduleStatus) -> Result<()>;

    /// Replace message and fire time of a record.
    fn reschedule(&self, id: i64, message: &str, send_at: DateTime<Utc>) -> Result<()>;

    /// Mark a record `sent` only if it is still pending and still due at `send_at`.
    /// Returns the claimed record, or `None` if it was cancelled, sent or moved.
    fn claim_schedule(&self, id: i64, send_at: DateTime<Utc>) -> Result<Option<PersistedSchedule>>;
}

/// Append-only log of proactive deliveries.
pub trait DeliveryLog: Send + Sync {
    fn append_delivery(&self, entry: &DeliveryHistoryEntry) -> Result<()>;

    /// Entries with `sent_at >= since`, oldest first.
    fn deliveries_since(&self, since: DateTime<Utc>) -> Result<Vec<DeliveryHistoryEntry>>;

    /// Keep only the newest `keep` entries. Returns how many were removed.
    fn prune_deliveries(&self, keep: usize) -> Result<usize>;
}

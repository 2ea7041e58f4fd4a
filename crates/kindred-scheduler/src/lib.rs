//! # Kindred Scheduler
//!
//! Background work for the companion: typed jobs on category queues, a polling
//! worker pool, durable one-shot reminders, and rate-limited proactive check-ins.
//!
//! ## Architecture
//! ```text
//! add_job(type, data) ─→ QueueManager ─→ JobQueue (per category, priority order)
//!                                            │  get_next (≤ max_concurrent running)
//! WorkerManager (tokio interval) ────────────┘
//!   └── Worker (single-flight, timeout race) ─→ complete | fail → retry after delay
//!
//! schedule(msg, delay) ─→ scheduled_messages row ─→ tokio timer ─→ DeliveryChannel
//!   (pending rows re-armed on start)
//!
//! ProactiveTriggerEvaluator (tokio interval)
//!   ├── ActivityTracker: silence, away events
//!   ├── AntiSpamGate: cooldown → weekly cap → daily cap
//!   └── DeliveryChannel + proactive_history
//! ```

pub mod delivery;
pub mod job;
pub mod manager;
pub mod persistence;
pub mod pool;
pub mod proactive;
pub mod queue;
pub mod runtime;
pub mod scheduled;
pub mod store;
pub mod worker;
pub mod workers;

pub use delivery::{DeliveryChannel, LogChannel, OutboundMessage, WebhookChannel};
pub use job::{Job, JobOptions, JobPriority, JobStatus, JobType};
pub use manager::{OverallStatus, QueueManager};
pub use persistence::SchedulerDb;
pub use pool::WorkerManager;
pub use proactive::{ActivityTracker, AntiSpamGate, EventKind, ProactiveTriggerEvaluator};
pub use queue::{JobQueue, QueueCategory, QueueStatus};
pub use runtime::SchedulerRuntime;
pub use scheduled::{ScheduleReceipt, ScheduleUpdate, ScheduledMessageScheduler};
pub use store::{DeliveryLog, PersistedSchedule, ScheduleStatus, ScheduleStore};
pub use worker::{JobProcessor, Worker};

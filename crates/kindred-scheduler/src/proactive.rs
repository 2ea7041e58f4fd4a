//! Proactive check-ins: rule evaluation behind an anti-spam gate.
//!
//! ## Tick
//! ```text
//! channel unreachable? ── skip
//! quiet hours?         ── skip
//! for each enabled rule (in order):
//!   predicate holds?  ── no → next
//!   gate open?        ── cooldown → weekly cap → daily cap
//!   fire: random message → deliver → append history → stop
//! ```
//! At most one message per tick. Sends are best-effort and never retried.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use kindred_core::config::ProactiveConfig;
use kindred_core::error::{KindredError, Result};
use kindred_core::types::{QuietHours, TriggerCondition, TriggerSpec};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::delivery::{DeliveryChannel, OutboundMessage};
use crate::store::{DeliveryHistoryEntry, DeliveryLog};

// ── Observed activity ──────────────────────────────────────

/// Kinds of "away" events a user can announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Shower,
    Sleep,
    Meal,
    Trip,
    Work,
    Errand,
    Exercise,
    Study,
}

/// Expected duration range of an event, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventDuration {
    pub min: i64,
    pub typical: i64,
    pub max: i64,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::Shower,
        EventKind::Sleep,
        EventKind::Meal,
        EventKind::Trip,
        EventKind::Work,
        EventKind::Errand,
        EventKind::Exercise,
        EventKind::Study,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Shower => "shower",
            EventKind::Sleep => "sleep",
            EventKind::Meal => "meal",
            EventKind::Trip => "trip",
            EventKind::Work => "work",
            EventKind::Errand => "errand",
            EventKind::Exercise => "exercise",
            EventKind::Study => "study",
        }
    }

    pub fn duration(&self) -> EventDuration {
        let (min, typical, max) = match self {
            EventKind::Shower => (600, 1800, 3600),
            EventKind::Sleep => (14_400, 28_800, 43_200),
            EventKind::Meal => (1200, 2700, 5400),
            EventKind::Trip => (86_400, 259_200, 604_800),
            EventKind::Work => (3600, 28_800, 43_200),
            EventKind::Errand => (1800, 5400, 14_400),
            EventKind::Exercise => (1800, 5400, 10_800),
            EventKind::Study => (3600, 10_800, 21_600),
        };
        EventDuration { min, typical, max }
    }
}

impl FromStr for EventKind {
    type Err = KindredError;

    fn from_str(s: &str) -> Result<Self> {
        EventKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| KindredError::InvalidType(format!("event '{s}'")))
    }
}

/// An announced absence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedEvent {
    pub kind: EventKind,
    pub started_at: DateTime<Utc>,
    pub expected_end: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActivitySnapshot {
    pub last_user_message: Option<DateTime<Utc>>,
    /// Cleared when the user talks again.
    pub current_event: Option<ObservedEvent>,
    /// Most recent event, kept after the user returns.
    pub last_event: Option<ObservedEvent>,
}

/// Shared record of what the user was last seen doing.
#[derive(Clone, Default)]
pub struct ActivityTracker {
    state: Arc<RwLock<ActivitySnapshot>>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_user_message(&self) {
        self.record_user_message_at(Utc::now()).await;
    }

    /// The user spoke: any current absence is over.
    pub async fn record_user_message_at(&self, at: DateTime<Utc>) {
        let mut state = self.state.write().await;
        state.last_user_message = Some(at);
        if state.current_event.take().is_some() {
            tracing::debug!("👋 User is back");
        }
    }

    pub async fn record_departure(&self, kind: EventKind) {
        self.record_departure_at(kind, Utc::now()).await;
    }

    /// The user announced an absence starting at `at`.
    pub async fn record_departure_at(&self, kind: EventKind, at: DateTime<Utc>) {
        let event = ObservedEvent {
            kind,
            started_at: at,
            expected_end: at + ChronoDuration::seconds(kind.duration().typical),
        };
        tracing::debug!("🚪 User away: {} (back ~{})", kind.as_str(), event.expected_end);
        let mut state = self.state.write().await;
        state.current_event = Some(event.clone());
        state.last_event = Some(event);
    }

    pub async fn snapshot(&self) -> ActivitySnapshot {
        self.state.read().await.clone()
    }
}

/// Longest span a rule may configure (100 years, in minutes). Larger values saturate.
const MAX_RULE_MINUTES: i64 = 100 * 365 * 24 * 60;

fn rule_minutes(minutes: i64) -> ChronoDuration {
    ChronoDuration::minutes(minutes.clamp(-MAX_RULE_MINUTES, MAX_RULE_MINUTES))
}

/// NaN counts as zero.
fn rule_hours(hours: f64) -> ChronoDuration {
    let minutes = (hours * 60.0).clamp(-(MAX_RULE_MINUTES as f64), MAX_RULE_MINUTES as f64);
    ChronoDuration::seconds((minutes * 60.0) as i64)
}

/// Whether `spec` holds for `activity` at `now`.
///
/// Silence needs at least one observed message. An after-event rule only holds while the
/// user has not spoken since the event began.
pub fn predicate_holds(spec: &TriggerSpec, activity: &ActivitySnapshot, now: DateTime<Utc>) -> bool {
    match spec {
        TriggerSpec::Silence { min_hours } => activity.last_user_message.is_some_and(|last| {
            (now - last).num_seconds() as f64 >= min_hours * 3600.0
        }),
        TriggerSpec::AfterEvent { event, min_minutes } => {
            let Some(last) = &activity.last_event else {
                return false;
            };
            let quiet_since = activity
                .last_user_message
                .is_none_or(|m| m <= last.started_at);
            last.kind.as_str() == event
                && quiet_since
                && now - last.started_at >= rule_minutes(*min_minutes)
        }
        TriggerSpec::EventOverdue { grace_minutes } => {
            activity.current_event.as_ref().is_some_and(|current| {
                now > current.expected_end + rule_minutes(*grace_minutes)
            })
        }
    }
}

// ── Anti-spam gate ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    Open,
    Cooldown,
    WeeklyCap,
    DailyCap,
}

/// Cooldown, weekly cap and daily cap over one delivery history.
#[derive(Debug, Clone)]
pub struct AntiSpamGate {
    pub daily_cap: u32,
}

impl AntiSpamGate {
    pub fn new(daily_cap: u32) -> Self {
        Self { daily_cap }
    }

    /// `history` must cover at least the trailing 7 days.
    pub fn check(
        &self,
        condition: &TriggerCondition,
        history: &[DeliveryHistoryEntry],
        now: DateTime<Utc>,
    ) -> GateDecision {
        let mine = move || history.iter().filter(move |e| e.condition_id == condition.id);

        let cooldown = rule_hours(condition.cooldown_hours);
        if mine().any(|e| now - e.sent_at < cooldown) {
            return GateDecision::Cooldown;
        }

        let week_start = now - ChronoDuration::days(7);
        if mine().filter(|e| e.sent_at > week_start).count() >= condition.max_per_week as usize {
            return GateDecision::WeeklyCap;
        }

        let day_start = now - ChronoDuration::hours(24);
        if history.iter().filter(|e| e.sent_at > day_start).count() >= self.daily_cap as usize {
            return GateDecision::DailyCap;
        }

        GateDecision::Open
    }
}

// ── Evaluator ──────────────────────────────────────────────

/// Result of one evaluation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum TickOutcome {
    Unreachable,
    QuietHours,
    /// No rule both held and passed the gate.
    Idle,
    Fired {
        condition_id: String,
        message: String,
        delivered: bool,
    },
}

pub struct ProactiveTriggerEvaluator {
    conditions: Vec<TriggerCondition>,
    quiet_hours: Option<QuietHours>,
    utc_offset: ChronoDuration,
    history_limit: usize,
    gate: AntiSpamGate,
    log: Arc<dyn DeliveryLog>,
    channel: Arc<dyn DeliveryChannel>,
    activity: ActivityTracker,
    handle: StdMutex<Option<JoinHandle<()>>>,
}

impl ProactiveTriggerEvaluator {
    pub fn new(
        config: &ProactiveConfig,
        log: Arc<dyn DeliveryLog>,
        channel: Arc<dyn DeliveryChannel>,
        activity: ActivityTracker,
    ) -> Self {
        Self {
            conditions: config.effective_conditions(),
            quiet_hours: config.quiet_hours,
            utc_offset: ChronoDuration::minutes(config.utc_offset_minutes as i64),
            history_limit: config.history_limit,
            gate: AntiSpamGate::new(config.daily_cap),
            log,
            channel,
            activity,
            handle: StdMutex::new(None),
        }
    }

    pub fn conditions(&self) -> &[TriggerCondition] {
        &self.conditions
    }

    pub fn activity(&self) -> &ActivityTracker {
        &self.activity
    }

    /// Whether `now` falls in quiet hours on the user's wall clock.
    pub fn in_quiet_hours(&self, now: DateTime<Utc>) -> bool {
        self.quiet_hours
            .is_some_and(|q| q.contains((now + self.utc_offset).time()))
    }

    pub async fn tick(&self) -> Result<TickOutcome> {
        self.tick_at(Utc::now()).await
    }

    /// One evaluation pass at `now`.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickOutcome> {
        if !self.channel.is_reachable() {
            tracing::debug!("💤 Proactive tick skipped: no reachable recipient");
            return Ok(TickOutcome::Unreachable);
        }
        if self.in_quiet_hours(now) {
            tracing::debug!("🌙 Proactive tick skipped: quiet hours");
            return Ok(TickOutcome::QuietHours);
        }

        let activity = self.activity.snapshot().await;
        let history = self.log.deliveries_since(now - ChronoDuration::days(7))?;

        for condition in self.conditions.iter().filter(|c| c.enabled) {
            if !predicate_holds(&condition.trigger, &activity, now) {
                continue;
            }
            let decision = self.gate.check(condition, &history, now);
            if decision != GateDecision::Open {
                tracing::debug!("🚧 Rule '{}' held but gate is {:?}", condition.id, decision);
                continue;
            }
            let Some(message) = condition.messages.choose(&mut rand::thread_rng()).cloned() else {
                tracing::warn!("⚠️ Rule '{}' has no messages", condition.id);
                continue;
            };
            return self.fire(condition, message, now).await;
        }
        Ok(TickOutcome::Idle)
    }

    async fn fire(
        &self,
        condition: &TriggerCondition,
        message: String,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome> {
        let delivered = match self
            .channel
            .deliver(&OutboundMessage::proactive(message.clone()))
            .await
        {
            Ok(()) => {
                tracing::info!("💬 Proactive '{}' sent: {}", condition.id, message);
                true
            }
            Err(e) => {
                tracing::warn!("⚠️ Proactive '{}' delivery failed (not retried): {e}", condition.id);
                false
            }
        };

        // Counted against the limits either way.
        self.log.append_delivery(&DeliveryHistoryEntry {
            condition_id: condition.id.clone(),
            message: message.clone(),
            sent_at: now,
        })?;
        let pruned = self.log.prune_deliveries(self.history_limit)?;
        if pruned > 0 {
            tracing::debug!("🧹 Pruned {pruned} proactive history entries");
        }

        Ok(TickOutcome::Fired {
            condition_id: condition.id.clone(),
            message,
            delivered,
        })
    }

    /// Spawn the periodic loop. A second call while running is a no-op.
    pub fn start(self: &Arc<Self>, interval_secs: u64) {
        let Ok(mut slot) = self.handle.lock() else {
            return;
        };
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            tracing::info!("💬 Proactive loop already running");
            return;
        }
        tracing::info!(
            "💬 Proactive loop started (every {interval_secs}s, {} rules)",
            self.conditions.len()
        );
        let evaluator = self.clone();
        *slot = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            loop {
                interval.tick().await;
                if let Err(e) = evaluator.tick().await {
                    tracing::warn!("⚠️ Proactive tick failed: {e}");
                }
            }
        }));
    }

    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().ok().and_then(|mut h| h.take()) {
            handle.abort();
            tracing::info!("💬 Proactive loop stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .map(|h| h.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }
}

impl Drop for ProactiveTriggerEvaluator {
    fn drop(&mut self) {
        self.stop();
    }
}

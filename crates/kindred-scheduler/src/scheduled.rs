//! Scheduled messages: durable one-shot sends.
//!
//! The stored record is the source of truth. Each pending record gets one tokio timer,
//! kept in an id → handle map; on start the map is rebuilt from storage so reminders
//! survive a restart. Changing a fire time is always clear-and-rearm. Rows edited by
//! another process are picked up by the periodic store sync, and a timer whose row
//! moved re-arms itself instead of sending early.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, SubsecRound, Utc};
use kindred_core::error::{KindredError, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::delivery::{DeliveryChannel, OutboundMessage};
use crate::store::{PersistedSchedule, ScheduleStatus, ScheduleStore};

/// Largest accepted delay, in either direction (100 years).
pub const MAX_DELAY_SECONDS: i64 = 100 * 365 * 24 * 60 * 60;

/// Returned by `schedule` and `update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleReceipt {
    pub id: i64,
    pub message: String,
    pub send_at: DateTime<Utc>,
}

/// Fields to change on a pending schedule. `None` keeps the current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleUpdate {
    pub message: Option<String>,
    /// New delay measured from now.
    pub delay_seconds: Option<i64>,
}

/// Fire time `delay_seconds` after `now`, at the store's millisecond precision.
fn send_time(now: DateTime<Utc>, delay_seconds: i64) -> Result<DateTime<Utc>> {
    let out_of_range = || {
        KindredError::InvalidArgument(format!(
            "delay of {delay_seconds}s is out of range (max ±{MAX_DELAY_SECONDS}s)"
        ))
    };
    if delay_seconds.unsigned_abs() > MAX_DELAY_SECONDS.unsigned_abs() {
        return Err(out_of_range());
    }
    ChronoDuration::try_seconds(delay_seconds)
        .and_then(|delay| now.checked_add_signed(delay))
        .map(|t| t.trunc_subsecs(3))
        .ok_or_else(out_of_range)
}

struct Timer {
    generation: u64,
    send_at: DateTime<Utc>,
    handle: JoinHandle<()>,
}

/// The timer map plus what a timer task needs to fire or re-arm itself.
#[derive(Clone)]
struct TimerSet {
    store: Arc<dyn ScheduleStore>,
    channel: Arc<dyn DeliveryChannel>,
    map: Arc<Mutex<HashMap<i64, Timer>>>,
    generation: Arc<AtomicU64>,
}

impl TimerSet {
    /// Caller holds the map lock.
    fn arm(&self, map: &mut HashMap<i64, Timer>, id: i64, send_at: DateTime<Utc>) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        // Already due (restart backlog, clock skew) fires immediately.
        let delay = (send_at - Utc::now()).to_std().unwrap_or_default();

        let timers = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fire(timers, id, generation, send_at).await;
        });

        if let Some(previous) = map.insert(
            id,
            Timer {
                generation,
                send_at,
                handle,
            },
        ) {
            previous.handle.abort();
        }
    }

    /// The row changed under a firing timer. Re-arm it if it is still pending
    /// and nothing else armed it meanwhile.
    async fn follow(&self, id: i64) {
        let record = match self.store.get_schedule(id) {
            Ok(Some(record)) if record.status == ScheduleStatus::Pending => record,
            Ok(_) => return,
            Err(e) => {
                tracing::warn!("⚠️ Scheduled message #{id} could not be read: {e}");
                return;
            }
        };
        let mut map = self.map.lock().await;
        if !map.contains_key(&id) {
            tracing::info!("⏰ Message #{id} moved to {}, re-arming", record.send_at);
            self.arm(&mut map, id, record.send_at);
        }
    }
}

pub struct ScheduledMessageScheduler {
    /// The map lock also serializes admission, so `next id` + insert cannot interleave.
    timers: TimerSet,
    /// Persist only; never arm timers.
    offline: bool,
    sync: StdMutex<Option<JoinHandle<()>>>,
}

impl ScheduledMessageScheduler {
    pub fn new(store: Arc<dyn ScheduleStore>, channel: Arc<dyn DeliveryChannel>) -> Self {
        Self::build(store, channel, false)
    }

    /// A scheduler that edits records without firing them, for management
    /// commands run beside (or instead of) the daemon.
    pub fn offline(store: Arc<dyn ScheduleStore>, channel: Arc<dyn DeliveryChannel>) -> Self {
        Self::build(store, channel, true)
    }

    fn build(store: Arc<dyn ScheduleStore>, channel: Arc<dyn DeliveryChannel>, offline: bool) -> Self {
        Self {
            timers: TimerSet {
                store,
                channel,
                map: Arc::new(Mutex::new(HashMap::new())),
                generation: Arc::new(AtomicU64::new(0)),
            },
            offline,
            sync: StdMutex::new(None),
        }
    }

    fn store(&self) -> &dyn ScheduleStore {
        self.timers.store.as_ref()
    }

    /// Persist a send `delay_seconds` from now and arm its timer.
    pub async fn schedule(&self, message: &str, delay_seconds: i64) -> Result<ScheduleReceipt> {
        let now = Utc::now();
        let send_at = send_time(now, delay_seconds)?;

        let mut timers = self.timers.map.lock().await;
        let record = PersistedSchedule {
            id: self.store().next_schedule_id()?,
            message: message.to_string(),
            send_at,
            status: ScheduleStatus::Pending,
            created_at: now,
        };
        self.store().insert_schedule(&record)?;
        self.arm(&mut timers, record.id, record.send_at);

        tracing::info!("⏰ Message #{} scheduled for {}", record.id, record.send_at);
        Ok(ScheduleReceipt {
            id: record.id,
            message: record.message,
            send_at: record.send_at,
        })
    }

    /// Re-arm every pending record from storage. Call once at process start.
    pub async fn restore_scheduled_messages(&self) -> Result<usize> {
        let restored = self.sync_with_store().await?;
        tracing::info!("♻️ Restored {restored} scheduled messages (overdue ones fire now)");
        Ok(restored)
    }

    /// Bring the timers in line with storage: arm pending rows that are new or
    /// moved, and drop timers whose row is no longer pending. Returns how many
    /// timers were armed.
    pub async fn sync_with_store(&self) -> Result<usize> {
        if self.offline {
            return Ok(0);
        }
        let mut timers = self.timers.map.lock().await;
        let pending = self.store().pending_schedules()?;

        let mut armed = 0;
        for record in &pending {
            if timers
                .get(&record.id)
                .is_some_and(|t| t.send_at == record.send_at)
            {
                continue;
            }
            self.timers.arm(&mut timers, record.id, record.send_at);
            armed += 1;
        }

        let gone: Vec<i64> = timers
            .keys()
            .filter(|id| !pending.iter().any(|r| r.id == **id))
            .copied()
            .collect();
        for id in &gone {
            if let Some(timer) = timers.remove(id) {
                timer.handle.abort();
            }
        }
        if armed > 0 || !gone.is_empty() {
            tracing::debug!("🔄 Schedule sync: {armed} armed, {} dropped", gone.len());
        }
        Ok(armed)
    }

    /// Spawn the periodic store sync. A second call while running is a no-op.
    pub fn start_sync(self: &Arc<Self>, interval_secs: u64) {
        let Ok(mut slot) = self.sync.lock() else {
            return;
        };
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let scheduler = self.clone();
        *slot = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            loop {
                interval.tick().await;
                if let Err(e) = scheduler.sync_with_store().await {
                    tracing::warn!("⚠️ Schedule sync failed: {e}");
                }
            }
        }));
    }

    pub fn stop_sync(&self) {
        if let Some(handle) = self.sync.lock().ok().and_then(|mut h| h.take()) {
            handle.abort();
        }
    }

    /// Cancel a pending send. Returns its message.
    pub async fn cancel(&self, id: i64) -> Result<String> {
        let mut timers = self.timers.map.lock().await;
        let record = self.pending_record(id)?;
        self.store().set_schedule_status(id, ScheduleStatus::Cancelled)?;
        if let Some(timer) = timers.remove(&id) {
            timer.handle.abort();
        }
        tracing::info!("🚫 Scheduled message #{id} cancelled");
        Ok(record.message)
    }

    /// Change message and/or fire time of a pending send.
    pub async fn update(&self, id: i64, update: ScheduleUpdate) -> Result<ScheduleReceipt> {
        let new_send_at = update
            .delay_seconds
            .map(|delay| send_time(Utc::now(), delay))
            .transpose()?;

        let mut timers = self.timers.map.lock().await;
        let record = self.pending_record(id)?;

        if let Some(timer) = timers.remove(&id) {
            timer.handle.abort();
        }
        let message = update.message.unwrap_or(record.message);
        let send_at = new_send_at.unwrap_or(record.send_at);
        self.store().reschedule(id, &message, send_at)?;
        self.arm(&mut timers, id, send_at);

        tracing::info!("✏️ Scheduled message #{id} updated, fires at {send_at}");
        Ok(ScheduleReceipt {
            id,
            message,
            send_at,
        })
    }

    /// Pending sends, earliest first.
    pub fn list(&self) -> Result<Vec<PersistedSchedule>> {
        self.store().pending_schedules()
    }

    pub async fn armed_count(&self) -> usize {
        self.timers.map.lock().await.len()
    }

    /// Stop the sync loop and abort every timer. Records stay pending and are
    /// restored on next start.
    pub async fn shutdown(&self) {
        self.stop_sync();
        let mut timers = self.timers.map.lock().await;
        for (_, timer) in timers.drain() {
            timer.handle.abort();
        }
    }

    fn pending_record(&self, id: i64) -> Result<PersistedSchedule> {
        self.store()
            .get_schedule(id)?
            .filter(|r| r.status == ScheduleStatus::Pending)
            .ok_or_else(|| KindredError::NotFound(format!("pending schedule {id}")))
    }

    fn arm(&self, timers: &mut HashMap<i64, Timer>, id: i64, send_at: DateTime<Utc>) {
        if !self.offline {
            self.timers.arm(timers, id, send_at);
        }
    }
}

/// Timer body. Claims the record if it still fires at `send_at`, then delivers.
/// A delivery failure is logged and does not roll the status back.
async fn fire(timers: TimerSet, id: i64, generation: u64, send_at: DateTime<Utc>) {
    {
        let mut map = timers.map.lock().await;
        match map.get(&id) {
            Some(timer) if timer.generation == generation => {}
            _ => return,
        }
        map.remove(&id);
    }

    let record = match timers.store.claim_schedule(id, send_at) {
        Ok(Some(record)) => record,
        Ok(None) => {
            timers.follow(id).await;
            return;
        }
        Err(e) => {
            tracing::warn!("⚠️ Scheduled message #{id} could not be marked sent: {e}");
            return;
        }
    };

    let channel = &timers.channel;
    match channel.deliver(&OutboundMessage::scheduled(record.message)).await {
        Ok(()) => tracing::info!("🔔 Scheduled message #{id} delivered via {}", channel.name()),
        Err(e) => tracing::warn!("⚠️ Scheduled message #{id} delivery failed (not retried): {e}"),
    }
}

impl Drop for ScheduledMessageScheduler {
    fn drop(&mut self) {
        self.stop_sync();
        if let Ok(mut timers) = self.timers.map.try_lock() {
            for (_, timer) in timers.drain() {
                timer.handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::tests::RecordingChannel;
    use crate::persistence::SchedulerDb;
    use std::time::Duration;

    fn scheduler() -> (Arc<SchedulerDb>, Arc<RecordingChannel>, ScheduledMessageScheduler) {
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let channel = Arc::new(RecordingChannel::new());
        let scheduler = ScheduledMessageScheduler::new(db.clone(), channel.clone());
        (db, channel, scheduler)
    }

    async fn advance(secs: f64) {
        tokio::time::sleep(Duration::from_secs_f64(secs)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_at_send_time() {
        let (db, channel, scheduler) = scheduler();
        let receipt = scheduler.schedule("stretch", 5).await.unwrap();
        assert_eq!(receipt.id, 1);

        advance(4.0).await;
        assert!(channel.messages().is_empty());

        advance(2.0).await;
        assert_eq!(channel.messages(), vec!["stretch"]);
        assert_eq!(
            db.get_schedule(receipt.id).unwrap().unwrap().status,
            ScheduleStatus::Sent
        );
        assert_eq!(scheduler.armed_count().await, 0);

        advance(60.0).await;
        assert_eq!(channel.messages().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_past_due_fires_immediately() {
        let (_db, channel, scheduler) = scheduler();
        scheduler.schedule("overdue", -30).await.unwrap();
        advance(0.01).await;
        assert_eq!(channel.messages(), vec!["overdue"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_moves_fire_time() {
        let (_db, channel, scheduler) = scheduler();
        let receipt = scheduler.schedule("call mom", 5).await.unwrap();
        let updated = scheduler
            .update(
                receipt.id,
                ScheduleUpdate {
                    message: Some("call mom back".into()),
                    delay_seconds: Some(10),
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.message, "call mom back");
        assert!(updated.send_at > receipt.send_at);

        advance(6.0).await;
        assert!(channel.messages().is_empty());

        advance(5.0).await;
        assert_eq!(channel.messages(), vec!["call mom back"]);

        advance(30.0).await;
        assert_eq!(channel.messages().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_firing() {
        let (db, channel, scheduler) = scheduler();
        let receipt = scheduler.schedule("walk", 5).await.unwrap();
        assert_eq!(scheduler.cancel(receipt.id).await.unwrap(), "walk");
        assert!(matches!(
            scheduler.cancel(receipt.id).await,
            Err(KindredError::NotFound(_))
        ));
        assert!(matches!(
            scheduler.update(receipt.id, ScheduleUpdate::default()).await,
            Err(KindredError::NotFound(_))
        ));
        assert!(scheduler.list().unwrap().is_empty());

        advance(10.0).await;
        assert!(channel.messages().is_empty());
        assert_eq!(
            db.get_schedule(receipt.id).unwrap().unwrap().status,
            ScheduleStatus::Cancelled
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_recovers_pending() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scheduler.db");

        let first_channel = Arc::new(RecordingChannel::new());
        {
            let db = Arc::new(SchedulerDb::open(&path).unwrap());
            let first = ScheduledMessageScheduler::new(db, first_channel.clone());
            first.schedule("take meds", 5).await.unwrap();
            first.schedule("sleep", 3600).await.unwrap();
            // Process goes away before the timers fire.
            first.shutdown().await;
        }

        let db = Arc::new(SchedulerDb::open(&path).unwrap());
        let channel = Arc::new(RecordingChannel::new());
        let second = ScheduledMessageScheduler::new(db, channel.clone());
        assert_eq!(second.restore_scheduled_messages().await.unwrap(), 2);
        // Restoring again does not double-arm.
        assert_eq!(second.restore_scheduled_messages().await.unwrap(), 0);

        advance(6.0).await;
        assert_eq!(channel.messages(), vec!["take meds"]);
        assert!(first_channel.messages().is_empty());
        assert_eq!(second.list().unwrap().len(), 1);

        advance(3600.0).await;
        assert_eq!(channel.messages(), vec!["take meds", "sleep"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_only_persists() {
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let channel = Arc::new(RecordingChannel::new());
        let offline = ScheduledMessageScheduler::offline(db.clone(), channel.clone());
        let receipt = offline.schedule("later", 0).await.unwrap();
        assert_eq!(offline.armed_count().await, 0);

        advance(5.0).await;
        assert!(channel.messages().is_empty());
        assert_eq!(
            db.get_schedule(receipt.id).unwrap().unwrap().status,
            ScheduleStatus::Pending
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_delay_is_rejected() {
        let (_db, channel, scheduler) = scheduler();
        for delay in [i64::MAX, i64::MIN, 10_000_000_000_000, MAX_DELAY_SECONDS + 1] {
            assert!(matches!(
                scheduler.schedule("far", delay).await,
                Err(KindredError::InvalidArgument(_))
            ));
        }
        assert!(scheduler.list().unwrap().is_empty());
        assert_eq!(scheduler.armed_count().await, 0);

        let receipt = scheduler.schedule("soon", 2).await.unwrap();
        assert!(matches!(
            scheduler
                .update(
                    receipt.id,
                    ScheduleUpdate {
                        message: Some("never".into()),
                        delay_seconds: Some(i64::MAX),
                    },
                )
                .await,
            Err(KindredError::InvalidArgument(_))
        ));

        // The rejected update left the original send untouched.
        advance(3.0).await;
        assert_eq!(channel.messages(), vec!["soon"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_edits_from_another_process_reach_running_scheduler() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scheduler.db");

        let channel = Arc::new(RecordingChannel::new());
        let daemon = Arc::new(ScheduledMessageScheduler::new(
            Arc::new(SchedulerDb::open(&path).unwrap()),
            channel.clone(),
        ));
        let cli = ScheduledMessageScheduler::offline(
            Arc::new(SchedulerDb::open(&path).unwrap()),
            Arc::new(RecordingChannel::new()),
        );

        // Moved later behind the daemon's back: the old timer must not send.
        let receipt = daemon.schedule("old", 5).await.unwrap();
        cli.update(
            receipt.id,
            ScheduleUpdate {
                message: Some("new".into()),
                delay_seconds: Some(3600),
            },
        )
        .await
        .unwrap();
        advance(6.0).await;
        assert!(channel.messages().is_empty());
        assert_eq!(daemon.armed_count().await, 1);

        advance(3600.0).await;
        assert_eq!(channel.messages(), vec!["new"]);

        // New and cancelled rows are picked up by the sync loop.
        daemon.start_sync(1);
        cli.schedule("from cli", 1).await.unwrap();
        let dropped = cli.schedule("dropped", 4).await.unwrap();
        advance(1.5).await;
        cli.cancel(dropped.id).await.unwrap();

        advance(10.0).await;
        assert_eq!(channel.messages(), vec!["new", "from cli"]);
        assert_eq!(daemon.armed_count().await, 0);
        daemon.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_failure_keeps_sent() {
        let (db, channel, scheduler) = scheduler();
        channel.fail.store(true, std::sync::atomic::Ordering::SeqCst);
        let receipt = scheduler.schedule("ping", 1).await.unwrap();
        advance(2.0).await;
        assert_eq!(channel.messages().len(), 1);
        assert_eq!(
            db.get_schedule(receipt.id).unwrap().unwrap().status,
            ScheduleStatus::Sent
        );
    }
}

//! SQLite-backed persistence for scheduled messages and proactive history.
//! Survives restarts; the scheduler re-arms pending rows on start.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use kindred_core::error::{KindredError, Result};
use rusqlite::{Connection, OptionalExtension, params};

use crate::store::{
    DeliveryHistoryEntry, DeliveryLog, PersistedSchedule, ScheduleStatus, ScheduleStore,
};

/// SQLite store shared by the scheduler and the proactive gate.
pub struct SchedulerDb {
    conn: Mutex<Connection>,
}

fn db_err(context: &str) -> impl Fn(rusqlite::Error) -> KindredError + '_ {
    move |e| KindredError::Database(format!("{context}: {e}"))
}

/// Fixed-width UTC timestamp so that string order is time order.
fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

impl SchedulerDb {
    /// Open or create the database file.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err("DB open"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(db_err("WAL"))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        tracing::debug!("💾 Scheduler DB opened at {}", path.display());
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err("DB open"))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| KindredError::Database("connection lock poisoned".into()))
    }

    fn migrate(&self) -> Result<()> {
        self.conn()?
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS scheduled_messages (
                id INTEGER PRIMARY KEY,
                message TEXT NOT NULL,
                send_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',   -- 'pending', 'sent', 'cancelled'
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_scheduled_status ON scheduled_messages(status, send_at);

            CREATE TABLE IF NOT EXISTS proactive_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                condition_id TEXT NOT NULL,
                message TEXT NOT NULL,
                sent_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_proactive_sent ON proactive_history(sent_at);
         ",
            )
            .map_err(db_err("Migration"))
    }

    fn row_to_schedule(row: &rusqlite::Row<'_>) -> rusqlite::Result<PersistedSchedule> {
        let status: String = row.get(3)?;
        Ok(PersistedSchedule {
            id: row.get(0)?,
            message: row.get(1)?,
            send_at: parse_ts(&row.get::<_, String>(2)?)?,
            status: status.parse().unwrap_or(ScheduleStatus::Cancelled),
            created_at: parse_ts(&row.get::<_, String>(4)?)?,
        })
    }
}

impl ScheduleStore for SchedulerDb {
    fn next_schedule_id(&self) -> Result<i64> {
        self.conn()?
            .query_row(
                "SELECT COALESCE(MAX(id), 0) + 1 FROM scheduled_messages",
                [],
                |row| row.get(0),
            )
            .map_err(db_err("Next id"))
    }

    fn insert_schedule(&self, s: &PersistedSchedule) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT INTO scheduled_messages (id, message, send_at, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![s.id, s.message, ts(&s.send_at), s.status.as_str(), ts(&s.created_at)],
            )
            .map_err(db_err("Insert schedule"))?;
        Ok(())
    }

    fn get_schedule(&self, id: i64) -> Result<Option<PersistedSchedule>> {
        self.conn()?
            .query_row(
                "SELECT id, message, send_at, status, created_at FROM scheduled_messages WHERE id = ?1",
                params![id],
                Self::row_to_schedule,
            )
            .optional()
            .map_err(db_err("Get schedule"))
    }

    fn pending_schedules(&self) -> Result<Vec<PersistedSchedule>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, message, send_at, status, created_at FROM scheduled_messages
                 WHERE status = 'pending' ORDER BY send_at, id",
            )
            .map_err(db_err("Pending schedules"))?;
        let rows = stmt
            .query_map([], Self::row_to_schedule)
            .map_err(db_err("Pending schedules"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Pending schedules"))
    }

    fn set_schedule_status(&self, id: i64, status: ScheduleStatus) -> Result<()> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE scheduled_messages SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), ts(&Utc::now()), id],
            )
            .map_err(db_err("Update status"))?;
        if changed == 0 {
            return Err(KindredError::NotFound(format!("schedule {id}")));
        }
        Ok(())
    }

    fn reschedule(&self, id: i64, message: &str, send_at: DateTime<Utc>) -> Result<()> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE scheduled_messages SET message = ?1, send_at = ?2, updated_at = ?3 WHERE id = ?4",
                params![message, ts(&send_at), ts(&Utc::now()), id],
            )
            .map_err(db_err("Reschedule"))?;
        if changed == 0 {
            return Err(KindredError::NotFound(format!("schedule {id}")));
        }
        Ok(())
    }

    fn claim_schedule(&self, id: i64, send_at: DateTime<Utc>) -> Result<Option<PersistedSchedule>> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE scheduled_messages SET status = 'sent', updated_at = ?1
                 WHERE id = ?2 AND status = 'pending' AND send_at = ?3",
                params![ts(&Utc::now()), id, ts(&send_at)],
            )
            .map_err(db_err("Claim schedule"))?;
        if changed == 0 {
            return Ok(None);
        }
        conn.query_row(
            "SELECT id, message, send_at, status, created_at FROM scheduled_messages WHERE id = ?1",
            params![id],
            Self::row_to_schedule,
        )
        .optional()
        .map_err(db_err("Claim schedule"))
    }
}

impl DeliveryLog for SchedulerDb {
    fn append_delivery(&self, entry: &DeliveryHistoryEntry) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT INTO proactive_history (condition_id, message, sent_at) VALUES (?1, ?2, ?3)",
                params![entry.condition_id, entry.message, ts(&entry.sent_at)],
            )
            .map_err(db_err("Append delivery"))?;
        Ok(())
    }

    fn deliveries_since(&self, since: DateTime<Utc>) -> Result<Vec<DeliveryHistoryEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT condition_id, message, sent_at FROM proactive_history
                 WHERE sent_at >= ?1 ORDER BY sent_at, id",
            )
            .map_err(db_err("Delivery history"))?;
        let rows = stmt
            .query_map(params![ts(&since)], |row| {
                Ok(DeliveryHistoryEntry {
                    condition_id: row.get(0)?,
                    message: row.get(1)?,
                    sent_at: parse_ts(&row.get::<_, String>(2)?)?,
                })
            })
            .map_err(db_err("Delivery history"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Delivery history"))
    }

    fn prune_deliveries(&self, keep: usize) -> Result<usize> {
        self.conn()?
            .execute(
                "DELETE FROM proactive_history WHERE id NOT IN
                 (SELECT id FROM proactive_history ORDER BY sent_at DESC, id DESC LIMIT ?1)",
                params![keep as i64],
            )
            .map_err(db_err("Prune history"))
    }
}

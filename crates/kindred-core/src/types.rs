//! Shared data types used by configuration and the scheduler.

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

/// A proactive-messaging rule: when `trigger` holds and the anti-spam gate is open,
/// one of `messages` is sent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TriggerCondition {
    pub id: String,
    #[serde(default = "bool_true")]
    pub enabled: bool,
    pub trigger: TriggerSpec,
    /// Candidate texts; one is picked at random when the rule fires.
    pub messages: Vec<String>,
    /// Minimum hours between two deliveries of this rule.
    #[serde(default)]
    pub cooldown_hours: f64,
    /// Maximum deliveries of this rule in any trailing 7 days.
    #[serde(default = "default_max_per_week")]
    pub max_per_week: u32,
}

fn bool_true() -> bool { true }
fn default_max_per_week() -> u32 { 7 }

/// Predicate half of a [`TriggerCondition`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerSpec {
    /// The user has been silent for at least `min_hours`.
    Silence { min_hours: f64 },
    /// The last observed away-event is `event` and at least `min_minutes` have passed since it began.
    AfterEvent { event: String, min_minutes: i64 },
    /// The current away-event's expected end passed more than `grace_minutes` ago.
    EventOverdue {
        #[serde(default)]
        grace_minutes: i64,
    },
}

/// Daily window during which nothing proactive may be sent.
/// `start > end` wraps around midnight (e.g. 23:00–08:00).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuietHours {
    #[serde(with = "hhmm")]
    pub start: NaiveTime,
    #[serde(with = "hhmm")]
    pub end: NaiveTime,
}

impl QuietHours {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    /// Parse two "HH:MM" strings.
    pub fn parse(start: &str, end: &str) -> crate::error::Result<Self> {
        Ok(Self {
            start: hhmm::parse(start)?,
            end: hhmm::parse(end)?,
        })
    }

    /// Whether `time` falls inside the window. Start is inclusive, end exclusive.
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start == self.end {
            return false;
        }
        if self.start < self.end {
            time >= self.start && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }
}

mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::error::KindredError;

    pub fn parse(s: &str) -> crate::error::Result<NaiveTime> {
        NaiveTime::parse_from_str(s.trim(), "%H:%M")
            .map_err(|e| KindredError::Config(format!("Invalid time '{s}' (expected HH:MM): {e}")))
    }

    pub fn serialize<S: Serializer>(time: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_quiet_hours_wraparound() {
        let quiet = QuietHours::parse("23:00", "08:00").unwrap();
        assert!(quiet.contains(t(23, 0)));
        assert!(quiet.contains(t(2, 30)));
        assert!(quiet.contains(t(7, 59)));
        assert!(!quiet.contains(t(8, 0)));
        assert!(!quiet.contains(t(12, 0)));
        assert!(!quiet.contains(t(22, 59)));
    }

    #[test]
    fn test_quiet_hours_same_day() {
        let quiet = QuietHours::parse("13:00", "14:30").unwrap();
        assert!(quiet.contains(t(13, 45)));
        assert!(!quiet.contains(t(14, 30)));
        assert!(!quiet.contains(t(9, 0)));
    }

    #[test]
    fn test_quiet_hours_rejects_garbage() {
        assert!(QuietHours::parse("25:00", "08:00").is_err());
        assert!(QuietHours::parse("late", "08:00").is_err());
    }

    #[test]
    fn test_trigger_condition_toml() {
        let raw = r#"
            id = "long_silence"
            messages = ["hey", "still there?"]
            cooldown_hours = 72.0
            max_per_week = 2
            trigger = { kind = "silence", min_hours = 24.0 }
        "#;
        let cond: TriggerCondition = toml::from_str(raw).unwrap();
        assert!(cond.enabled);
        assert_eq!(cond.trigger, TriggerSpec::Silence { min_hours: 24.0 });
        assert_eq!(cond.max_per_week, 2);
    }
}

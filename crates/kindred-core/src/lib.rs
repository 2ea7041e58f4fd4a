//! # Kindred Core
//!
//! Shared pieces for the Kindred companion backend: the error type, the TOML
//! configuration, and the trigger-rule types consumed by the scheduler.

pub mod config;
pub mod error;
pub mod types;

pub use config::KindredConfig;
pub use error::{KindredError, Result};
pub use types::{QuietHours, TriggerCondition, TriggerSpec};

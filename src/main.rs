//! # Kindred: background scheduler daemon
//!
//! Usage:
//!   kindred run                              # Restore reminders, start workers + check-ins
//!   kindred schedule "drink water" --delay 600
//!   kindred list                             # Pending reminders
//!   kindred cancel 3
//!   kindred update 3 --delay 1200
//!   kindred status                           # Queue configuration as JSON

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use kindred_core::KindredConfig;
use kindred_scheduler::delivery::{LogChannel, channel_from_config};
use kindred_scheduler::{
    QueueManager, ScheduleUpdate, ScheduledMessageScheduler, SchedulerDb, SchedulerRuntime,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "kindred",
    version,
    about = "🌱 Kindred: job queues, reminders and proactive check-ins for your companion"
)]
struct Cli {
    /// Config file (default: ~/.kindred/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Override the schedule database path
    #[arg(long, global = true)]
    db_path: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler until Ctrl-C
    ///
    /// Fires stored reminders, including ones added or changed with the other
    /// subcommands while it runs. The job workers and proactive check-ins need a
    /// host application: this daemon has no producer of its own, so it never
    /// enqueues jobs or observes user activity.
    Run,
    /// Persist a reminder (a running daemon picks it up on its next sync)
    Schedule {
        message: String,
        /// Seconds from now
        #[arg(short, long)]
        delay: i64,
    },
    /// List pending reminders
    List,
    /// Cancel a pending reminder
    Cancel { id: i64 },
    /// Change a pending reminder
    Update {
        id: i64,
        #[arg(short, long)]
        message: Option<String>,
        /// New delay in seconds from now
        #[arg(short, long)]
        delay: Option<i64>,
    },
    /// Print queue configuration
    Status,
}

fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

fn init_logging(verbose: bool, json: bool) {
    let filter = if verbose {
        "kindred=debug,kindred_scheduler=debug,kindred_core=debug"
    } else {
        "kindred=info,kindred_scheduler=info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
    }
}

fn load_config(path: Option<&str>) -> Result<KindredConfig> {
    let config = match path {
        Some(p) => KindredConfig::load_from(&expand_path(p))?,
        None => KindredConfig::load()?,
    };
    Ok(config)
}

fn open_db(config: &KindredConfig, override_path: Option<&str>) -> Result<Arc<SchedulerDb>> {
    let raw = override_path.unwrap_or(&config.schedule.db_path);
    let path = expand_path(raw);
    Ok(Arc::new(SchedulerDb::open(Path::new(&path))?))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json_logs);

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Run => {
            let db = open_db(&config, cli.db_path.as_deref())?;
            let channel = channel_from_config(&config.delivery);
            tracing::info!("🌱 Kindred starting (delivery via {})", channel.name());

            let runtime = SchedulerRuntime::new(config, db, channel, Vec::new());
            runtime.start().await?;
            tracing::info!("⚙️ No local job producer: workers stay idle until a host enqueues jobs");

            tokio::signal::ctrl_c().await?;
            tracing::info!("Shutting down...");
            runtime.shutdown().await;
        }
        Command::Schedule { message, delay } => {
            let schedules = offline_scheduler(&config, cli.db_path.as_deref())?;
            let receipt = schedules.schedule(&message, delay).await?;
            println!("⏰ #{} scheduled for {}", receipt.id, receipt.send_at.to_rfc3339());
        }
        Command::List => {
            let schedules = offline_scheduler(&config, cli.db_path.as_deref())?;
            let pending = schedules.list()?;
            if pending.is_empty() {
                println!("No pending reminders.");
            }
            for s in pending {
                println!("#{:<4} {}  {}", s.id, s.send_at.to_rfc3339(), s.message);
            }
        }
        Command::Cancel { id } => {
            let schedules = offline_scheduler(&config, cli.db_path.as_deref())?;
            let message = schedules.cancel(id).await?;
            println!("🚫 Cancelled #{id}: {message}");
        }
        Command::Update { id, message, delay } => {
            let schedules = offline_scheduler(&config, cli.db_path.as_deref())?;
            let receipt = schedules
                .update(
                    id,
                    ScheduleUpdate {
                        message,
                        delay_seconds: delay,
                    },
                )
                .await?;
            println!(
                "✏️ #{id} now \"{}\" at {}",
                receipt.message,
                receipt.send_at.to_rfc3339()
            );
        }
        Command::Status => {
            let queues = QueueManager::new(&config.queues, &config.workers);
            let status = serde_json::json!({
                "queues": queues.overall_status().await.queues,
                "workers": config.workers,
                "proactive": {
                    "enabled": config.proactive.enabled,
                    "interval_secs": config.proactive.interval_secs,
                    "daily_cap": config.proactive.daily_cap,
                    "rules": config.proactive.effective_conditions().len(),
                },
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}

/// Scheduler for one-off management commands. It only edits rows; a running
/// daemon picks them up on its next store sync.
fn offline_scheduler(config: &KindredConfig, db_path: Option<&str>) -> Result<ScheduledMessageScheduler> {
    let db = open_db(config, db_path)?;
    Ok(ScheduledMessageScheduler::offline(db, Arc::new(LogChannel)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_help_states_daemon_has_no_producers() {
        let cli = Cli::command();
        let run = cli.find_subcommand("run").unwrap();
        let help = run.get_long_about().unwrap().to_string();
        assert!(help.contains("no producer of its own"));
        assert!(help.contains("added or changed"));
    }

    #[test]
    fn test_schedule_accepts_negative_delay() {
        let cli = Cli::try_parse_from(["kindred", "schedule", "now", "--delay=-5"]).unwrap();
        assert!(matches!(cli.command, Command::Schedule { delay: -5, .. }));
    }
}

//! Vigil Control - administrative CLI for the vigil pipeline.
//!
//! Schema init/reset, scheduler cursor management, and a quick view of
//! the incidents the daemon is currently tracking.

use anyhow::{bail, Result};
use chrono::{Duration, Local, NaiveDateTime};
use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use vigil_common::config::VigilConfig;
use vigil_common::signal::{Severity, ALERT_TIME_FORMAT};
use vigil_common::store::IncidentStore;

#[derive(Parser)]
#[command(name = "vigilctl")]
#[command(about = "Vigil - alert mail incident pipeline control", long_about = None)]
#[command(version)]
struct Cli {
    /// Database path (defaults to the configured store)
    #[arg(long)]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema (idempotent)
    InitDb,

    /// Drop and recreate all tables, wiping pipeline state
    ResetDb {
        /// Confirm the wipe
        #[arg(long)]
        yes: bool,
    },

    /// Reset the scheduler cursor
    ResetCursor {
        /// Set to a specific time (YYYY-MM-DD HH:MM:SS)
        #[arg(long)]
        to: Option<String>,

        /// Set to this many hours before now
        #[arg(long, conflicts_with = "to")]
        hours_ago: Option<i64>,
    },

    /// List incidents currently tracked as active
    Incidents,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = VigilConfig::load();
    let db_path = cli.db.unwrap_or(config.store.db_path);
    let store = IncidentStore::open(&db_path)?;

    match cli.command {
        Commands::InitDb => {
            store.init_schema()?;
            println!("[✓] Database initialized at {db_path}");
        }

        Commands::ResetDb { yes } => {
            if !yes {
                bail!("reset-db wipes all incidents, audit rows and the cursor; re-run with --yes");
            }
            store.reset_schema()?;
            println!("[✓] Database re-initialized at {db_path}");
        }

        Commands::ResetCursor { to, hours_ago } => {
            let target = match (to, hours_ago) {
                (Some(ts), _) => NaiveDateTime::parse_from_str(&ts, ALERT_TIME_FORMAT)
                    .map_err(|e| anyhow::anyhow!("bad --to timestamp ({e})"))?,
                (None, Some(hours)) => Local::now().naive_local() - Duration::hours(hours),
                (None, None) => Local::now().naive_local(),
            };
            store.reset_cursor(target)?;
            println!("[✓] Scheduler cursor reset to {target}");
        }

        Commands::Incidents => {
            let incidents = store.active_incidents()?;
            if incidents.is_empty() {
                println!("No active incidents.");
                return Ok(());
            }
            println!(
                "{:<28} {:<13} {:<9} {:<20} {:<16} {:>5}",
                "INCIDENT", "TYPE", "SEVERITY", "LAST SEEN", "TICKET", "FLIPS"
            );
            for inc in incidents {
                let severity = match inc.severity {
                    Severity::Critical => inc.severity.to_string().red().to_string(),
                    Severity::Info => inc.severity.to_string().green().to_string(),
                };
                println!(
                    "{:<28} {:<13} {:<9} {:<20} {:<16} {:>5}",
                    inc.incident_key,
                    inc.alert_type.to_string(),
                    severity,
                    inc.last_seen.format(ALERT_TIME_FORMAT).to_string(),
                    inc.ticket_id.as_deref().unwrap_or("-"),
                    inc.flip_count,
                );
            }
        }
    }

    Ok(())
}

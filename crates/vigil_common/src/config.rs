//! Configuration for the vigil pipeline.
//!
//! Loads /etc/vigil/config.toml or falls back to defaults. Every field
//! has a serde default so a partial file is fine.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use crate::error::VigilError;

/// Config file path.
pub const CONFIG_PATH: &str = "/etc/vigil/config.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VigilConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub mailbox: MailboxConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxConfig {
    /// Drop directory the bundled spool source reads from.
    #[serde(default = "default_spool_dir")]
    pub spool_dir: String,

    /// Sender allow-list; substring match against the mail sender.
    #[serde(default = "default_senders")]
    pub senders: Vec<String>,

    /// Max messages per fetch.
    #[serde(default = "default_fetch_limit")]
    pub fetch_limit: usize,

    /// Feed tag stamped into every published envelope.
    #[serde(default = "default_source_name")]
    pub source_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Sliding window length. Also the flap detection window the engine
    /// uses, so the two stay in lockstep.
    #[serde(default = "default_cycle_minutes")]
    pub cycle_minutes: i64,

    /// Sub-interval between re-polls inside one window.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Fixed delay before retrying after a failed cycle or message.
    #[serde(default = "default_failure_backoff")]
    pub failure_backoff_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// In-flight buffer of the delivery channel.
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
}

fn default_db_path() -> String {
    crate::store::STORE_DB_PATH.to_string()
}

fn default_spool_dir() -> String {
    "/var/spool/vigil".to_string()
}

fn default_senders() -> Vec<String> {
    vec!["monitoring@".to_string()]
}

fn default_fetch_limit() -> usize {
    100
}

fn default_source_name() -> String {
    "monitoring".to_string()
}

fn default_cycle_minutes() -> i64 {
    15
}

fn default_poll_interval() -> u64 {
    30
}

fn default_failure_backoff() -> u64 {
    5
}

fn default_queue_capacity() -> usize {
    64
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            spool_dir: default_spool_dir(),
            senders: default_senders(),
            fetch_limit: default_fetch_limit(),
            source_name: default_source_name(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cycle_minutes: default_cycle_minutes(),
            poll_interval_secs: default_poll_interval(),
            failure_backoff_secs: default_failure_backoff(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
        }
    }
}

impl VigilConfig {
    /// Load the system config, falling back to defaults when the file is
    /// missing or unreadable.
    pub fn load() -> Self {
        match Self::load_from(CONFIG_PATH) {
            Ok(config) => {
                info!("Loaded config from {}", CONFIG_PATH);
                config
            }
            Err(e) => {
                warn!("Using default config ({e})");
                Self::default()
            }
        }
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, VigilError> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| VigilError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = VigilConfig::default();
        assert_eq!(config.scheduler.cycle_minutes, 15);
        assert_eq!(config.scheduler.poll_interval_secs, 30);
        assert_eq!(config.mailbox.fetch_limit, 100);
        assert_eq!(config.store.db_path, crate::store::STORE_DB_PATH);
    }

    #[test]
    fn test_partial_file_fills_missing_fields() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [scheduler]
            cycle_minutes = 5

            [mailbox]
            senders = ["alerts@example.net"]
            "#
        )
        .unwrap();

        let config = VigilConfig::load_from(file.path()).unwrap();
        assert_eq!(config.scheduler.cycle_minutes, 5);
        assert_eq!(config.scheduler.poll_interval_secs, 30);
        assert_eq!(config.mailbox.senders, vec!["alerts@example.net"]);
        assert_eq!(config.mailbox.fetch_limit, 100);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(VigilConfig::load_from("/nonexistent/vigil.toml").is_err());
    }
}

//! Mail source boundary.
//!
//! The scheduler fetches candidate alerts through [`MailSource`]; the
//! mailbox protocol behind it is not the pipeline's concern. The bundled
//! [`SpoolSource`] reads one JSON message per file from a drop directory
//! and applies the same filtering a mailbox adapter would: sender
//! allow-list, time range, read status, limit, newest first.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::warn;

use crate::error::VigilError;

/// One mail as the source hands it over.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailMessage {
    pub message_id: String,
    pub subject: String,
    pub body: String,
    pub sender: String,
    /// Mailbox receive time; also the time-range filter key.
    pub received: NaiveDateTime,
    #[serde(default = "default_unread")]
    pub unread: bool,
}

fn default_unread() -> bool {
    true
}

/// Fetch filter. `start` is inclusive, `end` exclusive.
#[derive(Debug, Clone)]
pub struct FetchWindow {
    pub start: Option<NaiveDateTime>,
    pub end: Option<NaiveDateTime>,
    pub only_unread: bool,
    pub limit: usize,
}

/// Where candidate alert mail comes from.
pub trait MailSource {
    fn fetch(&self, window: &FetchWindow) -> Result<Vec<MailMessage>, VigilError>;
}

/// Drop-directory source: one JSON [`MailMessage`] per file. Files that
/// fail to parse are skipped with a warning, the way a mailbox adapter
/// skips calendar invites and receipts.
pub struct SpoolSource {
    dir: PathBuf,
    allowed_senders: Vec<String>,
}

impl SpoolSource {
    pub fn new<P: Into<PathBuf>>(dir: P, allowed_senders: &[String]) -> Self {
        Self {
            dir: dir.into(),
            allowed_senders: allowed_senders
                .iter()
                .map(|s| s.trim().to_lowercase())
                .collect(),
        }
    }

    fn sender_allowed(&self, sender: &str) -> bool {
        let sender = sender.to_lowercase();
        self.allowed_senders.iter().any(|s| sender.contains(s))
    }
}

impl MailSource for SpoolSource {
    fn fetch(&self, window: &FetchWindow) -> Result<Vec<MailMessage>, VigilError> {
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| VigilError::Mail(format!("spool dir {}: {e}", self.dir.display())))?;

        let mut skipped = 0usize;
        let mut messages = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            let msg: MailMessage = match fs::read(&path)
                .map_err(VigilError::from)
                .and_then(|bytes| serde_json::from_slice(&bytes).map_err(VigilError::from))
            {
                Ok(msg) => msg,
                Err(_) => {
                    skipped += 1;
                    continue;
                }
            };

            if !self.sender_allowed(&msg.sender) {
                continue;
            }
            if let Some(start) = window.start {
                if msg.received < start {
                    continue;
                }
            }
            if let Some(end) = window.end {
                if msg.received >= end {
                    continue;
                }
            }
            if window.only_unread && !msg.unread {
                continue;
            }
            messages.push(msg);
        }

        if skipped > 0 {
            warn!("skipped {skipped} unparseable spool files");
        }

        // Newest first, like a mailbox listing; the scheduler re-orders by
        // embedded trap time before publishing.
        messages.sort_by(|a, b| b.received.cmp(&a.received));
        messages.truncate(window.limit);
        Ok(messages)
    }
}

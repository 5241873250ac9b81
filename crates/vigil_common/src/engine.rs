//! Ticketing decision engine.
//!
//! A pure rule cascade over one extracted signal and the incident's
//! current state. First matching rule wins; the engine never touches the
//! store; the consumer applies whatever action comes back.

use chrono::{Duration, NaiveDateTime};

use crate::signal::{AlertSignal, AlertType, Severity};
use crate::store::IncidentState;

/// Minutes a critical reachability incident may self-heal before a P1
/// ticket is queued. Shared with the escalation sweeper.
pub const TICKET_GRACE_MINUTES: i64 = 5;

/// Disk usage percentage at which a critical disk alert becomes a ticket.
pub const DISK_USAGE_THRESHOLD: f64 = 90.0;

/// What the pipeline should do with one signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    CreateP1,
    CreateP2,
    Wait,
    Resolve,
    Ignore,
}

impl Action {
    /// Canonical form recorded in the audit trail.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::CreateP1 => "CREATE_P1",
            Action::CreateP2 => "CREATE_P2",
            Action::Wait => "WAIT",
            Action::Resolve => "RESOLVE",
            Action::Ignore => "IGNORE",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decide the action for `signal` against the incident's current state.
///
/// `cycle_minutes` is the scheduler cycle length, doubling as the flap
/// detection window. `now` is passed in so the rules stay deterministic
/// under test.
pub fn decide(
    signal: &AlertSignal,
    state: Option<&IncidentState>,
    cycle_minutes: i64,
    now: NaiveDateTime,
) -> Action {
    let ticket_exists = state
        .and_then(|s| s.ticket_id.as_deref())
        .is_some_and(|t| !t.is_empty());
    let flip_count = state.map_or(0, |s| s.flip_count);

    // Rule 1: flapping. A device that flipped state within the current
    // cycle window escalates immediately, whatever its alert type.
    if flip_count > 0 {
        if let Some(flipped_at) = state.map(|s| s.last_flip()) {
            if now.signed_duration_since(flipped_at) <= Duration::minutes(cycle_minutes) {
                return if ticket_exists {
                    Action::Wait
                } else {
                    Action::CreateP1
                };
            }
        }
    }

    match (signal.alert_type, signal.severity) {
        (AlertType::Reachability, Severity::Critical) => {
            if ticket_exists {
                // Duplicate suppression: one open ticket per incident.
                return Action::Wait;
            }
            // A delayed mail whose incident is already past the grace
            // period gets its ticket immediately.
            let first_seen = state.map_or(signal.timestamp, |s| s.first_seen);
            if now.signed_duration_since(first_seen) >= Duration::minutes(TICKET_GRACE_MINUTES) {
                Action::CreateP1
            } else {
                Action::Wait
            }
        }
        (AlertType::Reachability, Severity::Info) => {
            // Zombie protection: never auto-close an open ticket on a
            // recovery mail. Without a ticket the blip healed itself.
            if ticket_exists {
                Action::Wait
            } else {
                Action::Resolve
            }
        }
        (AlertType::Disk, severity) => {
            if severity == Severity::Critical && signal.usage >= DISK_USAGE_THRESHOLD {
                if ticket_exists {
                    Action::Wait
                } else {
                    Action::CreateP2
                }
            } else {
                Action::Resolve
            }
        }
        (AlertType::Backup, Severity::Critical) => {
            if ticket_exists {
                Action::Wait
            } else {
                Action::CreateP2
            }
        }
        (AlertType::Backup, Severity::Info) => Action::Resolve,
        (AlertType::Unknown, _) => Action::Ignore,
    }
}

//! Aged-incident escalation sweep.
//!
//! The decision engine only runs when a mail arrives, so a critical
//! reachability incident whose follow-up mail never comes would sit in
//! its grace period forever. Once per ingestion cycle this sweep promotes
//! every active, unticketed critical reachability incident older than the
//! grace period to a queued P1. The ticket-absence filter in the
//! candidate query makes a repeated sweep a no-op.

use chrono::{Duration, NaiveDateTime};
use tracing::info;
use vigil_common::engine::TICKET_GRACE_MINUTES;
use vigil_common::store::{IncidentStore, QUEUED_P1};
use vigil_common::VigilError;

/// Returns how many incidents were escalated.
pub fn check_aged_incidents(
    store: &IncidentStore,
    now: NaiveDateTime,
) -> Result<usize, VigilError> {
    let mut escalated = 0;
    for (incident_key, first_seen) in store.unticketed_critical_reachability()? {
        let elapsed = now.signed_duration_since(first_seen);
        if elapsed >= Duration::minutes(TICKET_GRACE_MINUTES) {
            store.assign_pending_ticket(&incident_key, QUEUED_P1)?;
            info!(
                "Aged check: P1 ticket queued for {incident_key} (elapsed {:.1}m)",
                elapsed.num_seconds() as f64 / 60.0
            );
            escalated += 1;
        }
    }
    Ok(escalated)
}

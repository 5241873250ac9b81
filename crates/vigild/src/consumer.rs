//! Categorization consumer.
//!
//! Serial apply loop, one delivery at a time: extract the signal, decide,
//! update the incident record, append to the audit trail. A decode or
//! processing failure logs and nacks the message; there is no retry or
//! dead-letter path, the alert is gone. That drop-on-failure policy is
//! deliberate and matches the delivery contract.

use chrono::{Local, NaiveDateTime};
use tracing::{error, info};
use vigil_common::config::VigilConfig;
use vigil_common::engine::{self, Action};
use vigil_common::queue::{AlertEnvelope, QueueReceiver};
use vigil_common::signal::{self, Severity};
use vigil_common::store::{IncidentStore, PENDING_P1, PENDING_P2};
use vigil_common::VigilError;

pub async fn run(store: IncidentStore, mut queue: QueueReceiver, config: VigilConfig) {
    info!("Categorization consumer started");

    while let Some(delivery) = queue.receive().await {
        let outcome = delivery.decode().and_then(|envelope| {
            process_alert(
                &store,
                &envelope,
                config.scheduler.cycle_minutes,
                Local::now().naive_local(),
            )
        });
        match outcome {
            Ok(_) => delivery.ack(),
            Err(e) => {
                error!("Failed to process delivery: {e}");
                delivery.nack();
            }
        }
    }

    info!("Delivery channel closed, consumer stopping");
}

/// Apply one alert to the incident store. Pure pipeline except for the
/// store writes; `now` is passed in so tests control the clock.
pub fn process_alert(
    store: &IncidentStore,
    envelope: &AlertEnvelope,
    cycle_minutes: i64,
    now: NaiveDateTime,
) -> Result<Action, VigilError> {
    // The queue payload carries no date header; extraction falls back to
    // the embedded alert time or the processing time.
    let sig = signal::extract(&envelope.subject, &envelope.body, None, now);
    info!(
        "Alert \"{}\" as {}",
        truncate(&envelope.subject, 90),
        sig.incident_key
    );

    let state = store.get(&sig.incident_key)?;

    // An Info record going Critical is a flip; the counter feeds the
    // flap rule on the next alerts for this incident.
    let is_flip = matches!(
        (&state, sig.severity),
        (Some(s), Severity::Critical) if s.severity == Severity::Info
    );
    if is_flip {
        info!("Flip detected for {}: Info to Critical", sig.incident_key);
    }

    let action = engine::decide(&sig, state.as_ref(), cycle_minutes, now);

    match action {
        Action::Resolve | Action::Ignore => {
            if state.is_some() {
                store.record_resolution(&sig.incident_key, sig.timestamp, sig.severity)?;
            }
            info!("Engine: {} for {}", action, sig.incident_key);
        }
        Action::CreateP1 | Action::CreateP2 => {
            if state.is_none() {
                store.create_or_refresh(
                    &sig.incident_key,
                    sig.alert_type,
                    sig.severity,
                    sig.timestamp,
                )?;
            }
            let pending = if action == Action::CreateP1 {
                PENDING_P1
            } else {
                PENDING_P2
            };
            store.apply_update(
                &sig.incident_key,
                sig.timestamp,
                Some(pending),
                Some(sig.severity),
                is_flip,
            )?;
            info!("Engine: {} for {} (ticket {pending})", action, sig.incident_key);
        }
        Action::Wait => {
            match &state {
                None => {
                    store.create_or_refresh(
                        &sig.incident_key,
                        sig.alert_type,
                        sig.severity,
                        sig.timestamp,
                    )?;
                    info!("Engine: WAIT for {} (monitoring)", sig.incident_key);
                }
                Some(existing) => {
                    store.apply_update(
                        &sig.incident_key,
                        sig.timestamp,
                        None,
                        Some(sig.severity),
                        is_flip,
                    )?;
                    match existing.ticket_id.as_deref() {
                        Some(ticket) => info!(
                            "Engine: WAIT for {} (ticket {ticket} already open)",
                            sig.incident_key
                        ),
                        None => info!("Engine: WAIT for {} (monitoring)", sig.incident_key),
                    }
                }
            }
        }
    }

    store.record_audit(
        &envelope.message_id,
        &sig.incident_key,
        sig.alert_type,
        sig.severity,
        sig.timestamp,
        &envelope.subject,
        action.as_str(),
    )?;

    Ok(action)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

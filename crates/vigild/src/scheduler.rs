//! Sliding-window ingestion scheduler.
//!
//! Each cycle owns the window `[cursor, cursor + cycle_minutes)`. The
//! mail source has no incremental feed, so the cycle re-polls the full
//! window-so-far at a fixed sub-interval and deduplicates against the ids
//! it already published this cycle. New mail is published in embedded
//! trap-time order, not arrival order. After the window closes the
//! escalation sweeper runs once, then the cursor advances unconditionally
//! to the window end.

use chrono::{Duration, Local, NaiveDateTime};
use std::collections::HashSet;
use std::time::Duration as StdDuration;
use tracing::{error, info};
use vigil_common::config::VigilConfig;
use vigil_common::mail::{FetchWindow, MailSource};
use vigil_common::queue::{AlertEnvelope, QueueSender};
use vigil_common::signal::embedded_trap_time;
use vigil_common::store::IncidentStore;
use vigil_common::VigilError;

use crate::sweeper;

/// Supervisor loop: one cycle at a time, forever. A failed cycle is
/// logged and retried after a fixed backoff from the last committed
/// cursor; it is never allowed to kill the task.
pub async fn run<S: MailSource>(
    store: IncidentStore,
    source: S,
    queue: QueueSender,
    config: VigilConfig,
) {
    info!(
        "Ingestion scheduler started (cycle {} min, poll every {}s)",
        config.scheduler.cycle_minutes, config.scheduler.poll_interval_secs
    );

    let mut cycle: u64 = 1;
    loop {
        match run_cycle(&store, &source, &queue, &config, cycle).await {
            Ok(published) => {
                info!("Cycle {cycle} complete ({published} alerts published)");
            }
            Err(e) => {
                error!("Cycle {cycle} failed: {e}");
                tokio::time::sleep(StdDuration::from_secs(
                    config.scheduler.failure_backoff_secs,
                ))
                .await;
            }
        }
        cycle += 1;
    }
}

/// Run one full window cycle. Returns the number of alerts published.
pub async fn run_cycle<S: MailSource>(
    store: &IncidentStore,
    source: &S,
    queue: &QueueSender,
    config: &VigilConfig,
    cycle: u64,
) -> Result<usize, VigilError> {
    let window_start = store.last_processed_time()?;
    let window_end = window_start + Duration::minutes(config.scheduler.cycle_minutes);
    info!(
        "Cycle {cycle} window {} to {}",
        window_start.format("%H:%M"),
        window_end.format("%H:%M")
    );

    let mut published_ids: HashSet<String> = HashSet::new();
    let mut published = 0usize;

    loop {
        let now = Local::now().naive_local();
        // The window-so-far; clamped so a catch-up cycle for a window that
        // already lies in the past never fetches beyond its own end.
        let fetch_end = window_end.min(now);
        let window = FetchWindow {
            start: Some(window_start),
            end: Some(fetch_end),
            only_unread: false,
            limit: config.mailbox.fetch_limit,
        };

        let mut fresh: Vec<_> = source
            .fetch(&window)?
            .into_iter()
            .filter(|m| !published_ids.contains(&m.message_id))
            .collect();

        if !fresh.is_empty() {
            // Logical order despite re-fetch and out-of-order delivery:
            // sort by the alert's own trap time, unparseable last.
            fresh.sort_by_key(|m| embedded_trap_time(&m.body).unwrap_or(NaiveDateTime::MAX));

            info!("Cycle {cycle}: publishing {} new alerts", fresh.len());
            for mail in fresh {
                let envelope = AlertEnvelope {
                    source: config.mailbox.source_name.clone(),
                    message_id: mail.message_id.clone(),
                    subject: mail.subject,
                    body: mail.body,
                };
                queue.publish(&envelope).await?;
                published_ids.insert(mail.message_id);
                published += 1;
            }
        }

        let remaining = window_end.signed_duration_since(Local::now().naive_local());
        if remaining.num_seconds() > config.scheduler.poll_interval_secs as i64 {
            tokio::time::sleep(StdDuration::from_secs(config.scheduler.poll_interval_secs)).await;
        } else {
            break;
        }
    }

    sweeper::check_aged_incidents(store, Local::now().naive_local())?;

    // Unconditional advance: an interrupted cycle is not replayed from the
    // failure point, recovery restarts from the committed cursor.
    store.set_last_processed_time(window_end)?;
    Ok(published)
}

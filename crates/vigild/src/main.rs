//! Vigil Daemon - alert mail ingestion and incident categorization.
//!
//! Two independent loops: the ingestion scheduler (sliding-window mailbox
//! polling, escalation sweep, cursor bookkeeping) and the categorization
//! consumer (signal extraction, ticketing decisions, incident state).
//! They only meet through the delivery channel and the store.

use anyhow::Result;
use std::fs;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vigil_common::config::VigilConfig;
use vigil_common::mail::SpoolSource;
use vigil_common::queue::memory_queue;
use vigil_common::store::IncidentStore;
use vigild::{consumer, scheduler};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Vigil Daemon v{} starting", env!("CARGO_PKG_VERSION"));

    let config = VigilConfig::load();
    fs::create_dir_all(&config.mailbox.spool_dir)?;

    // One connection per loop; the store's per-key statement atomicity is
    // the only coordination the two sides need.
    let scheduler_store = IncidentStore::open(&config.store.db_path)?;
    let consumer_store = IncidentStore::open(&config.store.db_path)?;

    let (queue_tx, queue_rx) = memory_queue(config.queue.capacity);
    let source = SpoolSource::new(&config.mailbox.spool_dir, &config.mailbox.senders);

    tokio::spawn(scheduler::run(
        scheduler_store,
        source,
        queue_tx,
        config.clone(),
    ));
    tokio::spawn(consumer::run(consumer_store, queue_rx, config));

    signal::ctrl_c().await?;
    info!("Shutting down gracefully");
    Ok(())
}

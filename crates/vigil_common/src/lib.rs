//! Vigil Common - shared types for the alert categorization pipeline.
//!
//! Signal extraction, the ticketing decision engine, the incident store,
//! and the boundaries to the mailbox and the delivery channel.

pub mod config;
pub mod engine;
pub mod error;
pub mod mail;
pub mod queue;
pub mod signal;
pub mod store;

pub use error::VigilError;

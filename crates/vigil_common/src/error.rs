//! Error types for Vigil.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VigilError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Delivery channel closed")]
    QueueClosed,

    #[error("Malformed queue payload: {0}")]
    Payload(serde_json::Error),

    #[error("Mail source error: {0}")]
    Mail(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

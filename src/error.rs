//! Error types for the scan engine

use thiserror::Error;

/// Main error type for vscanner operations
#[derive(Debug, Error)]
pub enum VscannerError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),

    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Scan '{0}' not found")]
    ScanNotFound(String),

    #[error("Scan '{scan_id}' cannot move from {from} to {to}")]
    InvalidTransition {
        scan_id: String,
        from: String,
        to: String,
    },

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Notification failed: {0}")]
    NotifyError(String),

    #[error("scan cancelled")]
    Cancelled,

    #[error("Job queue error: {0}")]
    QueueError(String),
}

/// Result type alias for vscanner operations
pub type Result<T> = std::result::Result<T, VscannerError>;

//! Error types for the dosing_core library.
//!
//! Only write paths report failures. Missing or malformed persisted data is
//! never an error: readers log it and degrade to an empty collection.

use std::io;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for dosing_core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The durable store cannot be opened or a transaction cannot complete
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

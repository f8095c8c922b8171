//! Error types shared across kgload crates

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, CommonError>;

/// Errors raised by the shared vocabulary and logging setup
#[derive(Error, Debug)]
pub enum CommonError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    #[error("Unknown file kind: {0}")]
    UnknownFileKind(String),

    #[error("Unknown schema version: {0}")]
    UnknownSchemaVersion(String),

    #[error("Invalid log setting {name}: {value}")]
    InvalidLogSetting { name: &'static str, value: String },

    #[error("Logging initialization failed: {0}")]
    LoggingInit(String),
}

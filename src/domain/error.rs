//! Domain error types

use thiserror::Error;

/// Error when parsing a duration string
#[derive(Debug, Clone, Error)]
#[error("Invalid duration format: \"{input}\". Expected <number><unit> groups with units ms, s or m (e.g., 150ms, 10s, 1m30s)")]
pub struct DurationParseError {
    pub input: String,
}

/// Error when a recording id is not a UUID
#[derive(Debug, Clone, Error)]
#[error("Invalid recording id: \"{input}\". Run `voxpart list` to see stored recordings")]
pub struct InvalidRecordingIdError {
    pub input: String,
}

/// Error when configuration fails
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Failed to parse config file: {0}")]
    ParseError(String),

    #[error("Failed to write config file: {0}")]
    WriteError(String),

    #[error("Invalid config value for '{key}': {message}")]
    ValidationError { key: String, message: String },

    #[error("Config file already exists at: {0}")]
    AlreadyExists(String),
}

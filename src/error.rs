// src/error.rs

//! Unified error handling for the collector.

use std::fmt;

use thiserror::Error;

/// Result type alias for collector operations.
pub type Result<T> = std::result::Result<T, AppError>;

/// Unified application error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// Storage backend error (S3, DynamoDB, filesystem)
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// URL parsing failed
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    /// CSS selector parsing failed
    #[error("Invalid selector '{selector}': {message}")]
    Selector { selector: String, message: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Data validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// A source handler failed
    #[error("Source error for {source_id}: {message}")]
    Source { source_id: String, message: String },

    /// A source handler did not answer in time
    #[error("Source {0} timed out")]
    Timeout(String),

    /// Writing the collected feed failed; the run's outcome is lost
    #[error("Persist error: {0}")]
    Persist(String),

    /// A single image request failed
    #[error("Image error: {0}")]
    Image(#[from] crate::services::ImageError),
}

impl AppError {
    /// Create a selector parsing error.
    pub fn selector(selector: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Selector {
            selector: selector.into(),
            message: message.to_string(),
        }
    }

    /// Create a storage error.
    pub fn storage(message: impl fmt::Display) -> Self {
        Self::Storage(message.to_string())
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a source error with the failing source's id.
    pub fn source(source_id: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Source {
            source_id: source_id.into(),
            message: message.to_string(),
        }
    }

    /// Create a persist error.
    pub fn persist(message: impl fmt::Display) -> Self {
        Self::Persist(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_error_names_source() {
        let err = AppError::source("torch", "connection reset");
        assert_eq!(
            err.to_string(),
            "Source error for torch: connection reset"
        );
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: AppError = io.into();
        assert!(matches!(err, AppError::Io(_)));
    }
}

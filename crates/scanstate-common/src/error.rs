//! Error types shared across the workspace

use thiserror::Error;

/// Result type alias for scanstate operations
pub type Result<T> = std::result::Result<T, ScanstateError>;

/// Main error type for scanstate
#[derive(Error, Debug)]
pub enum ScanstateError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

impl ScanstateError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a parse error for a named setting
    pub fn parse(name: &str, value: &str, reason: impl std::fmt::Display) -> Self {
        Self::Parse(format!("{name}={value:?}: {reason}"))
    }
}

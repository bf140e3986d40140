//! Error types for Turnstile.

use thiserror::Error;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Invalid limiter, rule or settings values
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failures reported by a counter store
    #[error("Store error: {0}")]
    Store(String),

    /// Settings could not be loaded from file or environment
    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CollectError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Rate limit acquisition timed out after {0:?}")]
    RateLimitTimeout(Duration),

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CollectError {
    /// True when the error is the cooperative-shutdown signal rather than a
    /// genuine failure. Workers exit on it without recording an outcome.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CollectError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, CollectError>;

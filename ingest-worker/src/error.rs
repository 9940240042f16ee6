//! Error types for the ingest worker

use crate::platform::RemoteFailure;
use thiserror::Error;

/// Ingest worker error
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Message could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// AMQP error
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    /// HTTP client error
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Delivery stream ended
    #[error("Subscription closed for queue {0}")]
    SubscriptionClosed(String),

    /// Remote platform failure
    #[error("Remote platform error: {0}")]
    Remote(#[from] RemoteFailure),
}

/// Result type
pub type Result<T> = std::result::Result<T, Error>;

//! Top-level error types for funnelbot.

use std::sync::Arc;

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config from {path}: {source}")]
    Load {
        path: String,
        source: Arc<std::io::Error>,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required config key: {0}")]
    MissingKey(String),
}

/// Database connection and schema errors.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("failed to connect to SQLite: {0}")]
    Connect(#[from] sqlx::Error),

    #[error("schema creation failed: {0}")]
    Schema(String),
}

/// Message delivery errors reported by the chat transport.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// Recipient unreachable, blocked the bot, or rejected the request.
    /// Non-retryable; the funnel marks the user dead.
    #[error("permanent delivery failure: {reason}")]
    Permanent { reason: String },

    /// Network or service trouble. The current event handling rolls back
    /// and the step stays eligible for a later event.
    #[error("transient delivery failure: {0}")]
    Transient(#[from] anyhow::Error),
}

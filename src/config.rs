//! Configuration loading and validation.

use crate::error::{ConfigError, Result};
use crate::funnel::evaluator::FunnelStep;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Funnelbot configuration, loaded from a TOML file with environment
/// overrides for secrets. All values are static for the process lifetime.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Reply text for `/start`.
    #[serde(default = "default_greeting")]
    pub greeting: String,

    pub telegram: TelegramConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    pub funnel: FunnelConfig,
}

/// Telegram transport configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    /// Bot API token. `FUNNELBOT_BOT_TOKEN` overrides the file value.
    #[serde(default)]
    pub bot_token: String,

    /// Long-poll timeout passed to `getUpdates`.
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,
}

/// Persistence configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database file. `FUNNELBOT_DATABASE_PATH` overrides the file value.
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

/// Funnel content and timing configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FunnelConfig {
    /// Outbound message content for steps 1 through 3.
    pub step_texts: [String; 3],

    /// Per-step target intervals in seconds, measured from each step's
    /// anchor timestamp.
    #[serde(default = "default_intervals")]
    pub step_intervals_secs: [u64; 3],

    /// Stop phrase screened against the step-2 reply content.
    pub trigger_phrase: String,

    /// Keywords that end the funnel without sending when present in a
    /// step's content.
    pub disqualifying_keywords: [String; 2],

    /// Send guards held longer than this are cleared by the startup sweep.
    #[serde(default = "default_stale_send_timeout")]
    pub stale_send_timeout_secs: u64,
}

fn default_greeting() -> String {
    "Hi! You are all set.".to_string()
}

fn default_poll_timeout() -> u64 {
    30
}

fn default_database_path() -> PathBuf {
    PathBuf::from("funnelbot.db")
}

fn default_intervals() -> [u64; 3] {
    [360, 2340, 93_600]
}

fn default_stale_send_timeout() -> u64 {
    // Longer than the largest default step interval, so the sweep never
    // clears a guard whose wait is still legitimately running.
    97_200
}

impl FunnelConfig {
    pub fn step_text(&self, step: FunnelStep) -> &str {
        &self.step_texts[step.index()]
    }

    pub fn step_interval(&self, step: FunnelStep) -> Duration {
        Duration::from_secs(self.step_intervals_secs[step.index()])
    }

    pub fn stale_send_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_send_timeout_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file, apply env overrides, validate.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Load {
            path: path.display().to_string(),
            source: Arc::new(source),
        })?;

        let mut config: Config = toml::from_str(&raw)
            .map_err(|error| ConfigError::Invalid(format!("{}: {error}", path.display())))?;

        if let Ok(token) = std::env::var("FUNNELBOT_BOT_TOKEN") {
            config.telegram.bot_token = token;
        }
        if let Ok(db_path) = std::env::var("FUNNELBOT_DATABASE_PATH") {
            config.database.path = PathBuf::from(db_path);
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.telegram.bot_token.is_empty() {
            return Err(ConfigError::MissingKey("telegram.bot_token".into()).into());
        }
        if self.funnel.trigger_phrase.is_empty() {
            return Err(ConfigError::MissingKey("funnel.trigger_phrase".into()).into());
        }
        if self.funnel.step_texts.iter().any(|text| text.is_empty()) {
            return Err(
                ConfigError::Invalid("funnel.step_texts entries must be non-empty".into()).into(),
            );
        }
        if self
            .funnel
            .disqualifying_keywords
            .iter()
            .any(|keyword| keyword.is_empty())
        {
            return Err(ConfigError::Invalid(
                "funnel.disqualifying_keywords entries must be non-empty".into(),
            )
            .into());
        }
        Ok(())
    }
}

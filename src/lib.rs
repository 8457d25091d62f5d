//! Funnelbot: a timed three-step outbound messaging funnel over Telegram
//! private chats, with SQLite-backed per-user state.

pub mod config;
pub mod db;
pub mod error;
pub mod funnel;
pub mod gateway;
pub mod telegram;

pub use error::{Error, Result};

/// Inbound private-message event from the chat transport.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    /// Stable end-user identifier (the Telegram user id).
    pub user_id: String,
    /// Message text as typed by the user.
    pub text: String,
    /// True when the message is the `/start` command.
    pub is_command_start: bool,
}

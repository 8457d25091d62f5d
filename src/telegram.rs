//! Telegram Bot API transport: long-poll inbound stream and message
//! delivery.

use crate::InboundEvent;
use crate::error::{DeliveryError, Result};
use crate::gateway::{DeliveryGateway, InboundStream};
use anyhow::Context as _;
use serde::Deserialize;
use std::sync::Arc;

/// Telegram delivery gateway and update poller.
pub struct TelegramGateway {
    client: reqwest::Client,
    bot_token: String,
    poll_timeout_secs: u64,
}

impl TelegramGateway {
    pub fn new(bot_token: impl Into<String>, poll_timeout_secs: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            bot_token: bot_token.into(),
            poll_timeout_secs,
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("https://api.telegram.org/bot{}/{}", self.bot_token, method)
    }

    /// Verify credentials and log the bot identity.
    pub async fn connect(&self) -> Result<()> {
        let me = self.get_me().await?;
        tracing::info!(
            username = me.username.as_deref().unwrap_or("unknown"),
            "telegram bot connected"
        );
        Ok(())
    }

    async fn get_me(&self) -> Result<TelegramUser> {
        let response = self
            .client
            .get(self.api_url("getMe"))
            .send()
            .await
            .context("getMe request failed")?;

        let body: ApiResponse<TelegramUser> = response
            .json()
            .await
            .context("invalid getMe response")?;

        if !body.ok {
            return Err(anyhow::anyhow!(
                "telegram api error: {}",
                body.description.unwrap_or_default()
            )
            .into());
        }

        body.result
            .context("getMe returned no bot info")
            .map_err(Into::into)
    }

    async fn get_updates(&self, offset: i64) -> Result<Vec<TelegramUpdate>> {
        let response = self
            .client
            .get(self.api_url("getUpdates"))
            .query(&[
                ("offset", offset.to_string()),
                ("timeout", self.poll_timeout_secs.to_string()),
                ("allowed_updates", "[\"message\"]".to_string()),
            ])
            .send()
            .await
            .context("getUpdates request failed")?;

        let body: ApiResponse<Vec<TelegramUpdate>> = response
            .json()
            .await
            .context("invalid getUpdates response")?;

        if !body.ok {
            return Err(anyhow::anyhow!(
                "telegram api error: {}",
                body.description.unwrap_or_default()
            )
            .into());
        }

        Ok(body.result.unwrap_or_default())
    }

    /// Start the long-poll loop, yielding inbound private-message events.
    pub fn start(self: Arc<Self>) -> InboundStream {
        let (tx, rx) = tokio::sync::mpsc::channel(256);

        tokio::spawn(async move {
            let mut offset = 0i64;
            loop {
                match self.get_updates(offset).await {
                    Ok(updates) => {
                        for update in updates {
                            offset = offset.max(update.update_id + 1);

                            let Some(event) = update.into_event() else {
                                continue;
                            };

                            if tx.send(event).await.is_err() {
                                tracing::info!("telegram polling stopped (receiver dropped)");
                                return;
                            }
                        }
                    }
                    Err(error) => {
                        tracing::error!(%error, "telegram polling error, backing off");
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    }
                }
            }
        });

        Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx))
    }
}

impl DeliveryGateway for TelegramGateway {
    async fn send(&self, user_id: &str, text: &str) -> std::result::Result<(), DeliveryError> {
        let chat_id: i64 = user_id.parse().map_err(|_| DeliveryError::Permanent {
            reason: format!("invalid chat id: {user_id}"),
        })?;

        let body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
        });

        let response = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&body)
            .send()
            .await
            .map_err(|error| {
                DeliveryError::Transient(anyhow::anyhow!("sendMessage request failed: {error}"))
            })?;

        let body: ApiResponse<serde_json::Value> = response.json().await.map_err(|error| {
            DeliveryError::Transient(anyhow::anyhow!("invalid sendMessage response: {error}"))
        })?;

        if body.ok {
            return Ok(());
        }

        Err(classify_send_failure(
            body.error_code,
            body.description.unwrap_or_default(),
        ))
    }
}

/// Bot API error codes 400 and 403 (chat not found, bot blocked by the
/// user, deactivated account) mean the recipient can never be reached;
/// everything else is worth retrying on a later event.
fn classify_send_failure(error_code: Option<i64>, description: String) -> DeliveryError {
    match error_code {
        Some(400) | Some(403) => DeliveryError::Permanent {
            reason: description,
        },
        _ => DeliveryError::Transient(anyhow::anyhow!(
            "sendMessage failed ({}): {description}",
            error_code.map_or_else(|| "no code".to_string(), |code| code.to_string())
        )),
    }
}

// --- Bot API wire types ---

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TelegramUpdate {
    update_id: i64,
    message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
struct TelegramMessage {
    from: Option<TelegramUser>,
    chat: TelegramChat,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramUser {
    id: i64,
    is_bot: bool,
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramChat {
    #[serde(rename = "type")]
    chat_type: String,
}

impl TelegramUpdate {
    /// Convert a private, human-sent text message into an inbound event.
    /// Everything else (groups, bots, media-only messages) is dropped.
    fn into_event(self) -> Option<InboundEvent> {
        let message = self.message?;
        let text = message.text?;
        let from = message.from?;

        if from.is_bot || message.chat.chat_type != "private" {
            return None;
        }

        let is_command_start =
            text == "/start" || text.starts_with("/start ") || text.starts_with("/start@");

        Some(InboundEvent {
            user_id: from.id.to_string(),
            text,
            is_command_start,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(chat_type: &str, is_bot: bool, text: &str) -> TelegramUpdate {
        TelegramUpdate {
            update_id: 7,
            message: Some(TelegramMessage {
                from: Some(TelegramUser {
                    id: 42,
                    is_bot,
                    username: Some("someone".to_string()),
                }),
                chat: TelegramChat {
                    chat_type: chat_type.to_string(),
                },
                text: Some(text.to_string()),
            }),
        }
    }

    #[test]
    fn private_text_becomes_an_event() {
        let event = update("private", false, "hello")
            .into_event()
            .expect("private text should produce an event");

        assert_eq!(event.user_id, "42");
        assert_eq!(event.text, "hello");
        assert!(!event.is_command_start);
    }

    #[test]
    fn start_command_is_flagged() {
        assert!(update("private", false, "/start").into_event().unwrap().is_command_start);
        assert!(
            update("private", false, "/start ref123")
                .into_event()
                .unwrap()
                .is_command_start
        );
        assert!(
            update("private", false, "/start@funnelbot")
                .into_event()
                .unwrap()
                .is_command_start
        );
        assert!(!update("private", false, "/started").into_event().unwrap().is_command_start);
    }

    #[test]
    fn group_and_bot_messages_are_dropped() {
        assert!(update("group", false, "hello").into_event().is_none());
        assert!(update("private", true, "hello").into_event().is_none());
    }

    #[test]
    fn failure_classification_by_error_code() {
        assert!(matches!(
            classify_send_failure(Some(403), "bot was blocked by the user".to_string()),
            DeliveryError::Permanent { .. }
        ));
        assert!(matches!(
            classify_send_failure(Some(400), "chat not found".to_string()),
            DeliveryError::Permanent { .. }
        ));
        assert!(matches!(
            classify_send_failure(Some(500), "internal error".to_string()),
            DeliveryError::Transient(_)
        ));
        assert!(matches!(
            classify_send_failure(None, "".to_string()),
            DeliveryError::Transient(_)
        ));
    }
}

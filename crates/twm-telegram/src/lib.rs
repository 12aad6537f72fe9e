//! Telegram adapter (teloxide).
//!
//! Implements the `twm-core` MessagingPort and PairingNotifier over the Telegram
//! Bot API, plus the command router controllers talk to.

use std::time::Duration;

use async_trait::async_trait;

use teloxide::{prelude::*, types::ParseMode, ApiError};

use tokio::time::sleep;

pub mod handlers;
pub mod notifier;
pub mod router;

pub use notifier::PairingCodeRouter;

use twm_core::{
    domain::{ChatId, MessageId, MessageRef},
    errors::Error,
    messaging::{port::MessagingPort, types::MessagingCapabilities},
    Result,
};

const NETWORK_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct TelegramMessenger {
    bot: Bot,
}

impl TelegramMessenger {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    fn tg_chat(chat_id: ChatId) -> teloxide::types::ChatId {
        teloxide::types::ChatId(chat_id.0)
    }

    /// Broadcasts reach users who never started the bot or blocked it; name those.
    fn map_err(e: teloxide::RequestError) -> Error {
        match e {
            teloxide::RequestError::Api(ApiError::BotBlocked) => {
                Error::External("telegram: bot was blocked by the user".to_string())
            }
            teloxide::RequestError::Api(ApiError::ChatNotFound) => {
                Error::External("telegram: chat not found".to_string())
            }
            other => Error::External(format!("telegram error: {other}")),
        }
    }

    /// One retry for flood control (after the server-given delay) and for
    /// transport failures.
    async fn with_retry<T, Fut>(&self, mut op: impl FnMut() -> Fut) -> Result<T>
    where
        Fut: std::future::IntoFuture<Output = std::result::Result<T, teloxide::RequestError>>,
        Fut::IntoFuture: Send,
    {
        let mut retried = false;
        loop {
            let delay = match op().await {
                Ok(v) => return Ok(v),
                Err(teloxide::RequestError::RetryAfter(d)) if !retried => d,
                Err(teloxide::RequestError::Network(e)) if !retried => {
                    tracing::debug!("telegram network error, retrying: {e}");
                    NETWORK_RETRY_DELAY
                }
                Err(other) => return Err(Self::map_err(other)),
            };
            retried = true;
            sleep(delay).await;
        }
    }
}

#[async_trait]
impl MessagingPort for TelegramMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        MessagingCapabilities {
            supports_html: true,
            max_message_len: 4096,
        }
    }

    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef> {
        let msg = self
            .with_retry(|| {
                self.bot
                    .send_message(Self::tg_chat(chat_id), html.to_string())
                    .parse_mode(ParseMode::Html)
            })
            .await?;

        Ok(MessageRef {
            chat_id,
            message_id: MessageId(msg.id.0),
        })
    }
}

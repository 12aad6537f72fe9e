use async_trait::async_trait;

use crate::{
    domain::{ChatId, MessageRef},
    messaging::types::MessagingCapabilities,
    Result,
};

/// Controller-facing messenger port.
#[async_trait]
pub trait MessagingPort: Send + Sync {
    fn capabilities(&self) -> MessagingCapabilities;

    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef>;
}

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, OnceLock},
};

use async_trait::async_trait;

use twm_core::{
    domain::{ChatId, SessionId},
    formatting::escape_html,
    messaging::port::MessagingPort,
    notifier::PairingNotifier,
    tenant::TenantRegistry,
};

/// Sends pairing codes to the chat that asked for the session.
///
/// Chats are remembered by `/add` and `/restart`. Without one the code goes
/// to the session owner's private chat (Telegram user ids double as chat ids).
pub struct PairingCodeRouter {
    messenger: Arc<dyn MessagingPort>,
    routes: Mutex<HashMap<SessionId, ChatId>>,
    registry: OnceLock<Arc<TenantRegistry>>,
}

impl PairingCodeRouter {
    pub fn new(messenger: Arc<dyn MessagingPort>) -> Self {
        Self {
            messenger,
            routes: Mutex::new(HashMap::new()),
            registry: OnceLock::new(),
        }
    }

    /// Enable the owner fallback. Only the first registry attached is kept.
    pub fn attach_registry(&self, registry: Arc<TenantRegistry>) {
        let _ = self.registry.set(registry);
    }

    /// Route future codes for `session_id` to `chat_id`. Returns the route it
    /// replaced so a failed command can put it back with [`Self::restore`].
    pub fn remember(&self, session_id: &SessionId, chat_id: ChatId) -> Option<ChatId> {
        let mut routes = self.routes.lock().unwrap_or_else(|p| p.into_inner());
        routes.insert(session_id.clone(), chat_id)
    }

    pub fn restore(&self, session_id: &SessionId, previous: Option<ChatId>) {
        let mut routes = self.routes.lock().unwrap_or_else(|p| p.into_inner());
        match previous {
            Some(chat_id) => routes.insert(session_id.clone(), chat_id),
            None => routes.remove(session_id),
        };
    }

    pub fn forget(&self, session_id: &SessionId) {
        self.restore(session_id, None);
    }

    #[cfg(test)]
    pub(crate) fn route(&self, session_id: &SessionId) -> Option<ChatId> {
        self.routes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(session_id)
            .copied()
    }

    async fn destination(&self, session_id: &SessionId) -> Option<ChatId> {
        let remembered = self
            .routes
            .lock()
            .ok()
            .and_then(|routes| routes.get(session_id).copied());
        if remembered.is_some() {
            return remembered;
        }
        let registry = self.registry.get()?;
        registry.owner_of(session_id).await.map(|owner| ChatId(owner.0))
    }
}

pub fn pairing_code_message(session_id: &SessionId, code: &str) -> String {
    format!(
        "🔑 Pairing code for <code>{}</code>: <code>{}</code>\n\n\
         Open WhatsApp → Linked devices → Link with phone number and enter the code.",
        escape_html(session_id.as_str()),
        escape_html(code)
    )
}

#[async_trait]
impl PairingNotifier for PairingCodeRouter {
    async fn notify_pairing_code(&self, session_id: &SessionId, code: &str) {
        let Some(chat_id) = self.destination(session_id).await else {
            tracing::error!(session = %session_id, "no chat to deliver the pairing code to");
            return;
        };
        match self
            .messenger
            .send_html(chat_id, &pairing_code_message(session_id, code))
            .await
        {
            Ok(_) => tracing::info!(session = %session_id, chat = chat_id.0, "pairing code delivered"),
            Err(e) => tracing::error!(session = %session_id, "failed to deliver pairing code: {e}"),
        }
    }
}

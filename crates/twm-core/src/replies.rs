//! In-session message handling: stored replies ("list store") and the `!`
//! commands group members use to manage them.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    connection::{
        port::WaConnection,
        types::{IncomingMessage, OutgoingMessage},
    },
    domain::SessionId,
    formatting::{render_list_store, sort_keys_case_insensitive, whatsapp_menu},
    media::ImageHost,
    store::{Session, SessionStore, StoredReply},
    supervisor::MessageHandler,
    utils::local_hour,
    Result,
};

const GROUP_ONLY: &str = "This command can only be used in groups!";
const ADMIN_ONLY: &str = "This command can only be used by group admins!";

/// Split `!cmd rest of text` into a lower-cased command and trimmed argument text.
pub fn parse_bang_command(body: &str) -> Option<(String, String)> {
    let rest = body.trim_start().strip_prefix('!')?;
    let mut parts = rest.splitn(2, char::is_whitespace);
    let cmd = parts.next().unwrap_or("").to_lowercase();
    if cmd.is_empty() {
        return None;
    }
    let text = parts.next().unwrap_or("").trim().to_string();
    Some((cmd, text))
}

pub struct StoredReplyHandler {
    store: Arc<SessionStore>,
    image_host: Arc<dyn ImageHost>,
    bot_name: String,
    bot_author: String,
    timezone_offset_hours: i32,
}

impl StoredReplyHandler {
    pub fn new(
        store: Arc<SessionStore>,
        image_host: Arc<dyn ImageHost>,
        bot_name: impl Into<String>,
        bot_author: impl Into<String>,
        timezone_offset_hours: i32,
    ) -> Self {
        Self {
            store,
            image_host,
            bot_name: bot_name.into(),
            bot_author: bot_author.into(),
            timezone_offset_hours,
        }
    }

    async fn process(&self, session: &Session, conn: &dyn WaConnection, msg: &IncomingMessage) -> Result<()> {
        if msg.is_group {
            self.answer_stored(session, conn, msg).await?;
        }

        let Some((cmd, text)) = parse_bang_command(&msg.body) else {
            return Ok(());
        };
        match cmd.as_str() {
            "addlist" => self.add_list(session, conn, msg, &text).await,
            "dellist" => self.del_list(session, conn, msg, &text).await,
            "liststore" | "list" => self.list_store(session, conn, msg).await,
            "menu" => {
                let menu = whatsapp_menu(&self.bot_name, &self.bot_author, msg.is_group);
                reply(conn, msg, menu).await
            }
            "ping" => reply(conn, msg, "pong").await,
            _ => Ok(()),
        }
    }

    async fn answer_stored(&self, session: &Session, conn: &dyn WaConnection, msg: &IncomingMessage) -> Result<()> {
        let chat = self.store.init_chat(session, &msg.chat_id).await?;
        let user = self.store.init_user(session, &msg.sender).await?;
        if chat.is_banned || user.banned {
            return Ok(());
        }

        let Some(stored) = chat.stored_replies.get(&msg.body.to_uppercase()) else {
            return Ok(());
        };
        let out = match &stored.image {
            Some(url) => OutgoingMessage::Image {
                url: url.clone(),
                caption: stored.text.clone(),
                mentions: msg.mentions.clone(),
            },
            None if !stored.text.is_empty() => OutgoingMessage::Text {
                text: stored.text.clone(),
                mentions: msg.mentions.clone(),
                reply_to: None,
            },
            None => return Ok(()),
        };
        if let Err(e) = conn.send(&msg.chat_id, out).await {
            tracing::error!(session = %session.id(), chat = %msg.chat_id, "failed to send stored reply: {e}");
            conn.send(&msg.chat_id, OutgoingMessage::text("❌ Error sending stored message"))
                .await?;
        }
        Ok(())
    }

    async fn add_list(&self, session: &Session, conn: &dyn WaConnection, msg: &IncomingMessage, text: &str) -> Result<()> {
        if !msg.is_group {
            return reply(conn, msg, GROUP_ONLY).await;
        }
        if !msg.is_admin {
            return reply(conn, msg, ADMIN_ONLY).await;
        }
        let Some(quoted) = &msg.quoted else {
            return reply(conn, msg, "Reply to a message with !addlist <text>").await;
        };
        if text.is_empty() {
            return reply(conn, msg, "*🚩 Example:*\n!addlist Test").await;
        }

        let key = text.to_uppercase();
        let chat = self.store.init_chat(session, &msg.chat_id).await?;
        if chat.stored_replies.contains_key(&key) {
            return reply(conn, msg, format!("'{text}' already exists in List store")).await;
        }

        let quoted_text = quoted.text.clone().unwrap_or_default();
        let entry = match quoted.media.as_ref().filter(|m| m.is_image()) {
            Some(media) => {
                let uploaded = match conn.download_media(media).await {
                    Ok(bytes) => self.image_host.upload(bytes, &media.mime_type).await,
                    Err(e) => Err(e),
                };
                match uploaded {
                    Ok(url) => StoredReply {
                        text: quoted_text,
                        image: Some(url),
                    },
                    Err(e) => {
                        tracing::error!(session = %session.id(), "failed to store image reply: {e}");
                        return reply(conn, msg, "❌ Failed to upload image").await;
                    }
                }
            }
            None => StoredReply {
                text: quoted_text,
                image: None,
            },
        };

        {
            let mut data = session.lock().await;
            data.chats
                .entry(msg.chat_id.clone())
                .or_default()
                .stored_replies
                .insert(key, entry);
        }
        self.store.save(session).await?;
        tracing::info!(session = %session.id(), chat = %msg.chat_id, "stored reply added");
        reply(
            conn,
            msg,
            format!("Successfully added \"{text}\" to List Store.\n\nAccess by typing its name"),
        )
        .await
    }

    async fn del_list(&self, session: &Session, conn: &dyn WaConnection, msg: &IncomingMessage, text: &str) -> Result<()> {
        if !msg.is_group {
            return reply(conn, msg, GROUP_ONLY).await;
        }
        if !msg.is_admin {
            return reply(conn, msg, ADMIN_ONLY).await;
        }
        if text.is_empty() {
            return reply(
                conn,
                msg,
                "*🚩 Example:*\n!dellist <name>\n\nUse !liststore to see available items.",
            )
            .await;
        }

        let removed = {
            let mut data = session.lock().await;
            data.chats
                .get_mut(&msg.chat_id)
                .and_then(|chat| chat.stored_replies.remove(&text.to_uppercase()))
                .is_some()
        };
        if !removed {
            return reply(conn, msg, format!("'{text}' is not registered in the List store")).await;
        }
        self.store.save(session).await?;
        reply(conn, msg, format!("Successfully deleted '{text}' from List Store.")).await
    }

    async fn list_store(&self, session: &Session, conn: &dyn WaConnection, msg: &IncomingMessage) -> Result<()> {
        if !msg.is_group {
            return reply(conn, msg, GROUP_ONLY).await;
        }
        let chat = self.store.init_chat(session, &msg.chat_id).await?;
        let mut keys: Vec<String> = chat.stored_replies.keys().cloned().collect();
        if keys.is_empty() {
            return reply(conn, msg, "No *list store* items in this group.").await;
        }
        sort_keys_case_insensitive(&mut keys);
        let group = msg.group_name.as_deref().unwrap_or("this group");
        let caption = render_list_store(
            msg.sender_number(),
            local_hour(self.timezone_offset_hours),
            group,
            &keys,
        );
        conn.send(
            &msg.chat_id,
            OutgoingMessage::Text {
                text: caption,
                mentions: vec![msg.sender.clone()],
                reply_to: Some(msg.id.clone()),
            },
        )
        .await
    }
}

async fn reply(conn: &dyn WaConnection, msg: &IncomingMessage, text: impl Into<String>) -> Result<()> {
    conn.send(&msg.chat_id, OutgoingMessage::reply(msg, text)).await
}

#[async_trait]
impl MessageHandler for StoredReplyHandler {
    async fn handle(&self, session_id: &SessionId, conn: Arc<dyn WaConnection>, msg: IncomingMessage) {
        if msg.is_from_bot() {
            return;
        }
        let session = match self.store.open(session_id).await {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(session = %session_id, "failed to open session data: {e}");
                return;
            }
        };
        if let Err(e) = self.process(&session, conn.as_ref(), &msg).await {
            tracing::error!(session = %session_id, chat = %msg.chat_id, "failed to handle message: {e}");
        }
    }
}

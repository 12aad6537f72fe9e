//! Telegram update handlers.
//!
//! Every Telegram user may talk to the bot; what they can do is decided by
//! their tenant role inside `twm-core`.

use std::sync::Arc;

use teloxide::{prelude::*, types::Message};

use twm_core::domain::{ChatId, UserId};

use crate::router::AppState;

mod commands;

pub use commands::run_command;

pub async fn handle_message(_bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let Some(text) = msg.text() else {
        return Ok(());
    };
    if !text.starts_with('/') {
        return Ok(());
    }

    let controller = UserId(user.id.0 as i64);
    let chat_id = ChatId(msg.chat.id.0);
    tracing::debug!(user = controller.0, chat = chat_id.0, "command: {text}");

    run_command(&state, controller, chat_id, text).await;
    Ok(())
}

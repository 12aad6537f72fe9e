use std::sync::Arc;

use teloxide::{dispatching::Dispatcher, dptree, prelude::*};

use twm_core::{config::Config, control::ControlService, messaging::port::MessagingPort};

use crate::handlers;
use crate::notifier::PairingCodeRouter;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub control: Arc<ControlService>,
    pub messenger: Arc<dyn MessagingPort>,
    pub pairing: Arc<PairingCodeRouter>,
}

/// Long-poll Telegram until Ctrl-C.
pub async fn run_polling(bot: Bot, state: Arc<AppState>) -> anyhow::Result<()> {
    match bot.get_me().await {
        Ok(me) => tracing::info!("control bot started: @{}", me.username()),
        Err(e) => tracing::warn!("getMe failed: {e}"),
    }
    tracing::info!(owner = state.cfg.owner_id.0, "accepting commands");

    let handler = dptree::entry().branch(Update::filter_message().endpoint(handlers::handle_message));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    tracing::info!("polling stopped");
    Ok(())
}

use std::sync::Arc;

use teloxide::Bot;

use twm_bridge::{BridgeConfig, BridgeConnector};
use twm_catbox::CatboxClient;
use twm_core::{
    config::Config,
    control::Runtime,
    messaging::{
        port::MessagingPort,
        throttled::{ThrottleConfig, ThrottledMessenger},
    },
};
use twm_telegram::{router::AppState, PairingCodeRouter, TelegramMessenger};

#[tokio::main]
async fn main() -> Result<(), twm_core::Error> {
    twm_core::logging::init("twm")?;

    let cfg = Arc::new(Config::load()?);
    let bot = Bot::new(cfg.telegram_bot_token.clone());

    // Pairing codes and broadcasts share Telegram's rate limits with command replies.
    let raw_messenger: Arc<dyn MessagingPort> = Arc::new(TelegramMessenger::new(bot.clone()));
    let messenger: Arc<dyn MessagingPort> = Arc::new(ThrottledMessenger::new(
        raw_messenger,
        ThrottleConfig::default(),
    ));

    let pairing = Arc::new(PairingCodeRouter::new(messenger.clone()));
    let connector = Arc::new(BridgeConnector::new(BridgeConfig::from_config(&cfg)));
    let image_host = Arc::new(CatboxClient::new()?);

    let runtime = Runtime::init(&cfg, connector, pairing.clone(), image_host)?;
    pairing.attach_registry(runtime.registry.clone());

    match runtime.restore_sessions().await {
        Ok(n) if n > 0 => tracing::info!("restored {n} WhatsApp session(s)"),
        Ok(_) => tracing::info!("no stored WhatsApp sessions"),
        Err(e) => tracing::error!("failed to scan stored sessions: {e}"),
    }

    let state = Arc::new(AppState {
        cfg: cfg.clone(),
        control: runtime.control.clone(),
        messenger,
        pairing,
    });

    let polled = twm_telegram::router::run_polling(bot, state).await;
    runtime.teardown().await?;
    polled.map_err(|e| twm_core::Error::External(format!("telegram bot failed: {e}")))?;

    Ok(())
}

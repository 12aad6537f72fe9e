use twm_core::{
    domain::{ChatId, SessionId, UserId},
    errors::ControlError,
    formatting::{escape_html, render_session_list, telegram_menu},
};

use crate::router::AppState;

fn parse_command(text: &str) -> (String, String) {
    // Telegram may send `/cmd@botname arg1 ...`
    let mut parts = text.trim().splitn(2, char::is_whitespace);
    let first = parts.next().unwrap_or("").trim();
    let rest = parts.next().unwrap_or("").trim().to_string();

    let cmd = first
        .trim_start_matches('/')
        .split('@')
        .next()
        .unwrap_or("")
        .to_lowercase();

    (cmd, rest)
}

fn first_arg(rest: &str) -> Option<&str> {
    rest.split_whitespace().next()
}

/// `/setrole <userId> <role>`
fn parse_set_role_args(rest: &str) -> Option<(UserId, &str)> {
    let mut it = rest.split_whitespace();
    let user = it.next()?.parse::<i64>().ok()?;
    let role = it.next()?;
    Some((UserId(user), role))
}

/// `/setlimit <role> <n>`
fn parse_set_limit_args(rest: &str) -> Option<(&str, usize)> {
    let mut it = rest.split_whitespace();
    let role = it.next()?;
    let limit = it.next()?.parse::<usize>().ok()?;
    Some((role, limit))
}

/// Split on line boundaries so every chunk stays under `limit` bytes. A single
/// line longer than the limit is cut at a char boundary.
fn split_lines(html: &str, limit: usize) -> Vec<String> {
    if html.len() <= limit {
        return vec![html.to_string()];
    }

    let mut out = Vec::new();
    let mut chunk = String::new();
    for line in html.split_inclusive('\n') {
        if chunk.len() + line.len() > limit && !chunk.is_empty() {
            out.push(std::mem::take(&mut chunk));
        }
        let mut line = line;
        while line.len() > limit {
            let mut cut = limit;
            while !line.is_char_boundary(cut) {
                cut -= 1;
            }
            out.push(line[..cut].to_string());
            line = &line[cut..];
        }
        chunk.push_str(line);
    }
    if !chunk.trim().is_empty() {
        out.push(chunk);
    }
    out
}

async fn reply(state: &AppState, chat_id: ChatId, html: &str) {
    let limit = state
        .cfg
        .telegram_safe_limit
        .min(state.messenger.capabilities().max_message_len)
        .max(200);
    for chunk in split_lines(html, limit) {
        if let Err(e) = state.messenger.send_html(chat_id, &chunk).await {
            tracing::warn!(chat = chat_id.0, "reply failed: {e}");
        }
    }
}

async fn reply_error(state: &AppState, chat_id: ChatId, err: &ControlError) {
    reply(state, chat_id, &format!("❌ {}", escape_html(&err.to_string()))).await;
}

/// Run one slash command on behalf of `controller` and answer in `chat_id`.
pub async fn run_command(state: &AppState, controller: UserId, chat_id: ChatId, text: &str) {
    let (cmd, rest) = parse_command(text);

    match cmd.as_str() {
        "start" => {
            state.control.tenant(controller).await;
            reply(
                state,
                chat_id,
                "👋 <b>Welcome to the WhatsApp bot manager!</b>\n\n\
                 Use /add 62xxx to link a WhatsApp number, or /menu to see every command.",
            )
            .await;
        }

        "menu" | "help" => {
            let info = state.control.menu(controller).await;
            let html = telegram_menu(info.role, info.owned, info.quota, &state.cfg.bot_author);
            reply(state, chat_id, &html).await;
        }

        "list" => {
            let sessions = state.control.list_sessions(controller).await;
            reply(state, chat_id, &render_session_list(&sessions)).await;
        }

        "add" => {
            let Some(phone) = first_arg(&rest) else {
                reply(state, chat_id, "Format: /add 62xxxxx").await;
                return;
            };
            // Only a controller allowed to add the number may redirect its codes.
            let id = match state.control.check_create(controller, phone).await {
                Ok(id) => id,
                Err(e) => {
                    reply_error(state, chat_id, &e).await;
                    return;
                }
            };

            let previous = state.pairing.remember(&id, chat_id);
            reply(
                state,
                chat_id,
                &format!(
                    "⏳ Preparing WhatsApp bot <code>{}</code>. Please wait for the pairing code.",
                    escape_html(id.as_str())
                ),
            )
            .await;

            match state.control.create_session(controller, id.as_str()).await {
                Ok(id) => {
                    reply(
                        state,
                        chat_id,
                        &format!("✅ WhatsApp bot <code>{}</code> added.", escape_html(id.as_str())),
                    )
                    .await
                }
                Err(e) => {
                    state.pairing.restore(&id, previous);
                    reply_error(state, chat_id, &e).await;
                }
            }
        }

        "restart" => {
            let Some(phone) = first_arg(&rest) else {
                reply(state, chat_id, "Format: /restart 62xxxxx").await;
                return;
            };
            let id = match state.control.authorize(controller, phone).await {
                Ok(id) => id,
                Err(e) => {
                    reply_error(state, chat_id, &e).await;
                    return;
                }
            };

            let previous = state.pairing.remember(&id, chat_id);
            match state.control.restart_session(controller, id.as_str()).await {
                Ok(()) => {
                    reply(
                        state,
                        chat_id,
                        &format!("🔄 WhatsApp bot <code>{}</code> restarted.", escape_html(id.as_str())),
                    )
                    .await
                }
                Err(e) => {
                    state.pairing.restore(&id, previous);
                    reply_error(state, chat_id, &e).await;
                }
            }
        }

        "delete" => {
            let Some(phone) = first_arg(&rest) else {
                reply(state, chat_id, "Format: /delete 62xxxxx").await;
                return;
            };
            match state.control.delete_session(controller, phone).await {
                Ok(()) => {
                    if let Some(id) = SessionId::parse(phone) {
                        state.pairing.forget(&id);
                    }
                    reply(
                        state,
                        chat_id,
                        &format!("🗑️ WhatsApp bot <code>{}</code> deleted.", escape_html(phone)),
                    )
                    .await;
                }
                Err(e) => reply_error(state, chat_id, &e).await,
            }
        }

        "setrole" => {
            let Some((target, role)) = parse_set_role_args(&rest) else {
                reply(state, chat_id, "Format: /setrole &lt;userId&gt; &lt;role&gt;").await;
                return;
            };
            match state.control.set_role(controller, target, role).await {
                Ok(tenant) => {
                    reply(
                        state,
                        chat_id,
                        &format!("✅ User <code>{target}</code> is now <b>{}</b>.", tenant.role),
                    )
                    .await
                }
                Err(e) => reply_error(state, chat_id, &e).await,
            }
        }

        "setlimit" => {
            let Some((role, limit)) = parse_set_limit_args(&rest) else {
                reply(state, chat_id, "Format: /setlimit &lt;role&gt; &lt;limit&gt;").await;
                return;
            };
            match state.control.set_role_limit(controller, role, limit).await {
                Ok(quota) => {
                    reply(
                        state,
                        chat_id,
                        &format!(
                            "✅ Bot limit for <b>{}</b> set to {quota}.",
                            escape_html(&role.to_lowercase())
                        ),
                    )
                    .await
                }
                Err(e) => reply_error(state, chat_id, &e).await,
            }
        }

        "broadcast" => {
            let targets = match state.control.broadcast_targets(controller).await {
                Ok(t) => t,
                Err(e) => {
                    reply_error(state, chat_id, &e).await;
                    return;
                }
            };
            if rest.is_empty() {
                reply(state, chat_id, "Format: /broadcast &lt;message&gt;").await;
                return;
            }

            let html = format!("📢 <b>Broadcast</b>\n\n{}", escape_html(&rest));
            let mut delivered = 0usize;
            for user in &targets {
                match state.messenger.send_html(ChatId(user.0), &html).await {
                    Ok(_) => delivered += 1,
                    Err(e) => tracing::warn!(user = user.0, "broadcast delivery failed: {e}"),
                }
            }
            tracing::info!(delivered, total = targets.len(), "broadcast finished");
            reply(
                state,
                chat_id,
                &format!("📢 Broadcast sent to {delivered}/{} users.", targets.len()),
            )
            .await;
        }

        _ => {
            reply(
                state,
                chat_id,
                "Unknown command. Use /menu to see the available commands.",
            )
            .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::{
        path::Path,
        sync::{Arc, Mutex},
    };

    use async_trait::async_trait;
    use twm_core::{
        config::Config,
        connection::port::{WaConnection, WaConnector},
        control::Runtime,
        domain::{MessageId, MessageRef},
        media::ImageHost,
        messaging::{port::MessagingPort, types::MessagingCapabilities},
        tenant::TenantRegistry,
        Error, Result,
    };

    use crate::notifier::PairingCodeRouter;

    const OWNER: UserId = UserId(1000);

    #[test]
    fn parses_commands_with_bot_suffix() {
        assert_eq!(
            parse_command("/add@twm_bot 6281111"),
            ("add".to_string(), "6281111".to_string())
        );
        assert_eq!(parse_command("/LIST"), ("list".to_string(), String::new()));
        assert_eq!(
            parse_command("/broadcast  hello\nworld "),
            ("broadcast".to_string(), "hello\nworld".to_string())
        );
    }

    #[test]
    fn parses_admin_arguments() {
        assert_eq!(parse_set_role_args("42 vip"), Some((UserId(42), "vip")));
        assert_eq!(parse_set_role_args("vip 42"), None);
        assert_eq!(parse_set_role_args("42"), None);

        assert_eq!(parse_set_limit_args("premium 4"), Some(("premium", 4)));
        assert_eq!(parse_set_limit_args("premium -1"), None);
        assert_eq!(parse_set_limit_args(""), None);

        assert_eq!(first_arg("  6281111 extra"), Some("6281111"));
        assert_eq!(first_arg("   "), None);
    }

    #[test]
    fn splits_on_lines_under_the_limit() {
        let html = "aaaa\nbbbb\ncccc\n";
        assert_eq!(split_lines(html, 100), vec![html.to_string()]);

        let chunks = split_lines(html, 10);
        assert_eq!(chunks, vec!["aaaa\nbbbb\n".to_string(), "cccc\n".to_string()]);

        let chunks = split_lines("ééééé", 4);
        assert!(chunks.iter().all(|c| c.len() <= 4));
        assert_eq!(chunks.concat(), "ééééé");
    }

    #[derive(Default)]
    struct RecordingMessenger {
        sent: Mutex<Vec<(ChatId, String)>>,
    }

    impl RecordingMessenger {
        fn texts_to(&self, chat: ChatId) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(c, _)| *c == chat)
                .map(|(_, t)| t.clone())
                .collect()
        }
    }

    #[async_trait]
    impl MessagingPort for RecordingMessenger {
        fn capabilities(&self) -> MessagingCapabilities {
            MessagingCapabilities {
                supports_html: true,
                max_message_len: 4096,
            }
        }

        async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef> {
            self.sent.lock().unwrap().push((chat_id, html.to_string()));
            Ok(MessageRef {
                chat_id,
                message_id: MessageId(1),
            })
        }
    }

    struct Unreachable;

    #[async_trait]
    impl WaConnector for Unreachable {
        async fn connect(&self, _id: &SessionId, _auth_dir: &Path) -> Result<Arc<dyn WaConnection>> {
            Err(Error::External("sidecar unavailable".to_string()))
        }
    }

    struct NoImageHost;

    #[async_trait]
    impl ImageHost for NoImageHost {
        async fn upload(&self, _bytes: Vec<u8>, _mime_type: &str) -> Result<String> {
            Err(Error::External("disabled".to_string()))
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        state: AppState,
        messenger: Arc<RecordingMessenger>,
        pairing: Arc<PairingCodeRouter>,
        registry: Arc<TenantRegistry>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::for_root(dir.path(), OWNER);
        let messenger = Arc::new(RecordingMessenger::default());
        let pairing = Arc::new(PairingCodeRouter::new(messenger.clone()));
        let runtime = Runtime::init(
            &cfg,
            Arc::new(Unreachable),
            pairing.clone(),
            Arc::new(NoImageHost),
        )
        .unwrap();
        pairing.attach_registry(runtime.registry.clone());
        Fixture {
            _dir: dir,
            state: AppState {
                cfg: Arc::new(cfg),
                control: runtime.control.clone(),
                messenger: messenger.clone(),
                pairing: pairing.clone(),
            },
            messenger,
            pairing,
            registry: runtime.registry.clone(),
        }
    }

    #[tokio::test]
    async fn menu_shows_developer_section_only_to_developers() {
        let f = fixture();
        run_command(&f.state, OWNER, ChatId(1000), "/menu").await;
        run_command(&f.state, UserId(5), ChatId(5), "/menu").await;

        let owner = f.messenger.texts_to(ChatId(1000)).concat();
        assert!(owner.contains("Developer Commands"));
        assert!(owner.contains("Bots: 0/∞"));

        let user = f.messenger.texts_to(ChatId(5)).concat();
        assert!(!user.contains("Developer Commands"));
        assert!(user.contains("Role: free"));
        assert!(user.contains("Bots: 0/1"));
    }

    #[tokio::test]
    async fn add_validates_and_reports_failures() {
        let f = fixture();
        run_command(&f.state, UserId(5), ChatId(5), "/add").await;
        run_command(&f.state, UserId(5), ChatId(5), "/add 62-abc").await;
        run_command(&f.state, UserId(5), ChatId(5), "/add 6281111").await;

        let texts = f.messenger.texts_to(ChatId(5));
        assert_eq!(texts[0], "Format: /add 62xxxxx");
        assert!(texts[1].contains("Invalid phone number format"));
        assert!(texts[2].contains("Preparing WhatsApp bot <code>6281111</code>"));
        assert!(texts[3].starts_with("❌ Failed to create WhatsApp bot"));

        run_command(&f.state, UserId(5), ChatId(5), "/list").await;
        let texts = f.messenger.texts_to(ChatId(5));
        assert!(texts[4].contains("You don't have any WhatsApp bots yet"));
    }

    #[tokio::test]
    async fn pairing_route_survives_foreign_and_failed_commands() {
        let f = fixture();
        let id = SessionId::parse("6281111").unwrap();
        f.registry.add_owned_session(UserId(5), &id).await.unwrap();
        f.pairing.remember(&id, ChatId(-55));

        run_command(&f.state, UserId(6), ChatId(6), "/add 6281111").await;
        run_command(&f.state, UserId(6), ChatId(6), "/restart 6281111").await;
        for text in f.messenger.texts_to(ChatId(6)) {
            assert_eq!(text, "❌ You are not allowed to do that");
        }
        assert_eq!(f.pairing.route(&id), Some(ChatId(-55)));

        // The owner's own attempts fail here too and hand the route back.
        run_command(&f.state, UserId(5), ChatId(7), "/restart 6281111").await;
        assert_eq!(f.pairing.route(&id), Some(ChatId(-55)));
        run_command(&f.state, UserId(5), ChatId(7), "/add 6281111").await;
        assert_eq!(f.pairing.route(&id), Some(ChatId(-55)));
        assert!(f.messenger.texts_to(ChatId(7)).last().unwrap().starts_with("❌"));
        assert_eq!(f.registry.owner_of(&id).await, Some(UserId(5)));
    }

    #[tokio::test]
    async fn admin_commands_need_a_developer() {
        let f = fixture();
        run_command(&f.state, UserId(5), ChatId(5), "/setrole 6 vip").await;
        run_command(&f.state, UserId(5), ChatId(5), "/setlimit vip 9").await;
        run_command(&f.state, UserId(5), ChatId(5), "/broadcast hi").await;
        for text in f.messenger.texts_to(ChatId(5)) {
            assert_eq!(text, "❌ You are not allowed to do that");
        }

        run_command(&f.state, OWNER, ChatId(1000), "/setrole 5 vip").await;
        run_command(&f.state, OWNER, ChatId(1000), "/setlimit VIP 9").await;
        run_command(&f.state, OWNER, ChatId(1000), "/setlimit developer 9").await;
        let texts = f.messenger.texts_to(ChatId(1000));
        assert_eq!(texts[0], "✅ User <code>5</code> is now <b>vip</b>.");
        assert_eq!(texts[1], "✅ Bot limit for <b>vip</b> set to 9.");
        assert_eq!(texts[2], "❌ That role cannot be changed");
    }

    #[tokio::test]
    async fn broadcast_reaches_every_tenant() {
        let f = fixture();
        run_command(&f.state, UserId(5), ChatId(5), "/start").await;
        run_command(&f.state, UserId(6), ChatId(6), "/start").await;
        run_command(&f.state, OWNER, ChatId(1000), "/broadcast maintenance <tonight>").await;

        for chat in [ChatId(5), ChatId(6)] {
            let texts = f.messenger.texts_to(chat);
            assert_eq!(
                texts.last().unwrap(),
                "📢 <b>Broadcast</b>\n\nmaintenance &lt;tonight&gt;"
            );
        }
        let owner = f.messenger.texts_to(ChatId(1000));
        assert!(owner.last().unwrap().starts_with("📢 Broadcast sent to "));
    }

    #[tokio::test]
    async fn unknown_sessions_and_commands() {
        let f = fixture();
        run_command(&f.state, UserId(5), ChatId(5), "/delete 6289999").await;
        run_command(&f.state, UserId(5), ChatId(5), "/restart 6289999").await;
        run_command(&f.state, UserId(5), ChatId(5), "/frobnicate").await;

        let texts = f.messenger.texts_to(ChatId(5));
        assert_eq!(texts[0], "❌ Bot 6289999 not found");
        assert_eq!(texts[1], "❌ Bot 6289999 not found");
        assert!(texts[2].starts_with("Unknown command"));
    }
}

//! Text rendering for both surfaces: Telegram HTML for controllers and
//! WhatsApp markup for group members.

use crate::{control::SessionSummary, tenant::Quota, tenant::Role};

/// Escape HTML special characters for Telegram HTML parse mode.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Time-of-day greeting for a local hour (0-23).
pub fn greeting(hour: u32) -> &'static str {
    match hour {
        0..=3 => "Good Night",
        4..=10 => "Good Morning",
        11..=14 => "Good Afternoon",
        15..=17 => "Good Evening",
        _ => "Good Night",
    }
}

/// Sort stored-reply keys the way members expect to read them (case-insensitive).
pub fn sort_keys_case_insensitive(keys: &mut [String]) {
    keys.sort_by(|a, b| {
        a.to_lowercase()
            .cmp(&b.to_lowercase())
            .then_with(|| a.cmp(b))
    });
}

/// The `!liststore` reply. `keys` must already be sorted.
pub fn render_list_store(sender_number: &str, hour: u32, group_name: &str, keys: &[String]) -> String {
    let mut out = format!("「 Hello 」@{sender_number} ^_^\n");
    out.push_str(&format!("*{} 🌸*\n\n", greeting(hour)));
    out.push_str(&format!("🚩 List Store *{group_name}*\n┏────✧\n"));
    for (i, key) in keys.iter().enumerate() {
        out.push_str(&format!("│ {}. *{key}*\n", i + 1));
    }
    out.push_str("┗──────✧");
    out
}

/// The `!menu` reply inside a WhatsApp chat.
pub fn whatsapp_menu(bot_name: &str, author: &str, is_group: bool) -> String {
    let group_section = if is_group {
        "│ 📝 !addlist - Add item to list store\n\
         │ 🗑️ !dellist - Delete item from list store\n\
         │ 📋 !list - Show all items in list store"
    } else {
        "│ ⚠️ Only available in groups"
    };
    format!(
        "╭─「 *{bot_name}* 」\n\
         │\n\
         │ 👋 *Welcome to WhatsApp Bot*\n\
         │\n\
         ├─「 Main Menu 」\n\
         │ ⭐ !menu - Show this menu\n\
         │ 💫 !ping - Test bot response\n\
         │\n\
         ├─「 Group Menu 」\n\
         {group_section}\n\
         │\n\
         ├─「 Bot Info 」\n\
         │ 🤖 Name: {bot_name}\n\
         │ 👨‍💻 Developer: {author}\n\
         ╰────"
    )
}

/// The Telegram `/menu` text (HTML).
pub fn telegram_menu(role: Role, owned: usize, quota: Quota, author: &str) -> String {
    let mut out = String::new();
    out.push_str("🤖 <b>Bot Management Commands</b>\n\n");
    out.push_str("📱 <b>Basic Commands</b>\n");
    out.push_str("• /start - Start the bot\n");
    out.push_str("• /menu - Show this menu\n");
    out.push_str("• /list - List all your WhatsApp bots\n");
    out.push_str("• /add - Add new WhatsApp bot\n");
    out.push_str("• /restart - Restart a WhatsApp bot\n");
    out.push_str("• /delete - Delete a WhatsApp bot\n\n");
    out.push_str("ℹ️ <b>Your Account Info</b>\n");
    out.push_str(&format!("• Role: {}\n", role.as_str()));
    out.push_str(&format!("• Bots: {owned}/{quota}\n\n"));
    if role == Role::Developer {
        out.push_str("👨‍💻 <b>Developer Commands</b>\n");
        out.push_str("• /setrole - Set user role\n");
        out.push_str("• /setlimit - Set role bot limit\n");
        out.push_str("• /broadcast - Send message to all users\n\n");
    }
    out.push_str("📖 <b>Usage Examples</b>\n");
    out.push_str("• Add bot: /add 62xxx\n");
    out.push_str("• Restart bot: /restart 62xxx\n");
    out.push_str("• Delete bot: /delete 62xxx\n\n");
    out.push_str(&format!("Need help? Contact @{}", escape_html(author)));
    out
}

/// The Telegram `/list` text (HTML). Owners are shown when present.
pub fn render_session_list(sessions: &[SessionSummary]) -> String {
    if sessions.is_empty() {
        return "You don't have any WhatsApp bots yet. Use /add 62xxx to add one.".to_string();
    }
    let mut out = String::from("📱 <b>WhatsApp Bots</b>\n\n");
    for (i, s) in sessions.iter().enumerate() {
        out.push_str(&format!(
            "{}. <code>{}</code> - {}",
            i + 1,
            s.session_id,
            status_badge(s.status)
        ));
        if let Some(owner) = s.owner {
            out.push_str(&format!(" (owner <code>{owner}</code>)"));
        }
        out.push('\n');
    }
    out
}

fn status_badge(status: &str) -> String {
    let icon = match status {
        "open" => "🟢",
        "connecting" | "pairing" | "uninitialized" => "🟡",
        "closed" => "🔴",
        _ => "⚪",
    };
    format!("{icon} {status}")
}

use std::{
    env,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{domain::UserId, errors::Error, Result};

/// Which reconnect policy the supervisor uses for recoverable disconnects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconnectMode {
    /// Reconnect immediately, forever.
    Immediate,
    /// Exponential backoff with an optional attempt ceiling.
    Backoff,
}

/// Typed configuration, read from the environment (and an optional `.env`).
#[derive(Clone, Debug)]
pub struct Config {
    // Control bot
    pub telegram_bot_token: String,
    pub owner_id: UserId,
    pub telegram_safe_limit: usize,

    // Storage roots
    pub data_dir: PathBuf,
    pub sessions_dir: PathBuf,

    // WhatsApp sidecar
    pub bridge_command: PathBuf,
    pub bridge_args: Vec<String>,
    pub pairing_timeout: Duration,

    // Reconnect policy
    pub reconnect_mode: ReconnectMode,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    /// 0 = unlimited.
    pub reconnect_max_attempts: u32,

    // WhatsApp-side presentation
    pub bot_name: String,
    pub bot_author: String,
    pub timezone_offset_hours: i32,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let telegram_bot_token = env_str("TELEGRAM_BOT_TOKEN").unwrap_or_default();
        if telegram_bot_token.trim().is_empty() {
            return Err(Error::Config(
                "TELEGRAM_BOT_TOKEN environment variable is required".to_string(),
            ));
        }

        let owner_id = env_str("OWNER_ID")
            .and_then(|s| s.trim().parse::<i64>().ok())
            .map(UserId)
            .ok_or_else(|| {
                Error::Config("OWNER_ID environment variable is required (numeric)".to_string())
            })?;

        let data_dir = env_path("DATA_DIR").unwrap_or_else(|| PathBuf::from("databases"));
        let sessions_dir = env_path("SESSIONS_DIR").unwrap_or_else(|| PathBuf::from("sessions"));
        fs::create_dir_all(&data_dir)?;
        fs::create_dir_all(&sessions_dir)?;

        let bridge_command = env_path("BRIDGE_COMMAND").unwrap_or_else(|| PathBuf::from("node"));
        let bridge_args = parse_args(env_str("BRIDGE_ARGS"))
            .unwrap_or_else(|| vec!["bridge/index.js".to_string()]);
        let pairing_timeout =
            Duration::from_millis(env_u64("PAIRING_TIMEOUT_MS").unwrap_or(60_000));

        let reconnect_mode = match env_str("RECONNECT_POLICY")
            .map(|s| s.trim().to_lowercase())
            .as_deref()
        {
            None | Some("") | Some("immediate") => ReconnectMode::Immediate,
            Some("backoff") => ReconnectMode::Backoff,
            Some(other) => {
                return Err(Error::Config(format!(
                    "RECONNECT_POLICY must be 'immediate' or 'backoff', got '{other}'"
                )))
            }
        };
        let reconnect_base = Duration::from_millis(env_u64("RECONNECT_BASE_MS").unwrap_or(1_000));
        let reconnect_max = Duration::from_millis(env_u64("RECONNECT_MAX_MS").unwrap_or(60_000));
        let reconnect_max_attempts = env_u32("RECONNECT_MAX_ATTEMPTS").unwrap_or(0);

        let bot_name = env_str("BOT_NAME")
            .and_then(non_empty)
            .unwrap_or_else(|| "WhatsApp Bot".to_string());
        let bot_author = env_str("BOT_AUTHOR")
            .and_then(non_empty)
            .unwrap_or_else(|| "admin".to_string());
        let timezone_offset_hours = env_str("TIMEZONE_OFFSET_HOURS")
            .and_then(|s| s.trim().parse::<i32>().ok())
            .filter(|h| (-12..=14).contains(h))
            .unwrap_or(7);

        let telegram_safe_limit = env_usize("TELEGRAM_SAFE_LIMIT").unwrap_or(4000);

        Ok(Self {
            telegram_bot_token,
            owner_id,
            telegram_safe_limit,
            data_dir,
            sessions_dir,
            bridge_command,
            bridge_args,
            pairing_timeout,
            reconnect_mode,
            reconnect_base,
            reconnect_max,
            reconnect_max_attempts,
            bot_name,
            bot_author,
            timezone_offset_hours,
        })
    }

    /// Registry document path (`{users:{}, settings:{roles:{...}}}`).
    pub fn registry_file(&self) -> PathBuf {
        self.data_dir.join("telegram").join("database.json")
    }

    /// Minimal config rooted at `root`; used by tests and embedders.
    pub fn for_root(root: &Path, owner_id: UserId) -> Self {
        Self {
            telegram_bot_token: String::new(),
            owner_id,
            telegram_safe_limit: 4000,
            data_dir: root.join("databases"),
            sessions_dir: root.join("sessions"),
            bridge_command: PathBuf::from("node"),
            bridge_args: vec!["bridge/index.js".to_string()],
            pairing_timeout: Duration::from_secs(5),
            reconnect_mode: ReconnectMode::Immediate,
            reconnect_base: Duration::from_millis(1_000),
            reconnect_max: Duration::from_millis(60_000),
            reconnect_max_attempts: 0,
            bot_name: "WhatsApp Bot".to_string(),
            bot_author: "admin".to_string(),
            timezone_offset_hours: 7,
        }
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse::<u32>().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|s| s.trim().parse::<usize>().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn parse_args(v: Option<String>) -> Option<Vec<String>> {
    let out = v?
        .split_whitespace()
        .map(|s| s.to_string())
        .collect::<Vec<_>>();
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_args_splits_on_whitespace() {
        assert_eq!(
            parse_args(Some("bridge/index.js  --quiet".to_string())),
            Some(vec!["bridge/index.js".to_string(), "--quiet".to_string()])
        );
        assert_eq!(parse_args(Some("   ".to_string())), None);
        assert_eq!(parse_args(None), None);
    }

    #[test]
    fn for_root_places_storage_under_root() {
        let cfg = Config::for_root(Path::new("/srv/twm"), UserId(7));
        assert_eq!(cfg.data_dir, PathBuf::from("/srv/twm/databases"));
        assert_eq!(cfg.sessions_dir, PathBuf::from("/srv/twm/sessions"));
        assert_eq!(
            cfg.registry_file(),
            PathBuf::from("/srv/twm/databases/telegram/database.json")
        );
        assert_eq!(cfg.reconnect_mode, ReconnectMode::Immediate);
    }
}

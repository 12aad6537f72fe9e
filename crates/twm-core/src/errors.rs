use std::path::PathBuf;

/// Core error type.
///
/// Adapter crates map their specific errors into this type so the core can handle
/// failures consistently (log + status change vs user-facing message).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid path: {path}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },

    #[error("persistence error: {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("external error: {0}")]
    External(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Controller-facing failure categories.
///
/// `Display` is the human-readable text the control surface shows verbatim.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    #[error("You have reached your bot limit ({limit}). Upgrade your role to add more bots.")]
    QuotaExceeded { limit: String },

    #[error("Invalid phone number format. Use digits only, e.g. 62xxxxx")]
    InvalidPhoneFormat,

    #[error("Failed to create WhatsApp bot: {0}")]
    CreationFailed(String),

    #[error("You are not allowed to do that")]
    Unauthorized,

    #[error("That role cannot be changed")]
    ImmutableRole,

    #[error("Invalid role: {0}")]
    InvalidRole(String),

    #[error("Bot {0} not found")]
    NotFound(String),

    #[error("Something went wrong: {0}")]
    Internal(String),
}

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Why a connection closed. Status codes follow the protocol library's
/// disconnect table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    BadSession,
    ConnectionClosed,
    ConnectionLost,
    ConnectionReplaced,
    LoggedOut,
    RestartRequired,
    TimedOut,
    Unknown(u16),
}

impl DisconnectReason {
    /// Map a status code. 408 is shared by "connection lost" and "timed out";
    /// the code alone resolves to `ConnectionLost`.
    pub fn from_status_code(code: u16) -> Self {
        match code {
            500 => DisconnectReason::BadSession,
            428 => DisconnectReason::ConnectionClosed,
            408 => DisconnectReason::ConnectionLost,
            440 => DisconnectReason::ConnectionReplaced,
            401 => DisconnectReason::LoggedOut,
            515 => DisconnectReason::RestartRequired,
            other => DisconnectReason::Unknown(other),
        }
    }

    /// Map a reason name (`badSession`, `timedOut`, ...), case-insensitively.
    pub fn from_name(name: &str) -> Option<Self> {
        let r = match name.trim().to_ascii_lowercase().as_str() {
            "badsession" => DisconnectReason::BadSession,
            "connectionclosed" => DisconnectReason::ConnectionClosed,
            "connectionlost" => DisconnectReason::ConnectionLost,
            "connectionreplaced" => DisconnectReason::ConnectionReplaced,
            "loggedout" => DisconnectReason::LoggedOut,
            "restartrequired" => DisconnectReason::RestartRequired,
            "timedout" => DisconnectReason::TimedOut,
            _ => return None,
        };
        Some(r)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DisconnectReason::BadSession => "badSession",
            DisconnectReason::ConnectionClosed => "connectionClosed",
            DisconnectReason::ConnectionLost => "connectionLost",
            DisconnectReason::ConnectionReplaced => "connectionReplaced",
            DisconnectReason::LoggedOut => "loggedOut",
            DisconnectReason::RestartRequired => "restartRequired",
            DisconnectReason::TimedOut => "timedOut",
            DisconnectReason::Unknown(_) => "unknown",
        }
    }
}

/// `connection.update` payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionUpdate {
    Connecting,
    Open,
    Close(DisconnectReason),
}

/// Media attached to a (quoted) message; `handle` is adapter-specific.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub handle: String,
    pub mime_type: String,
    #[serde(default)]
    pub seconds: Option<u32>,
}

impl MediaRef {
    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotedMessage {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub media: Option<MediaRef>,
}

/// A message received by a session, already normalized by the adapter.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub id: String,
    pub chat_id: String,
    pub sender: String,
    #[serde(default)]
    pub push_name: Option<String>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub from_me: bool,
    #[serde(default)]
    pub group_name: Option<String>,
    #[serde(default)]
    pub mentions: Vec<String>,
    #[serde(default)]
    pub quoted: Option<QuotedMessage>,
}

impl IncomingMessage {
    /// Messages sent by a bot session carry a `BAE5` id prefix.
    pub fn is_from_bot(&self) -> bool {
        self.from_me || self.id.starts_with("BAE5")
    }

    /// Sender number without the `@server` suffix.
    pub fn sender_number(&self) -> &str {
        self.sender.split('@').next().unwrap_or(&self.sender)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutgoingMessage {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        mentions: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<String>,
    },
    Image {
        url: String,
        caption: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        mentions: Vec<String>,
    },
}

impl OutgoingMessage {
    pub fn text(text: impl Into<String>) -> Self {
        OutgoingMessage::Text {
            text: text.into(),
            mentions: Vec::new(),
            reply_to: None,
        }
    }

    /// A text message quoting `msg`.
    pub fn reply(msg: &IncomingMessage, text: impl Into<String>) -> Self {
        OutgoingMessage::Text {
            text: text.into(),
            mentions: Vec::new(),
            reply_to: Some(msg.id.clone()),
        }
    }
}

/// Events a live connection emits, in arrival order.
#[derive(Clone, Debug, PartialEq)]
pub enum ConnectionEvent {
    Connection(ConnectionUpdate),
    /// Updated opaque credentials; must be persisted before anything else.
    CredsUpdate(serde_json::Value),
    Message(IncomingMessage),
}

/// The per-connection event subscription.
pub type EventStream = mpsc::UnboundedReceiver<ConnectionEvent>;
pub type EventSink = mpsc::UnboundedSender<ConnectionEvent>;

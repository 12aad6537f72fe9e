//! Line protocol spoken with the sidecar: one JSON object per line in each
//! direction. The sidecar tags its frames with `type`, requests carry an `op`
//! and an `id` that the matching `response` echoes.

use serde::{Deserialize, Serialize};
use twm_core::connection::types::{
    ConnectionUpdate, DisconnectReason, IncomingMessage, MediaRef, OutgoingMessage,
};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    /// First frame after spawn.
    Hello {
        #[serde(default)]
        registered: bool,
    },
    /// The library can now issue a pairing code.
    PairingReady {},
    /// Same meaning as `pairing_ready`; emitted by sidecars that only forward QR updates.
    Qr {
        #[serde(default)]
        qr: Option<String>,
    },
    Connection {
        state: String,
        #[serde(default)]
        status_code: Option<u16>,
        #[serde(default)]
        reason: Option<String>,
    },
    Creds {
        creds: serde_json::Value,
    },
    Message {
        message: IncomingMessage,
    },
    Response {
        id: u64,
        #[serde(default)]
        ok: bool,
        #[serde(default)]
        result: serde_json::Value,
        #[serde(default)]
        error: Option<String>,
    },
    Log {
        #[serde(default)]
        level: Option<String>,
        #[serde(default)]
        message: String,
    },
}

/// Map a `connection` frame. The reason name wins over the status code since
/// both `connectionLost` and `timedOut` share 408.
pub fn connection_update(
    state: &str,
    status_code: Option<u16>,
    reason: Option<&str>,
) -> Option<ConnectionUpdate> {
    match state {
        "connecting" => Some(ConnectionUpdate::Connecting),
        "open" => Some(ConnectionUpdate::Open),
        "close" => {
            let reason = reason
                .and_then(DisconnectReason::from_name)
                .or_else(|| status_code.map(DisconnectReason::from_status_code))
                .unwrap_or(DisconnectReason::Unknown(0));
            Some(ConnectionUpdate::Close(reason))
        }
        _ => None,
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request<'a> {
    RequestPairingCode { id: u64, phone: &'a str },
    Send {
        id: u64,
        chat_id: &'a str,
        message: &'a OutgoingMessage,
    },
    DownloadMedia { id: u64, media: &'a MediaRef },
    Logout { id: u64 },
}

impl Request<'_> {
    pub fn id(&self) -> u64 {
        match self {
            Request::RequestPairingCode { id, .. }
            | Request::Send { id, .. }
            | Request::DownloadMedia { id, .. }
            | Request::Logout { id } => *id,
        }
    }

    pub fn op(&self) -> &'static str {
        match self {
            Request::RequestPairingCode { .. } => "request_pairing_code",
            Request::Send { .. } => "send",
            Request::DownloadMedia { .. } => "download_media",
            Request::Logout { .. } => "logout",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hello_and_pairing_frames() {
        let f: InboundFrame = serde_json::from_str(r#"{"type":"hello","registered":true}"#).unwrap();
        assert!(matches!(f, InboundFrame::Hello { registered: true }));

        let f: InboundFrame = serde_json::from_str(r#"{"type":"pairing_ready"}"#).unwrap();
        assert!(matches!(f, InboundFrame::PairingReady {}));

        let f: InboundFrame = serde_json::from_str(r#"{"type":"qr","qr":"2@abc"}"#).unwrap();
        assert!(matches!(f, InboundFrame::Qr { qr: Some(_) }));
    }

    #[test]
    fn parses_message_frames_with_defaults() {
        let f: InboundFrame = serde_json::from_str(
            r#"{"type":"message","message":{"id":"3EB0","chat_id":"1@g.us","sender":"62@s.whatsapp.net","body":"PROMO","is_group":true}}"#,
        )
        .unwrap();
        let InboundFrame::Message { message } = f else {
            panic!("expected message frame");
        };
        assert_eq!(message.body, "PROMO");
        assert!(message.is_group);
        assert!(!message.is_admin);
        assert!(message.quoted.is_none());
    }

    #[test]
    fn close_reason_prefers_name_over_code() {
        assert_eq!(
            connection_update("close", Some(408), Some("timedOut")),
            Some(ConnectionUpdate::Close(DisconnectReason::TimedOut))
        );
        assert_eq!(
            connection_update("close", Some(408), None),
            Some(ConnectionUpdate::Close(DisconnectReason::ConnectionLost))
        );
        assert_eq!(
            connection_update("close", Some(401), Some("bogus")),
            Some(ConnectionUpdate::Close(DisconnectReason::LoggedOut))
        );
        assert_eq!(
            connection_update("close", None, None),
            Some(ConnectionUpdate::Close(DisconnectReason::Unknown(0)))
        );
        assert_eq!(connection_update("open", None, None), Some(ConnectionUpdate::Open));
        assert_eq!(connection_update("weird", None, None), None);
    }

    #[test]
    fn requests_put_op_and_id_first() {
        let msg = OutgoingMessage::text("hi");
        let line = serde_json::to_string(&Request::Send {
            id: 7,
            chat_id: "1@g.us",
            message: &msg,
        })
        .unwrap();
        assert_eq!(
            line,
            r#"{"op":"send","id":7,"chat_id":"1@g.us","message":{"kind":"text","text":"hi"}}"#
        );
    }

    #[test]
    fn every_request_serializes_its_op_tag() {
        let media = MediaRef {
            handle: "m1".to_string(),
            mime_type: "image/jpeg".to_string(),
            seconds: None,
        };
        let msg = OutgoingMessage::text("hi");
        let requests = [
            Request::RequestPairingCode { id: 1, phone: "6281111" },
            Request::Send {
                id: 2,
                chat_id: "1@g.us",
                message: &msg,
            },
            Request::DownloadMedia { id: 3, media: &media },
            Request::Logout { id: 4 },
        ];
        for req in &requests {
            let v = serde_json::to_value(req).unwrap();
            assert_eq!(v["op"], req.op());
            assert_eq!(v["id"], req.id());
        }
        let v = serde_json::to_value(&requests[0]).unwrap();
        assert_eq!(v["phone"], "6281111");
    }

    #[test]
    fn parses_response_and_log_frames() {
        let f: InboundFrame =
            serde_json::from_str(r#"{"type":"response","id":3,"ok":false,"error":"boom"}"#).unwrap();
        let InboundFrame::Response { id, ok, error, result } = f else {
            panic!("expected response frame");
        };
        assert_eq!((id, ok, error.as_deref()), (3, false, Some("boom")));
        assert!(result.is_null());

        let f: InboundFrame = serde_json::from_str(r#"{"type":"log","message":"hi"}"#).unwrap();
        assert!(matches!(f, InboundFrame::Log { level: None, .. }));
    }
}

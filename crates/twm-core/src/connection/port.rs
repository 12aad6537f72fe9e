use std::{path::Path, sync::Arc};

use async_trait::async_trait;

use crate::{
    connection::types::{EventStream, MediaRef, OutgoingMessage},
    domain::SessionId,
    Result,
};

/// One live WhatsApp connection.
///
/// The handle is considered dead once [`WaConnection::logout`] or
/// [`WaConnection::close`] has been called, even if the underlying library
/// winds down asynchronously.
#[async_trait]
pub trait WaConnection: Send + Sync {
    /// Whether the credentials this connection started with are already paired.
    fn is_registered(&self) -> bool;

    /// Whether the connection currently reports itself open.
    fn is_connected(&self) -> bool;

    /// Take the event subscription. Returns `None` after the first call.
    fn subscribe(&self) -> Option<EventStream>;

    /// Resolve once the library is ready to issue a pairing code.
    async fn wait_pairing_ready(&self) -> Result<()>;

    async fn request_pairing_code(&self, phone_number: &str) -> Result<String>;

    async fn send(&self, chat_id: &str, message: OutgoingMessage) -> Result<()>;

    async fn download_media(&self, media: &MediaRef) -> Result<Vec<u8>>;

    /// Unlink the device and stop the connection.
    async fn logout(&self) -> Result<()>;

    /// Stop the connection, keeping the device linked.
    async fn close(&self) -> Result<()>;
}

/// Factory for live connections.
#[async_trait]
pub trait WaConnector: Send + Sync {
    /// Open a connection for `session_id` whose library-managed auth material lives
    /// in `auth_dir`.
    async fn connect(&self, session_id: &SessionId, auth_dir: &Path)
        -> Result<Arc<dyn WaConnection>>;
}

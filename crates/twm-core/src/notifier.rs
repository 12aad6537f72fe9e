use async_trait::async_trait;

use crate::domain::SessionId;

/// Delivers pairing codes to whoever controls the session.
///
/// Fire-and-forget: invoked once per pairing attempt, failures are the
/// implementation's to log.
#[async_trait]
pub trait PairingNotifier: Send + Sync {
    async fn notify_pairing_code(&self, session_id: &SessionId, code: &str);
}

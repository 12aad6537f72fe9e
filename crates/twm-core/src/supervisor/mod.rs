//! Connection supervisor: one live WhatsApp connection per session id.
//!
//! A started session gets a driver task that consumes the connection's event
//! subscription in arrival order. Recoverable closes run the start procedure
//! again for the same id (subject to the [`ReconnectPolicy`]); fatal closes end
//! the driver. Cancelling a session's token drops the subscription, so no event
//! is processed after teardown.

pub mod policy;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::{
    connection::{
        port::{WaConnection, WaConnector},
        types::{ConnectionEvent, ConnectionUpdate, DisconnectReason, EventStream, IncomingMessage},
    },
    domain::SessionId,
    errors::Error,
    notifier::PairingNotifier,
    status::{ConnectionState, StatusTracker},
    store::SessionStore,
    Result,
};

pub use policy::{ExponentialBackoff, ImmediateRetry, ReconnectPolicy};

/// Consumer of messages received by a live session.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, session_id: &SessionId, conn: Arc<dyn WaConnection>, msg: IncomingMessage);
}

/// Drops every message.
pub struct IgnoreMessages;

#[async_trait]
impl MessageHandler for IgnoreMessages {
    async fn handle(&self, _session_id: &SessionId, _conn: Arc<dyn WaConnection>, _msg: IncomingMessage) {}
}

/// What a close reason leads to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseAction {
    /// Fatal; on-disk auth material is removed.
    PurgeAuth,
    /// Fatal; another client took over the device, the local handle logs out.
    Replaced,
    /// Recoverable; run the start procedure again.
    Reconnect,
}

impl CloseAction {
    pub fn for_reason(reason: DisconnectReason) -> Self {
        match reason {
            DisconnectReason::BadSession | DisconnectReason::LoggedOut => CloseAction::PurgeAuth,
            DisconnectReason::ConnectionReplaced => CloseAction::Replaced,
            DisconnectReason::ConnectionClosed
            | DisconnectReason::ConnectionLost
            | DisconnectReason::RestartRequired
            | DisconnectReason::TimedOut
            | DisconnectReason::Unknown(_) => CloseAction::Reconnect,
        }
    }
}

struct LiveEntry {
    conn: Arc<dyn WaConnection>,
    generation: u64,
    cancel: CancellationToken,
}

pub struct Supervisor {
    connector: Arc<dyn WaConnector>,
    store: Arc<SessionStore>,
    status: Arc<StatusTracker>,
    notifier: Arc<dyn PairingNotifier>,
    policy: Arc<dyn ReconnectPolicy>,
    handler: Arc<dyn MessageHandler>,
    pairing_timeout: Duration,
    live: Mutex<HashMap<SessionId, LiveEntry>>,
    next_generation: AtomicU64,
}

impl Supervisor {
    pub fn new(
        connector: Arc<dyn WaConnector>,
        store: Arc<SessionStore>,
        status: Arc<StatusTracker>,
        notifier: Arc<dyn PairingNotifier>,
        policy: Arc<dyn ReconnectPolicy>,
        pairing_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            store,
            status,
            notifier,
            policy,
            handler: Arc::new(IgnoreMessages),
            pairing_timeout,
            live: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn with_message_handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handler = handler;
        self
    }

    /// Start (or replace) the live connection for `id`.
    ///
    /// `Ok(None)` means the connection could not be established or paired; the
    /// failure is logged and not retried here.
    pub async fn start(self: &Arc<Self>, id: &SessionId) -> Result<Option<Arc<dyn WaConnection>>> {
        self.store.open(id).await?;
        self.status.set(id, ConnectionState::Uninitialized);
        tracing::info!(session = %id, "starting session");

        let Some((conn, events)) = self.establish(id).await else {
            return Ok(None);
        };

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let previous = self.live_map().insert(
            id.clone(),
            LiveEntry {
                conn: conn.clone(),
                generation,
                cancel: cancel.clone(),
            },
        );
        if let Some(prev) = previous {
            prev.cancel.cancel();
            if let Err(e) = prev.conn.close().await {
                tracing::warn!(session = %id, "failed to close replaced connection: {e}");
            }
        }

        let this = self.clone();
        let id_owned = id.clone();
        let driver_conn = conn.clone();
        tokio::spawn(async move {
            this.drive(id_owned, generation, driver_conn, events, cancel)
                .await;
        });
        Ok(Some(conn))
    }

    /// Tear down the live connection. `logout` also unlinks the device.
    /// Returns whether a live connection existed.
    pub async fn stop(&self, id: &SessionId, logout: bool) -> bool {
        let entry = self.live_map().remove(id);
        let Some(entry) = entry else {
            return false;
        };
        entry.cancel.cancel();
        let res = if logout {
            entry.conn.logout().await
        } else {
            entry.conn.close().await
        };
        if let Err(e) = res {
            tracing::warn!(session = %id, logout, "failed to stop connection: {e}");
        }
        self.status.set(id, ConnectionState::Offline);
        tracing::info!(session = %id, logout, "session stopped");
        true
    }

    /// Stop without logging out, then start again.
    pub async fn restart(self: &Arc<Self>, id: &SessionId) -> Result<Option<Arc<dyn WaConnection>>> {
        self.stop(id, false).await;
        self.start(id).await
    }

    pub fn is_live(&self, id: &SessionId) -> bool {
        self.live_map().contains_key(id)
    }

    pub fn live_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.live_map().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Status for display: the live handle's own connected flag wins over a
    /// stale tracked value.
    pub fn observed_status(&self, id: &SessionId) -> &'static str {
        let connected = self.live_map().get(id).map(|e| e.conn.is_connected());
        match (connected, self.status.get(id)) {
            (Some(true), _) => ConnectionState::Open.as_str(),
            (Some(false), Some(ConnectionState::Open)) => ConnectionState::Offline.as_str(),
            (Some(false), _) => self.status.label(id),
            (None, Some(ConnectionState::ClosedFatal)) => ConnectionState::ClosedFatal.as_str(),
            (None, Some(_)) => ConnectionState::Offline.as_str(),
            (None, None) => "unknown",
        }
    }

    /// Stop every live connection without logging out.
    pub async fn shutdown(&self) {
        let entries: Vec<(SessionId, LiveEntry)> = self.live_map().drain().collect();
        for (id, entry) in entries {
            entry.cancel.cancel();
            if let Err(e) = entry.conn.close().await {
                tracing::warn!(session = %id, "failed to close connection at shutdown: {e}");
            }
        }
    }

    fn live_map(&self) -> MutexGuard<'_, HashMap<SessionId, LiveEntry>> {
        self.live.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Connect, subscribe and, for unpaired credentials, obtain and deliver a
    /// pairing code.
    async fn establish(&self, id: &SessionId) -> Option<(Arc<dyn WaConnection>, EventStream)> {
        let conn = match self.connector.connect(id, &self.store.auth_dir(id)).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::error!(session = %id, "failed to open connection: {e}");
                self.status.set(id, ConnectionState::Offline);
                return None;
            }
        };
        let Some(events) = conn.subscribe() else {
            tracing::error!(session = %id, "connection event stream already taken");
            if let Err(e) = conn.close().await {
                tracing::warn!(session = %id, "failed to close connection: {e}");
            }
            self.status.set(id, ConnectionState::Offline);
            return None;
        };

        if !conn.is_registered() {
            self.status.set(id, ConnectionState::Pairing);
            match self.request_pairing_code(id, conn.as_ref()).await {
                Ok(code) => {
                    self.status.set(id, ConnectionState::Connecting);
                    tracing::info!(session = %id, "pairing code issued");
                    self.notifier.notify_pairing_code(id, &code).await;
                }
                Err(e) => {
                    tracing::error!(session = %id, "failed to request pairing code: {e}");
                    if let Err(e) = conn.close().await {
                        tracing::warn!(session = %id, "failed to close unpaired connection: {e}");
                    }
                    self.status.set(id, ConnectionState::Offline);
                    return None;
                }
            }
        }
        Some((conn, events))
    }

    async fn request_pairing_code(&self, id: &SessionId, conn: &dyn WaConnection) -> Result<String> {
        match timeout(self.pairing_timeout, conn.wait_pairing_ready()).await {
            Ok(ready) => ready?,
            Err(_) => {
                return Err(Error::External(format!(
                    "pairing was not ready within {}ms",
                    self.pairing_timeout.as_millis()
                )))
            }
        }
        conn.request_pairing_code(id.as_str()).await
    }

    async fn drive(
        self: Arc<Self>,
        id: SessionId,
        generation: u64,
        mut conn: Arc<dyn WaConnection>,
        mut events: EventStream,
        cancel: CancellationToken,
    ) {
        let mut attempt: u32 = 0;
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                ev = events.recv() => ev,
            };

            let update = match event {
                Some(ConnectionEvent::CredsUpdate(creds)) => {
                    if let Err(e) = self.store.save_creds(&id, &creds) {
                        tracing::error!(session = %id, "failed to persist credentials, pairing may be lost on restart: {e}");
                    }
                    continue;
                }
                Some(ConnectionEvent::Message(msg)) => {
                    self.handler.handle(&id, conn.clone(), msg).await;
                    continue;
                }
                Some(ConnectionEvent::Connection(update)) => update,
                None => {
                    tracing::warn!(session = %id, "event stream ended");
                    ConnectionUpdate::Close(DisconnectReason::ConnectionLost)
                }
            };

            let reason = match update {
                ConnectionUpdate::Connecting => {
                    self.status.set(&id, ConnectionState::Connecting);
                    tracing::info!(session = %id, "connecting");
                    continue;
                }
                ConnectionUpdate::Open => {
                    self.status.set(&id, ConnectionState::Open);
                    attempt = 0;
                    tracing::info!(session = %id, "connection open");
                    continue;
                }
                ConnectionUpdate::Close(reason) => reason,
            };

            match CloseAction::for_reason(reason) {
                CloseAction::PurgeAuth => {
                    self.status.set(&id, ConnectionState::ClosedFatal);
                    tracing::error!(session = %id, reason = reason.as_str(), "connection closed for good, removing auth material");
                    // The connection may still write creds into the auth dir until closed.
                    if let Err(e) = conn.close().await {
                        tracing::warn!(session = %id, "failed to close connection: {e}");
                    }
                    if let Err(e) = self.store.purge_auth(&id) {
                        tracing::error!(session = %id, "failed to remove auth material: {e}");
                    }
                    self.forget(&id, generation);
                    break;
                }
                CloseAction::Replaced => {
                    self.status.set(&id, ConnectionState::ClosedFatal);
                    tracing::warn!(session = %id, "connection replaced by another client");
                    if let Err(e) = conn.logout().await {
                        tracing::warn!(session = %id, "failed to log out replaced connection: {e}");
                    }
                    self.forget(&id, generation);
                    break;
                }
                CloseAction::Reconnect => {
                    self.status.set(&id, ConnectionState::Connecting);
                    attempt = attempt.saturating_add(1);
                    let Some(delay) = self.policy.next_delay(attempt) else {
                        self.status.set(&id, ConnectionState::ClosedFatal);
                        tracing::error!(session = %id, attempt, "giving up reconnecting");
                        if let Err(e) = conn.close().await {
                            tracing::warn!(session = %id, "failed to close connection: {e}");
                        }
                        self.forget(&id, generation);
                        break;
                    };
                    tracing::warn!(
                        session = %id,
                        reason = reason.as_str(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "connection closed, reconnecting"
                    );
                    if let Err(e) = conn.close().await {
                        tracing::debug!(session = %id, "closing dropped connection failed: {e}");
                    }

                    if !delay.is_zero() {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }

                    let Some((next_conn, next_events)) = self.establish(&id).await else {
                        self.forget(&id, generation);
                        break;
                    };
                    if cancel.is_cancelled() || !self.swap_connection(&id, generation, next_conn.clone()) {
                        if let Err(e) = next_conn.close().await {
                            tracing::debug!(session = %id, "closing superseded connection failed: {e}");
                        }
                        break;
                    }
                    conn = next_conn;
                    events = next_events;
                }
            }
        }
        tracing::debug!(session = %id, generation, "driver stopped");
    }

    fn swap_connection(&self, id: &SessionId, generation: u64, conn: Arc<dyn WaConnection>) -> bool {
        match self.live_map().get_mut(id) {
            Some(entry) if entry.generation == generation => {
                entry.conn = conn;
                true
            }
            _ => false,
        }
    }

    fn forget(&self, id: &SessionId, generation: u64) {
        let mut live = self.live_map();
        if live.get(id).is_some_and(|e| e.generation == generation) {
            live.remove(id);
        }
    }
}

#![allow(dead_code)]

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, OnceLock,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::mpsc;

use twm_core::{
    config::Config,
    connection::{
        port::{WaConnection, WaConnector},
        types::{
            ConnectionEvent, ConnectionUpdate, DisconnectReason, EventSink, EventStream, MediaRef,
            OutgoingMessage,
        },
    },
    control::Runtime,
    domain::{SessionId, UserId},
    media::ImageHost,
    notifier::PairingNotifier,
    status::StatusTracker,
    Error, Result,
};

pub const OWNER: UserId = UserId(1000);
pub const PAIRING_CODE: &str = "ABCD-1234";

pub fn sid(s: &str) -> SessionId {
    SessionId::parse(s).unwrap()
}

pub struct FakeConnection {
    pub session_id: SessionId,
    registered: bool,
    pairing_fails: bool,
    close_fails: bool,
    connected: AtomicBool,
    tx: EventSink,
    rx: Mutex<Option<EventStream>>,
    pub sent: Mutex<Vec<(String, OutgoingMessage)>>,
    pub logged_out: AtomicBool,
    pub closed: AtomicBool,
    auth_dir: PathBuf,
    /// Whether the auth dir was still on disk when `close` ran.
    pub auth_dir_present_at_close: AtomicBool,
}

impl FakeConnection {
    pub fn emit(&self, ev: ConnectionEvent) {
        let _ = self.tx.send(ev);
    }

    pub fn open(&self) {
        self.connected.store(true, Ordering::SeqCst);
        self.emit(ConnectionEvent::Connection(ConnectionUpdate::Open));
    }

    pub fn drop_with(&self, reason: DisconnectReason) {
        self.connected.store(false, Ordering::SeqCst);
        self.emit(ConnectionEvent::Connection(ConnectionUpdate::Close(reason)));
    }

    pub fn is_logged_out(&self) -> bool {
        self.logged_out.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WaConnection for FakeConnection {
    fn is_registered(&self) -> bool {
        self.registered
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> Option<EventStream> {
        self.rx.lock().unwrap().take()
    }

    async fn wait_pairing_ready(&self) -> Result<()> {
        Ok(())
    }

    async fn request_pairing_code(&self, _phone_number: &str) -> Result<String> {
        if self.pairing_fails {
            return Err(Error::External("pairing rejected".to_string()));
        }
        Ok(PAIRING_CODE.to_string())
    }

    async fn send(&self, chat_id: &str, message: OutgoingMessage) -> Result<()> {
        self.sent.lock().unwrap().push((chat_id.to_string(), message));
        Ok(())
    }

    async fn download_media(&self, _media: &MediaRef) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    async fn logout(&self) -> Result<()> {
        self.logged_out.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.auth_dir_present_at_close
            .store(self.auth_dir.exists(), Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        if self.close_fails {
            return Err(Error::External("sidecar did not exit".to_string()));
        }
        Ok(())
    }
}

/// Hands out [`FakeConnection`]s and remembers every one it made.
#[derive(Default)]
pub struct FakeConnector {
    pub registered: AtomicBool,
    pub fail_pairing: AtomicBool,
    pub fail_connect: AtomicBool,
    pub fail_close: AtomicBool,
    /// Milliseconds every `connect` takes.
    pub connect_delay_ms: AtomicU64,
    connections: Mutex<Vec<Arc<FakeConnection>>>,
}

impl FakeConnector {
    pub fn paired() -> Arc<Self> {
        let c = Self::default();
        c.registered.store(true, Ordering::SeqCst);
        Arc::new(c)
    }

    pub fn unpaired() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connect_count(&self, id: &SessionId) -> usize {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .filter(|c| &c.session_id == id)
            .count()
    }

    pub fn latest(&self, id: &SessionId) -> Arc<FakeConnection> {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|c| &c.session_id == id)
            .cloned()
            .expect("no connection for session")
    }
}

#[async_trait]
impl WaConnector for FakeConnector {
    async fn connect(&self, session_id: &SessionId, auth_dir: &Path) -> Result<Arc<dyn WaConnection>> {
        let delay = self.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::External("sidecar unavailable".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(FakeConnection {
            session_id: session_id.clone(),
            registered: self.registered.load(Ordering::SeqCst),
            pairing_fails: self.fail_pairing.load(Ordering::SeqCst),
            close_fails: self.fail_close.load(Ordering::SeqCst),
            connected: AtomicBool::new(false),
            tx,
            rx: Mutex::new(Some(rx)),
            sent: Mutex::new(Vec::new()),
            logged_out: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            auth_dir: auth_dir.to_path_buf(),
            auth_dir_present_at_close: AtomicBool::new(false),
        });
        self.connections.lock().unwrap().push(conn.clone());
        Ok(conn)
    }
}

/// Records every pairing code and the tracked status at the moment it arrived.
#[derive(Default)]
pub struct RecordingNotifier {
    pub codes: Mutex<Vec<(SessionId, String, &'static str)>>,
    status: OnceLock<Arc<StatusTracker>>,
}

impl RecordingNotifier {
    pub fn watch(&self, status: Arc<StatusTracker>) {
        let _ = self.status.set(status);
    }

    pub fn codes(&self) -> Vec<(SessionId, String, &'static str)> {
        self.codes.lock().unwrap().clone()
    }
}

#[async_trait]
impl PairingNotifier for RecordingNotifier {
    async fn notify_pairing_code(&self, session_id: &SessionId, code: &str) {
        let seen = self
            .status
            .get()
            .map(|s| s.label(session_id))
            .unwrap_or("unknown");
        self.codes
            .lock()
            .unwrap()
            .push((session_id.clone(), code.to_string(), seen));
    }
}

pub struct NoImageHost;

#[async_trait]
impl ImageHost for NoImageHost {
    async fn upload(&self, _bytes: Vec<u8>, _mime_type: &str) -> Result<String> {
        Err(Error::External("image hosting disabled".to_string()))
    }
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub cfg: Config,
    pub connector: Arc<FakeConnector>,
    pub notifier: Arc<RecordingNotifier>,
    pub runtime: Runtime,
}

pub fn harness(connector: Arc<FakeConnector>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let cfg = Config::for_root(dir.path(), OWNER);
    let notifier = Arc::new(RecordingNotifier::default());
    let runtime = Runtime::init(&cfg, connector.clone(), notifier.clone(), Arc::new(NoImageHost)).unwrap();
    notifier.watch(runtime.status.clone());
    Harness {
        dir,
        cfg,
        connector,
        notifier,
        runtime,
    }
}

/// Poll `cond` until it holds; panics after ~2s.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}

/// Give the driver task a chance to process anything already queued.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

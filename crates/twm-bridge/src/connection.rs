use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    process::{Child, ChildStdin, ChildStdout},
    sync::{mpsc, oneshot, watch, Mutex},
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use twm_core::{
    connection::{
        port::WaConnection,
        types::{
            ConnectionEvent, ConnectionUpdate, DisconnectReason, EventSink, EventStream, MediaRef,
            OutgoingMessage,
        },
    },
    domain::SessionId,
    errors::Error,
    utils::truncate_text,
    Result,
};

use crate::protocol::{connection_update, InboundFrame, Request};

const STDERR_TAIL_MAX_BYTES: usize = 16 * 1024;
const STDERR_TAIL_MAX_LINES: usize = 200;

#[derive(Clone, Debug, Default)]
pub(crate) struct StderrTail {
    lines: VecDeque<String>,
    bytes: usize,
}

impl StderrTail {
    pub(crate) fn push_line(&mut self, line: String) {
        self.bytes = self.bytes.saturating_add(line.len() + 1);
        self.lines.push_back(line);

        while self.lines.len() > STDERR_TAIL_MAX_LINES || self.bytes > STDERR_TAIL_MAX_BYTES {
            if let Some(front) = self.lines.pop_front() {
                self.bytes = self.bytes.saturating_sub(front.len() + 1);
            } else {
                break;
            }
        }
    }

    pub(crate) fn snapshot(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

type Pending = Arc<std::sync::Mutex<HashMap<u64, oneshot::Sender<Result<serde_json::Value>>>>>;

/// A live session backed by one sidecar process.
pub struct BridgeConnection {
    session_id: SessionId,
    registered: bool,
    connected: Arc<AtomicBool>,
    events: std::sync::Mutex<Option<EventStream>>,
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Option<Child>>,
    pending: Pending,
    next_id: AtomicU64,
    pairing_ready: watch::Receiver<bool>,
    cancel: CancellationToken,
    stderr_tail: Arc<Mutex<StderrTail>>,
    request_timeout: Duration,
}

impl BridgeConnection {
    /// Take ownership of a sidecar that already sent its `hello` and start
    /// pumping its stdout.
    pub(crate) fn start(
        session_id: SessionId,
        registered: bool,
        mut child: Child,
        reader: Lines<BufReader<ChildStdout>>,
        stderr_tail: Arc<Mutex<StderrTail>>,
        request_timeout: Duration,
    ) -> Self {
        let stdin = child.stdin.take();
        let (tx, rx) = mpsc::unbounded_channel();
        let (pairing_tx, pairing_rx) = watch::channel(false);
        let connected = Arc::new(AtomicBool::new(false));
        let pending: Pending = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();

        let pump = Pump {
            session_id: session_id.clone(),
            events: tx,
            pending: pending.clone(),
            pairing_ready: pairing_tx,
            connected: connected.clone(),
            cancel: cancel.clone(),
            stderr_tail: stderr_tail.clone(),
        };
        tokio::spawn(pump.run(reader));

        Self {
            session_id,
            registered,
            connected,
            events: std::sync::Mutex::new(Some(rx)),
            stdin: Mutex::new(stdin),
            child: Mutex::new(Some(child)),
            pending,
            next_id: AtomicU64::new(1),
            pairing_ready: pairing_rx,
            cancel,
            stderr_tail,
            request_timeout,
        }
    }

    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn request(&self, req: Request<'_>) -> Result<serde_json::Value> {
        let id = req.id();
        let op = req.op();
        let mut line = serde_json::to_string(&req)?;
        line.push('\n');

        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(id, tx);

        let written = {
            let mut guard = self.stdin.lock().await;
            match guard.as_mut() {
                Some(stdin) => match stdin.write_all(line.as_bytes()).await {
                    Ok(()) => stdin.flush().await.map_err(Error::Io),
                    Err(e) => Err(Error::Io(e)),
                },
                None => Err(Error::External("bridge stdin is closed".to_string())),
            }
        };
        if let Err(e) = written {
            lock_pending(&self.pending).remove(&id);
            return Err(e);
        }

        match timeout(self.request_timeout, rx).await {
            Ok(Ok(res)) => res,
            Ok(Err(_)) => Err(self.exited_error(op).await),
            Err(_) => {
                lock_pending(&self.pending).remove(&id);
                Err(Error::External(format!(
                    "bridge {op} timed out after {}ms",
                    self.request_timeout.as_millis()
                )))
            }
        }
    }

    async fn exited_error(&self, op: &str) -> Error {
        let stderr = self.stderr_tail.lock().await.snapshot();
        let mut msg = format!("bridge exited during {op}");
        if !stderr.trim().is_empty() {
            msg.push_str("\nstderr (tail):\n");
            msg.push_str(&stderr);
        }
        Error::External(msg)
    }

    async fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();
        self.connected.store(false, Ordering::SeqCst);
        // Closing stdin asks the sidecar to exit on its own.
        self.stdin.lock().await.take();
        self.kill_child().await
    }

    async fn kill_child(&self) -> Result<()> {
        let child = {
            let mut guard = self.child.lock().await;
            guard.take()
        };

        let Some(mut child) = child else {
            return Ok(());
        };

        // If it's already exited, `try_wait` reaps it.
        if child.try_wait()?.is_some() {
            return Ok(());
        }

        match child.kill().await {
            Ok(()) => {
                let _ = child.wait().await?;
            }
            Err(e) => {
                if child.try_wait()?.is_none() {
                    let mut guard = self.child.lock().await;
                    *guard = Some(child);
                    return Err(Error::Io(e));
                }
            }
        }
        tracing::debug!(session = %self.session_id, "bridge process stopped");
        Ok(())
    }
}

fn lock_pending(
    pending: &Pending,
) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Result<serde_json::Value>>>> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl WaConnection for BridgeConnection {
    fn is_registered(&self) -> bool {
        self.registered
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> Option<EventStream> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    async fn wait_pairing_ready(&self) -> Result<()> {
        let mut rx = self.pairing_ready.clone();
        let ready = rx.wait_for(|ready| *ready).await.map(|_| ());
        match ready {
            Ok(()) => Ok(()),
            Err(_) => Err(self.exited_error("pairing").await),
        }
    }

    async fn request_pairing_code(&self, phone_number: &str) -> Result<String> {
        let id = self.next_request_id();
        let res = self
            .request(Request::RequestPairingCode {
                id,
                phone: phone_number,
            })
            .await?;
        res.as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::External("bridge returned no pairing code".to_string()))
    }

    async fn send(&self, chat_id: &str, message: OutgoingMessage) -> Result<()> {
        let id = self.next_request_id();
        self.request(Request::Send {
            id,
            chat_id,
            message: &message,
        })
        .await?;
        Ok(())
    }

    async fn download_media(&self, media: &MediaRef) -> Result<Vec<u8>> {
        let id = self.next_request_id();
        let res = self.request(Request::DownloadMedia { id, media }).await?;
        let path = res
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::External("bridge returned no media path".to_string()))?;
        let bytes = tokio::fs::read(path).await?;
        if let Err(e) = tokio::fs::remove_file(path).await {
            tracing::warn!(session = %self.session_id, path, "failed to remove downloaded media: {e}");
        }
        Ok(bytes)
    }

    async fn logout(&self) -> Result<()> {
        let id = self.next_request_id();
        let res = self.request(Request::Logout { id }).await;
        let stopped = self.shutdown().await;
        res.map(|_| ()).and(stopped)
    }

    async fn close(&self) -> Result<()> {
        self.shutdown().await
    }
}

/// Reads sidecar stdout and routes each frame.
struct Pump {
    session_id: SessionId,
    events: EventSink,
    pending: Pending,
    pairing_ready: watch::Sender<bool>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
    stderr_tail: Arc<Mutex<StderrTail>>,
}

impl Pump {
    async fn run(self, mut reader: Lines<BufReader<ChildStdout>>) {
        let mut close_reported = false;
        loop {
            let line = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                line = reader.next_line() => line,
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => {
                    self.on_exit(close_reported).await;
                    break;
                }
                Err(e) => {
                    tracing::error!(session = %self.session_id, "bridge stdout read failed: {e}");
                    self.on_exit(close_reported).await;
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let frame: InboundFrame = match serde_json::from_str(&line) {
                Ok(f) => f,
                Err(e) => {
                    tracing::warn!(
                        session = %self.session_id,
                        line = %truncate_text(&line, 500),
                        "unparseable bridge frame: {e}"
                    );
                    continue;
                }
            };
            if let Some(ConnectionUpdate::Close(_)) = self.route(frame) {
                close_reported = true;
            }
        }
        fail_all_pending(&self.pending);
    }

    fn route(&self, frame: InboundFrame) -> Option<ConnectionUpdate> {
        match frame {
            InboundFrame::Hello { .. } => {
                tracing::debug!(session = %self.session_id, "duplicate hello from bridge");
            }
            InboundFrame::PairingReady {} | InboundFrame::Qr { .. } => {
                let _ = self.pairing_ready.send(true);
            }
            InboundFrame::Connection {
                state,
                status_code,
                reason,
            } => {
                let Some(update) = connection_update(&state, status_code, reason.as_deref()) else {
                    tracing::debug!(session = %self.session_id, state = %state, "ignoring connection state");
                    return None;
                };
                self.connected
                    .store(update == ConnectionUpdate::Open, Ordering::SeqCst);
                let _ = self.events.send(ConnectionEvent::Connection(update));
                return Some(update);
            }
            InboundFrame::Creds { creds } => {
                let _ = self.events.send(ConnectionEvent::CredsUpdate(creds));
            }
            InboundFrame::Message { message } => {
                let _ = self.events.send(ConnectionEvent::Message(message));
            }
            InboundFrame::Response {
                id,
                ok,
                result,
                error,
            } => {
                let Some(tx) = lock_pending(&self.pending).remove(&id) else {
                    tracing::debug!(session = %self.session_id, id, "response for unknown request");
                    return None;
                };
                let res = if ok {
                    Ok(result)
                } else {
                    Err(Error::External(
                        error.unwrap_or_else(|| "bridge request failed".to_string()),
                    ))
                };
                let _ = tx.send(res);
            }
            InboundFrame::Log { level, message } => match level.as_deref() {
                Some("error") => tracing::error!(session = %self.session_id, "bridge: {message}"),
                Some("warn") => tracing::warn!(session = %self.session_id, "bridge: {message}"),
                _ => tracing::debug!(session = %self.session_id, "bridge: {message}"),
            },
        }
        None
    }

    async fn on_exit(&self, close_reported: bool) {
        self.connected.store(false, Ordering::SeqCst);
        if self.cancel.is_cancelled() || close_reported {
            return;
        }
        let stderr = self.stderr_tail.lock().await.snapshot();
        if stderr.trim().is_empty() {
            tracing::warn!(session = %self.session_id, "bridge exited unexpectedly");
        } else {
            tracing::warn!(session = %self.session_id, "bridge exited unexpectedly\nstderr (tail):\n{stderr}");
        }
        let _ = self.events.send(ConnectionEvent::Connection(ConnectionUpdate::Close(
            DisconnectReason::ConnectionLost,
        )));
    }
}

fn fail_all_pending(pending: &Pending) {
    let drained: Vec<_> = lock_pending(pending).drain().collect();
    for (_, tx) in drained {
        let _ = tx.send(Err(Error::External("bridge exited".to_string())));
    }
}

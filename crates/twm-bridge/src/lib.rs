//! WhatsApp connection adapter.
//!
//! Each session runs its own sidecar process (a thin wrapper around the
//! WhatsApp protocol library) spawned as
//! `<command> <args...> --session <phone> --auth-dir <dir>`. The sidecar owns the
//! auth directory and talks NDJSON over stdio; see [`protocol`].
//!
//! # Wire protocol
//!
//! One JSON object per line. stdout carries frames tagged with `type`:
//!
//! | `type` | fields | meaning |
//! |---|---|---|
//! | `hello` | `registered` | first frame; whether the auth dir is already paired |
//! | `pairing_ready` | | a pairing code can be requested |
//! | `qr` | `qr` | same as `pairing_ready` |
//! | `connection` | `state`, `status_code`, `reason` | `state` is `connecting`, `open` or `close` |
//! | `creds` | `creds` | updated credentials to persist |
//! | `message` | `message` | an incoming chat message |
//! | `response` | `id`, `ok`, `result`, `error` | answer to the request with the same `id` |
//! | `log` | `level`, `message` | forwarded to `tracing` |
//!
//! For a `close`, a known `reason` name wins over `status_code`.
//!
//! stdin carries requests tagged with `op`, each with a fresh numeric `id`:
//!
//! | `op` | fields | `result` on success |
//! |---|---|---|
//! | `request_pairing_code` | `phone` | the code as a string |
//! | `send` | `chat_id`, `message` | ignored |
//! | `download_media` | `media` | `{"path": "..."}`, a temp file the adapter reads then deletes |
//! | `logout` | | ignored |
//!
//! A failed request answers with `ok: false` and `error`. stderr is kept as a
//! short tail and attached to errors when the sidecar exits.

pub mod connection;
pub mod protocol;

use std::{path::Path, path::PathBuf, process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, BufReader, Lines},
    process::{ChildStdout, Command},
    sync::Mutex,
    time::timeout,
};
use twm_core::{
    config::Config,
    connection::port::{WaConnection, WaConnector},
    domain::SessionId,
    errors::Error,
    Result,
};

pub use connection::BridgeConnection;
use connection::StderrTail;
use protocol::InboundFrame;

#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub command: PathBuf,
    pub args: Vec<String>,
    /// How long a fresh sidecar may take to send `hello`.
    pub hello_timeout: Duration,
    pub request_timeout: Duration,
}

impl BridgeConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            command: cfg.bridge_command.clone(),
            args: cfg.bridge_args.clone(),
            hello_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Debug)]
pub struct BridgeConnector {
    cfg: BridgeConfig,
}

impl BridgeConnector {
    pub fn new(cfg: BridgeConfig) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl WaConnector for BridgeConnector {
    async fn connect(&self, session_id: &SessionId, auth_dir: &Path) -> Result<Arc<dyn WaConnection>> {
        let mut cmd = Command::new(&self.cfg.command);
        cmd.args(&self.cfg.args)
            .arg("--session")
            .arg(session_id.as_str())
            .arg("--auth-dir")
            .arg(auth_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            Error::External(format!(
                "failed to spawn bridge {}: {e}",
                self.cfg.command.display()
            ))
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::External("bridge stdout was not captured".to_string()))?;
        let stderr_tail: Arc<Mutex<StderrTail>> = Arc::new(Mutex::new(StderrTail::default()));

        // Drain stderr in background to avoid blocking on a full pipe.
        if let Some(stderr) = child.stderr.take() {
            let tail = stderr_tail.clone();
            let id = session_id.clone();
            tokio::spawn(async move {
                let mut r = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = r.next_line().await {
                    tracing::trace!(session = %id, "bridge stderr: {line}");
                    tail.lock().await.push_line(line);
                }
            });
        }

        let mut reader = BufReader::new(stdout).lines();
        let hello = timeout(self.cfg.hello_timeout, read_hello(&mut reader, session_id)).await;

        let registered = match hello {
            Ok(Ok(registered)) => registered,
            Ok(Err(e)) => {
                let _ = child.kill().await;
                let stderr = stderr_tail.lock().await.snapshot();
                if stderr.trim().is_empty() {
                    return Err(e);
                }
                return Err(Error::External(format!("{e}\nstderr (tail):\n{stderr}")));
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(Error::External(format!(
                    "bridge did not say hello within {}ms",
                    self.cfg.hello_timeout.as_millis()
                )));
            }
        };

        tracing::info!(session = %session_id, registered, "bridge started");
        Ok(Arc::new(BridgeConnection::start(
            session_id.clone(),
            registered,
            child,
            reader,
            stderr_tail,
            self.cfg.request_timeout,
        )))
    }
}

/// Skip anything before the `hello` frame and return its `registered` flag.
async fn read_hello(reader: &mut Lines<BufReader<ChildStdout>>, session_id: &SessionId) -> Result<bool> {
    loop {
        let Some(line) = reader.next_line().await? else {
            return Err(Error::External("bridge exited before hello".to_string()));
        };
        match serde_json::from_str::<InboundFrame>(&line) {
            Ok(InboundFrame::Hello { registered }) => return Ok(registered),
            Ok(_) => tracing::debug!(session = %session_id, "bridge frame before hello ignored"),
            Err(e) => tracing::debug!(session = %session_id, "bridge output before hello: {e}"),
        }
    }
}

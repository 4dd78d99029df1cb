//! One supervised tool provider client.
//!
//! Concurrency layout per client: a single writer task owns the write
//! side of the transport and is fed through a channel; a single reader
//! task demultiplexes replies onto per-call completion slots keyed by
//! request id. Callers may invoke [`ToolClient::call`] from any task.
//!
//! Deadlines complete the pending entry with a typed error and do NOT
//! cancel the call on the wire — a later reply with that id is
//! discarded. Transport faults transition the client to `failed` and
//! schedule reconnection with exponential backoff, bounded by the
//! configured attempt cap. Tool-level error envelopes never affect
//! connection state.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};

use super::protocol::{ListToolsResult, Request, Response, LIST_TOOLS};
use super::{ClientStatus, ToolError, ToolName};

/// Tunables shared by every client in the pool.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub pending_cap: usize,
    pub max_reconnects: u32,
    pub handshake_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            pending_cap: 64,
            max_reconnects: 3,
            handshake_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

/// How to launch the provider child process.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub path: PathBuf,
    /// Env var names forwarded into the child's otherwise-empty
    /// environment.
    pub env_passthrough: Vec<String>,
}

type PendingSlot = oneshot::Sender<Result<Value, ToolError>>;

enum WriteCommand {
    Line(String),
    /// Zero-length line: the graceful shutdown terminator.
    Terminator,
}

struct Inner {
    name: ToolName,
    settings: ClientSettings,
    spec: Option<ProcessSpec>,
    status: Mutex<ClientStatus>,
    last_error: Mutex<Option<String>>,
    methods: Mutex<Vec<String>>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingSlot>>,
    write_tx: Mutex<Option<mpsc::Sender<WriteCommand>>>,
    child: tokio::sync::Mutex<Option<Child>>,
    reconnect_attempts: AtomicU32,
    /// Transport generation; stale task callbacks are ignored.
    generation: AtomicU64,
}

/// Client for one tool provider subprocess.
#[derive(Clone)]
pub struct ToolClient {
    inner: Arc<Inner>,
}

impl ToolClient {
    pub fn new(name: ToolName, spec: Option<ProcessSpec>, settings: ClientSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                settings,
                spec,
                status: Mutex::new(ClientStatus::Disconnected),
                last_error: Mutex::new(None),
                methods: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                pending: Mutex::new(HashMap::new()),
                write_tx: Mutex::new(None),
                child: tokio::sync::Mutex::new(None),
                reconnect_attempts: AtomicU32::new(0),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> ToolName {
        self.inner.name
    }

    pub fn status(&self) -> ClientStatus {
        *self.inner.status.lock().expect("status lock poisoned")
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.lock().expect("error lock poisoned").clone()
    }

    /// Method names advertised at the last successful handshake.
    pub fn methods(&self) -> Vec<String> {
        self.inner.methods.lock().expect("methods lock poisoned").clone()
    }

    /// Spawn the child process, attach the transport, and handshake.
    pub async fn connect(&self) -> Result<(), ToolError> {
        Inner::connect(&self.inner).await
    }

    /// Issue one call with a deadline.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Duration,
    ) -> Result<Value, ToolError> {
        Inner::do_call(&self.inner, method, params, deadline, true).await
    }

    /// Graceful shutdown: terminator line, bounded grace, then kill.
    pub async fn close(&self) {
        Inner::close(&self.inner).await
    }

    /// Attach an in-memory transport and handshake (tests).
    #[cfg(test)]
    async fn connect_attached<W, R>(&self, writer: W, reader: R) -> Result<(), ToolError>
    where
        W: AsyncWrite + Unpin + Send + 'static,
        R: AsyncRead + Unpin + Send + 'static,
    {
        self.inner.set_status(ClientStatus::Connecting);
        Inner::attach(&self.inner, writer, reader);
        Inner::handshake(&self.inner).await
    }
}

impl Inner {
    fn set_status(&self, status: ClientStatus) {
        *self.status.lock().expect("status lock poisoned") = status;
    }

    fn current_status(&self) -> ClientStatus {
        *self.status.lock().expect("status lock poisoned")
    }

    async fn connect(self: &Arc<Self>) -> Result<(), ToolError> {
        let spec = self
            .spec
            .clone()
            .ok_or_else(|| ToolError::Transport("no launch spec".to_string()))?;

        self.set_status(ClientStatus::Connecting);

        let mut command = Command::new(&spec.path);
        command
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .env_clear()
            .kill_on_drop(true);
        for key in &spec.env_passthrough {
            if let Ok(value) = std::env::var(key) {
                command.env(key, value);
            }
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let cause = format!("spawn failed: {e}");
                self.record_failure(&cause);
                return Err(ToolError::Transport(cause));
            }
        };

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
            let cause = "child pipes unavailable".to_string();
            self.record_failure(&cause);
            return Err(ToolError::Transport(cause));
        };

        *self.child.lock().await = Some(child);
        Self::attach(self, stdin, stdout);
        match Self::handshake(self).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.record_failure(&format!("handshake failed: {e}"));
                Err(e)
            }
        }
    }

    /// Wire a transport pair to fresh writer/reader tasks.
    fn attach<W, R>(self: &Arc<Self>, mut writer: W, reader: R)
    where
        W: AsyncWrite + Unpin + Send + 'static,
        R: AsyncRead + Unpin + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, mut rx) = mpsc::channel::<WriteCommand>(64);
        *self.write_tx.lock().expect("write lock poisoned") = Some(tx);

        let writer_inner = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                let (line, is_terminator) = match command {
                    WriteCommand::Line(mut line) => {
                        line.push('\n');
                        (line, false)
                    }
                    WriteCommand::Terminator => ("\n".to_string(), true),
                };
                if writer.write_all(line.as_bytes()).await.is_err() {
                    Self::transport_failed(&writer_inner, generation, "write failed");
                    return;
                }
                let _ = writer.flush().await;
                if is_terminator {
                    return;
                }
            }
        });

        let reader_inner = Arc::clone(self);
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match Response::parse_line(&line) {
                            Ok(response) => reader_inner.dispatch(response),
                            Err(e) => {
                                Self::transport_failed(
                                    &reader_inner,
                                    generation,
                                    &format!("decode error: {e}"),
                                );
                                return;
                            }
                        }
                    }
                    Ok(None) => {
                        Self::transport_failed(&reader_inner, generation, "eof");
                        return;
                    }
                    Err(e) => {
                        Self::transport_failed(&reader_inner, generation, &e.to_string());
                        return;
                    }
                }
            }
        });
    }

    /// `listTools` handshake; success transitions to `connected`.
    async fn handshake(self: &Arc<Self>) -> Result<(), ToolError> {
        let timeout = self.settings.handshake_timeout;
        let reply = Self::do_call(self, LIST_TOOLS, None, timeout, false).await?;

        let listed: ListToolsResult = serde_json::from_value(reply)
            .map_err(|e| {
                let cause = format!("bad handshake payload: {e}");
                self.record_failure(&cause);
                ToolError::Transport(cause)
            })?;

        let mut methods: Vec<String> =
            listed.tools.iter().map(|t| t.name().to_string()).collect();
        methods.sort();
        methods.dedup();
        *self.methods.lock().expect("methods lock poisoned") = methods;

        self.set_status(ClientStatus::Connected);
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        tracing::info!(tool = %self.name, "tool client connected");
        Ok(())
    }

    async fn do_call(
        self: &Arc<Self>,
        method: &str,
        params: Option<Value>,
        deadline: Duration,
        require_connected: bool,
    ) -> Result<Value, ToolError> {
        if require_connected && self.current_status() != ClientStatus::Connected {
            return Err(ToolError::Unavailable);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            if pending.len() >= self.settings.pending_cap {
                return Err(ToolError::PendingCapExceeded);
            }
            pending.insert(id, tx);
        }
        // Removes the slot on every exit path that did not complete it,
        // including caller cancellation. Never touches the transport.
        let guard = PendingGuard {
            inner: Arc::clone(self),
            id,
        };

        let line = Request::new(id, method, params)
            .to_line()
            .map_err(|e| ToolError::Transport(e.to_string()))?;

        let tx_handle = {
            let slot = self.write_tx.lock().expect("write lock poisoned");
            slot.clone()
        };
        let Some(tx_handle) = tx_handle else {
            return Err(ToolError::Unavailable);
        };
        if tx_handle.send(WriteCommand::Line(line)).await.is_err() {
            return Err(ToolError::Unavailable);
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(outcome)) => {
                drop(guard);
                outcome
            }
            Ok(Err(_)) => Err(ToolError::Transport("completion slot dropped".to_string())),
            Err(_) => {
                // Deadline passed: abandon the entry; the eventual
                // reply with this id is discarded by the reader.
                drop(guard);
                Err(ToolError::DeadlineExceeded)
            }
        }
    }

    /// Route one reply to its pending slot; late replies are dropped.
    fn dispatch(&self, response: Response) {
        let slot = {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            pending.remove(&response.id)
        };
        let Some(slot) = slot else {
            tracing::debug!(tool = %self.name, id = response.id, "discarding late reply");
            return;
        };
        let outcome = match (response.result, response.error) {
            (_, Some(err)) => Err(ToolError::Remote {
                code: err.code,
                message: err.message,
            }),
            (Some(result), None) => Ok(result),
            (None, None) => Ok(Value::Null),
        };
        let _ = slot.send(outcome);
    }

    fn record_failure(&self, cause: &str) {
        self.set_status(ClientStatus::Failed);
        *self.last_error.lock().expect("error lock poisoned") = Some(cause.to_string());
    }

    fn fail_all_pending(&self, make_error: impl Fn() -> ToolError) {
        let drained: Vec<PendingSlot> = {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            pending.drain().map(|(_, slot)| slot).collect()
        };
        for slot in drained {
            let _ = slot.send(Err(make_error()));
        }
    }

    /// Transport-level fault: fail pending calls, mark `failed`,
    /// schedule reconnection.
    fn transport_failed(self: &Arc<Self>, generation: u64, cause: &str) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return; // a newer transport already took over
        }
        if self.current_status() == ClientStatus::Disconnected {
            return; // deliberate close
        }

        tracing::warn!(tool = %self.name, cause, "tool transport failed");
        self.record_failure(cause);
        *self.write_tx.lock().expect("write lock poisoned") = None;
        let cause_owned = cause.to_string();
        self.fail_all_pending(|| ToolError::Transport(cause_owned.clone()));

        if self.spec.is_none() {
            return; // attached transports (tests) do not reconnect
        }
        let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > self.settings.max_reconnects {
            tracing::error!(tool = %self.name, "reconnect attempts exhausted");
            return;
        }

        let backoff = Duration::from_millis(500u64.saturating_mul(1 << (attempt - 1)));
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            if inner.current_status() != ClientStatus::Failed {
                return; // closed or already reconnected meanwhile
            }
            tracing::info!(tool = %inner.name, attempt, "reconnecting tool client");
            let _ = Inner::connect(&inner).await;
        });
    }

    async fn close(self: &Arc<Self>) {
        self.set_status(ClientStatus::Disconnected);

        let tx_handle = self.write_tx.lock().expect("write lock poisoned").take();
        if let Some(tx) = tx_handle {
            let _ = tx.send(WriteCommand::Terminator).await;
        }

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            match tokio::time::timeout(self.settings.shutdown_grace, child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    tracing::warn!(tool = %self.name, "grace period elapsed; killing child");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        }

        self.fail_all_pending(|| ToolError::Shutdown);
    }
}

/// Removes a pending entry when a call future exits without the
/// reader having completed it (deadline or caller cancellation).
struct PendingGuard {
    inner: Arc<Inner>,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let mut pending = self.inner.pending.lock().expect("pending lock poisoned");
        pending.remove(&self.id);
    }
}

//! Mirror of the server's remote processes over one notification socket.
//!
//! The [`ProcessManager`] owns the socket, demultiplexes inbound frames by
//! token, and lets callers wait for a process to appear ([`get`]) or pull the
//! messages of one process in arrival order ([`receive`]).
//!
//! Registries are guarded by a single `parking_lot::Mutex` that is never held
//! across an `.await`, so every registry mutation is observed whole.
//!
//! [`get`]: ProcessManager::get
//! [`receive`]: ProcessManager::receive

mod api;
pub mod connection;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::{ClientConfig, ReconnectConfig};
use crate::error::ClientError;
use crate::notify::AsyncNotify;
use crate::protocol::{ExtraData, Frame, OutputKind, ProcessEvent, Program, StartRequest, Token};

use self::api::ProcessApi;
pub use self::connection::{Backoff, ConnectionState};

/// Result of draining a process stream until it exits.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessExit {
    pub status: Option<i64>,
    pub signal: Option<String>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

#[derive(Default)]
struct Registry {
    procs: HashMap<Token, Program>,
    /// Tokens in arrival order; indexes are stable cursors.
    arrivals: Vec<Token>,
    procs_waiting: HashMap<Token, AsyncNotify<Program>>,
    recv_buffer: HashMap<Token, VecDeque<Value>>,
    recv_waiting: HashMap<Token, Vec<oneshot::Sender<Value>>>,
}

struct Inner {
    registry: Mutex<Registry>,
    new_procs: AsyncNotify<Program>,
    api: ProcessApi,
    notify_url: Url,
    bearer: Option<String>,
    reconnect: ReconnectConfig,
    state_tx: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Handle to the process registry. Clones share state.
#[derive(Clone)]
pub struct ProcessManager {
    inner: Arc<Inner>,
}

impl ProcessManager {
    /// Build an unconnected manager. Call [`connect`](Self::connect) to open
    /// the notification socket.
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        let notify_url = config.notify_url()?;
        // Fail on a bad token header now rather than in every retry.
        connection::handshake_request(&notify_url, config.token.as_deref())?;

        let api = ProcessApi::new(config.process_url()?, config.token.clone())?;
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        Ok(Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(Registry::default()),
                new_procs: AsyncNotify::new(),
                api,
                notify_url,
                bearer: config.token.clone(),
                reconnect: config.reconnect,
                state_tx,
                cancel: CancellationToken::new(),
                task: Mutex::new(None),
            }),
        })
    }

    /// Spawn the connection task. Calling this while the task is alive is a
    /// no-op; after [`shutdown`](Self::shutdown) it does nothing.
    pub fn connect(&self) {
        let mut task = self.inner.task.lock();
        if self.inner.cancel.is_cancelled() {
            return;
        }
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let on_text = move |text: &str| {
            if let Some(inner) = weak.upgrade() {
                ProcessManager { inner }.dispatch_text(text);
            }
        };

        *task = Some(tokio::spawn(connection::connection_loop(
            self.inner.notify_url.clone(),
            self.inner.bearer.clone(),
            self.inner.reconnect,
            self.inner.state_tx.clone(),
            self.inner.cancel.clone(),
            on_text,
        )));
    }

    /// Close the socket and stop reconnecting. Pending waits stay pending.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Wait until the notification socket is open.
    pub async fn wait_connected(&self) {
        let mut rx = self.inner.state_tx.subscribe();
        // The sender lives in `self`, so `wait_for` cannot fail here.
        let _ = rx.wait_for(|state| *state == ConnectionState::Open).await;
    }

    /// Parse and route one inbound text frame. Malformed frames are dropped.
    pub fn dispatch_text(&self, text: &str) {
        match Frame::parse(text) {
            Ok(frame) => self.dispatch(frame),
            Err(e) => tracing::warn!(error = %e, "dropping malformed frame"),
        }
    }

    /// Route one decoded frame into the registries.
    pub fn dispatch(&self, frame: Frame) {
        let mut reg = self.inner.registry.lock();
        match frame {
            Frame::ProcessStart(program) => {
                let token = program.token.clone();
                if reg.procs.contains_key(&token) {
                    // Replayed by the server after a reconnect.
                    tracing::debug!(token = %token, "ignoring repeated process start");
                    return;
                }
                tracing::debug!(token = %token, "process started");
                reg.procs.insert(token.clone(), program.clone());
                reg.arrivals.push(token.clone());
                if let Some(waiting) = reg.procs_waiting.remove(&token) {
                    tracing::debug!(token = %token, "notifying waiters about process arrival");
                    waiting.notify(program.clone());
                }
                self.inner.new_procs.notify(program);
            }
            Frame::Message { token, payload } => {
                let live: Vec<_> = reg
                    .recv_waiting
                    .remove(&token)
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|tx| !tx.is_closed())
                    .collect();
                if live.is_empty() {
                    tracing::debug!(token = %token, "no receiver waiting, buffering message");
                    reg.recv_buffer.entry(token).or_default().push_back(payload);
                } else {
                    tracing::debug!(token = %token, receivers = live.len(), "forwarding message");
                    for tx in live {
                        let _ = tx.send(payload.clone());
                    }
                }
            }
        }
    }

    /// Wait for the next process to arrive, whatever its token.
    ///
    /// Only the latest arrival is visible: processes that start while nobody
    /// is waiting overwrite each other. Use [`programs_since`] to catch up.
    ///
    /// [`programs_since`]: Self::programs_since
    pub async fn next_program(&self) -> Program {
        let program = self.inner.new_procs.wait().await;
        self.inner.new_procs.reset();
        program
    }

    /// Get the process for `token`, waiting for its start frame if needed.
    pub async fn get_program(&self, token: &str) -> Program {
        let notify = {
            let mut reg = self.inner.registry.lock();
            if let Some(program) = reg.procs.get(token) {
                return program.clone();
            }
            tracing::debug!(token = %token, "waiting for process to start");
            reg.procs_waiting
                .entry(token.to_string())
                .or_default()
                .clone()
        };
        notify.wait().await
    }

    /// `get(token)` with an optional token: `None` waits for any new process.
    pub async fn get(&self, token: Option<&str>) -> Program {
        match token {
            Some(token) => self.get_program(token).await,
            None => self.next_program().await,
        }
    }

    /// Next message for `token`, oldest first. Buffered messages return
    /// immediately; otherwise the call waits for the next one to arrive.
    pub async fn receive(&self, token: &str) -> Value {
        let rx = {
            let mut reg = self.inner.registry.lock();
            if let Some(buf) = reg.recv_buffer.get_mut(token) {
                if let Some(payload) = buf.pop_front() {
                    if buf.is_empty() {
                        reg.recv_buffer.remove(token);
                    }
                    return payload;
                }
            }
            let (tx, rx) = oneshot::channel();
            reg.recv_waiting
                .entry(token.to_string())
                .or_default()
                .push(tx);
            rx
        };
        match rx.await {
            Ok(payload) => payload,
            // Senders are only dropped after sending.
            Err(_) => std::future::pending().await,
        }
    }

    /// Known process for `token`, without waiting.
    pub fn program(&self, token: &str) -> Option<Program> {
        self.inner.registry.lock().procs.get(token).cloned()
    }

    /// All known processes in arrival order.
    pub fn programs(&self) -> Vec<Program> {
        self.programs_since(0)
    }

    /// Processes that arrived at or after position `cursor`, in arrival
    /// order. `cursor + returned.len()` is the cursor for the next call.
    pub fn programs_since(&self, cursor: usize) -> Vec<Program> {
        let reg = self.inner.registry.lock();
        reg.arrivals
            .iter()
            .skip(cursor)
            .filter_map(|token| reg.procs.get(token).cloned())
            .collect()
    }

    /// Number of messages buffered for `token` that nobody has received yet.
    pub fn buffered(&self, token: &str) -> usize {
        self.inner
            .registry
            .lock()
            .recv_buffer
            .get(token)
            .map_or(0, VecDeque::len)
    }

    /// Ask the server to start a process. Returns the assigned token.
    ///
    /// `command` and `action` are mutually exclusive; passing both fails
    /// with [`ClientError::ConflictingLaunch`] before any request is made.
    pub async fn run(
        &self,
        command: Option<Value>,
        action: Option<Value>,
        extra_data: Option<ExtraData>,
    ) -> Result<Token, ClientError> {
        let token = uuid::Uuid::new_v4().to_string();
        self.run_with_token(token, command, action, extra_data).await
    }

    /// Like [`run`](Self::run), with a caller-chosen token.
    pub async fn run_with_token(
        &self,
        token: Token,
        command: Option<Value>,
        action: Option<Value>,
        extra_data: Option<ExtraData>,
    ) -> Result<Token, ClientError> {
        let command = command.filter(|c| !c.is_null());
        let action = action.filter(|a| !a.is_null());
        if command.is_some() && action.is_some() {
            tracing::error!(?command, ?action, "both command and action given");
            return Err(ClientError::ConflictingLaunch);
        }
        tracing::debug!(token = %token, ?command, ?action, "starting process");

        let request = StartRequest {
            token,
            command,
            action,
            extra_data,
        };
        self.inner.api.start(&request).await
    }

    /// Ask the server to terminate the process behind `token`.
    pub async fn terminate(&self, token: &str) -> Result<(), ClientError> {
        tracing::debug!(token = %token, "terminating process");
        self.inner.api.terminate(token).await
    }

    /// Drain the stream of `token` until its exit message, collecting output.
    pub async fn wait_exit(&self, token: &str) -> ProcessExit {
        let mut exit = ProcessExit::default();
        loop {
            let payload = self.receive(token).await;
            match ProcessEvent::from_payload(&payload) {
                ProcessEvent::Data { kind: OutputKind::Stdout, data } => exit.stdout.push_str(&data),
                ProcessEvent::Data { kind: OutputKind::Stderr, data } => exit.stderr.push_str(&data),
                ProcessEvent::Exit { status, signal } => {
                    exit.status = status;
                    exit.signal = signal;
                    return exit;
                }
                ProcessEvent::Other(_) => {}
            }
        }
    }
}

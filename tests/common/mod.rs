#![allow(dead_code)]

//! In-process stand-in for the process service: `POST /api/process`,
//! `DELETE /api/process/{token}` and the `/api/process/notify` socket.
//!
//! Like the real service it emits `processStart` before answering the POST
//! and replays the messages of live processes to every new socket.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use procmux::ClientConfig;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

#[derive(Default)]
struct Processes {
    /// Messages per token in send order, replayed to new sockets.
    history: Vec<(String, Value)>,
    started: HashSet<String>,
    exited: HashSet<String>,
}

struct MockState {
    token: Option<String>,
    frames: broadcast::Sender<Value>,
    kick: broadcast::Sender<()>,
    processes: Mutex<Processes>,
    /// Forced reply for the next POSTs, e.g. `(403, "quota_reached")`.
    post_failure: Mutex<Option<(StatusCode, String)>>,
    /// Canned output emitted after each start, keyed by the first command word.
    scripts: Mutex<HashMap<String, Vec<Value>>>,
    /// When set, POSTs ignore the client's token and get `{prefix}-{n}`.
    assigned_prefix: Mutex<Option<String>>,
    posts: AtomicUsize,
    deletes: AtomicUsize,
    connections: AtomicUsize,
    last_post: Mutex<Option<Value>>,
}

pub struct MockServer {
    pub addr: SocketAddr,
    state: Arc<MockState>,
}

impl MockServer {
    pub async fn start() -> Self {
        Self::start_with_token(None).await
    }

    /// Require `Authorization: Bearer {token}` on every route.
    pub async fn start_with_token(token: Option<&str>) -> Self {
        let state = Arc::new(MockState {
            token: token.map(str::to_string),
            frames: broadcast::channel(256).0,
            kick: broadcast::channel(4).0,
            processes: Mutex::new(Processes::default()),
            post_failure: Mutex::new(None),
            scripts: Mutex::new(HashMap::new()),
            assigned_prefix: Mutex::new(None),
            posts: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            connections: AtomicUsize::new(0),
            last_post: Mutex::new(None),
        });

        let app = Router::new()
            .route("/api/process", post(start_process))
            .route("/api/process/{token}", delete(kill_process))
            .route("/api/process/notify", get(notify_socket))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Client config pointing at this server, with fast reconnects.
    pub fn config(&self) -> ClientConfig {
        let mut config = ClientConfig::with_base_url(self.base_url());
        config.token = self.state.token.clone();
        config.reconnect.initial_ms = 20;
        config.reconnect.max_ms = 200;
        config
    }

    /// Send `frame` to every open socket and keep it for replay.
    pub fn push(&self, frame: Value) {
        emit(&self.state, frame);
    }

    /// Send a raw text frame without recording it.
    pub fn push_raw(&self, text: &str) {
        let _ = self.state.frames.send(Value::String(text.to_string()));
    }

    /// Drop every open socket.
    pub fn kick(&self) {
        let _ = self.state.kick.send(());
    }

    pub fn fail_posts(&self, code: StatusCode, status: &str) {
        *self.state.post_failure.lock() = Some((code, status.to_string()));
    }

    /// Emit `messages` (each gets the token added) after starting a process
    /// whose command begins with `program`.
    pub fn script(&self, program: &str, messages: Vec<Value>) {
        self.state.scripts.lock().insert(program.to_string(), messages);
    }

    /// Answer every later POST with a server-chosen token.
    pub fn assign_tokens(&self, prefix: &str) {
        *self.state.assigned_prefix.lock() = Some(prefix.to_string());
    }

    pub fn posts(&self) -> usize {
        self.state.posts.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.state.deletes.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn last_post(&self) -> Option<Value> {
        self.state.last_post.lock().clone()
    }

    /// Wait until at least `n` sockets have been accepted.
    pub async fn wait_connections(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.connections() < n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("socket should connect");
    }
}

fn emit(state: &MockState, frame: Value) {
    let mut procs = state.processes.lock();
    if let Some(token) = frame.get("token").and_then(Value::as_str) {
        if frame.get("notify").and_then(Value::as_str) == Some("processExit") {
            procs.exited.insert(token.to_string());
        }
        procs.history.push((token.to_string(), frame.clone()));
    }
    let _ = state.frames.send(frame);
}

fn status(code: StatusCode, status: &str) -> Response {
    (code, Json(json!({ "status": status }))).into_response()
}

fn authorized(state: &MockState, headers: &HeaderMap) -> bool {
    match &state.token {
        None => true,
        Some(token) => headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == format!("Bearer {}", token)),
    }
}

async fn start_process(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    state.posts.fetch_add(1, Ordering::SeqCst);
    *state.last_post.lock() = Some(body.clone());

    if !authorized(&state, &headers) {
        return status(StatusCode::FORBIDDEN, "forbidden");
    }
    if let Some((code, reason)) = state.post_failure.lock().clone() {
        return status(code, &reason);
    }

    let present = |key: &str| body.get(key).is_some_and(|v| !v.is_null());
    if present("command") && present("action") {
        return status(StatusCode::BAD_REQUEST, "make_up_your_mind");
    }
    let token = match body.get("token").and_then(Value::as_str) {
        Some(token) if !token.is_empty() => token.to_string(),
        _ => return status(StatusCode::BAD_REQUEST, "missing_token"),
    };
    let token = match state.assigned_prefix.lock().clone() {
        Some(prefix) => format!("{}-{}", prefix, state.posts.load(Ordering::SeqCst)),
        None => token,
    };
    if !state.processes.lock().started.insert(token.clone()) {
        return status(StatusCode::BAD_REQUEST, "process_exists");
    }

    let command = match body.get("action").and_then(Value::as_str) {
        Some(action) => json!([action]),
        None => body.get("command").cloned().unwrap_or(Value::Null),
    };
    emit(
        &state,
        json!({
            "notify": "processStart",
            "token": token,
            "command": command,
            "extraData": body.get("extraData").cloned().unwrap_or(Value::Null),
        }),
    );

    let program = command
        .get(0)
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_default();
    let script = state.scripts.lock().get(&program).cloned();
    if let Some(messages) = script {
        for mut message in messages {
            message["token"] = json!(token);
            emit(&state, message);
        }
    }

    (StatusCode::OK, Json(json!({ "status": "ok", "token": token }))).into_response()
}

async fn kill_process(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Path(token): Path<String>,
) -> Response {
    state.deletes.fetch_add(1, Ordering::SeqCst);
    if !authorized(&state, &headers) {
        return status(StatusCode::FORBIDDEN, "forbidden");
    }

    let live = {
        let procs = state.processes.lock();
        procs.started.contains(&token) && !procs.exited.contains(&token)
    };
    if !live {
        return status(StatusCode::NOT_FOUND, "notfound");
    }
    emit(
        &state,
        json!({"notify": "processExit", "token": token, "status": null, "signal": "TERM"}),
    );
    status(StatusCode::OK, "ok")
}

async fn notify_socket(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !authorized(&state, &headers) {
        return status(StatusCode::FORBIDDEN, "forbidden");
    }

    // Snapshot and subscribe under the same lock `emit` holds, so every
    // frame is either replayed or broadcast, never both.
    let kick = state.kick.subscribe();
    let (replay, frames): (Vec<Value>, _) = {
        let procs = state.processes.lock();
        let frames = state.frames.subscribe();
        let replay = procs
            .history
            .iter()
            .filter(|(token, _)| !procs.exited.contains(token))
            .map(|(_, frame)| frame.clone())
            .collect();
        (replay, frames)
    };
    state.connections.fetch_add(1, Ordering::SeqCst);

    ws.on_upgrade(move |socket| serve_socket(socket, replay, frames, kick))
}

async fn serve_socket(
    mut socket: WebSocket,
    replay: Vec<Value>,
    mut frames: broadcast::Receiver<Value>,
    mut kick: broadcast::Receiver<()>,
) {
    for frame in replay {
        if socket.send(Message::Text(frame.to_string().into())).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            frame = frames.recv() => {
                let text = match frame {
                    Ok(Value::String(raw)) => raw,
                    Ok(frame) => frame.to_string(),
                    Err(_) => return,
                };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    return;
                }
            }
            _ = kick.recv() => return,
            msg = socket.recv() => {
                if !matches!(msg, Some(Ok(_))) {
                    return;
                }
            }
        }
    }
}

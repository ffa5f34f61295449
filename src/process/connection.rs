use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::MaybeTlsStream;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::ReconnectConfig;
use crate::error::ClientError;

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// State of the notification socket. There is no terminal state: a closed
/// socket is always reopened after the current backoff delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    /// Socket is down; the next attempt starts after `delay`.
    Retrying { delay: Duration },
}

/// Exponential reconnect delay: starts at `floor`, doubles on every
/// consecutive failure, capped at `cap`, back to `floor` on any inbound frame.
#[derive(Debug, Clone)]
pub struct Backoff {
    floor: Duration,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(floor: Duration, cap: Duration) -> Self {
        Self {
            floor,
            cap: cap.max(floor),
            current: floor,
        }
    }

    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(config.initial(), config.max())
    }

    /// Delay to wait before the next attempt; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.cap);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.floor;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&ReconnectConfig::default())
    }
}

/// Build the upgrade request, with a bearer header if a token is configured.
pub(crate) fn handshake_request(url: &Url, token: Option<&str>) -> Result<Request, ClientError> {
    let mut request = url.as_str().into_client_request()?;
    if let Some(tok) = token {
        let value = HeaderValue::from_str(&format!("Bearer {}", tok))
            .map_err(|e| ClientError::WebSocket(e.to_string()))?;
        request.headers_mut().insert("Authorization", value);
    }
    Ok(request)
}

/// Keep the notification socket open until `cancel` fires.
///
/// Every text frame is handed to `on_text`. Binary frames are forwarded too
/// when they hold valid UTF-8.
pub(crate) async fn connection_loop<F>(
    url: Url,
    token: Option<String>,
    reconnect: ReconnectConfig,
    state_tx: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
    mut on_text: F,
) where
    F: FnMut(&str) + Send,
{
    let mut backoff = Backoff::from_config(&reconnect);

    loop {
        if cancel.is_cancelled() {
            break;
        }

        state_tx.send_replace(ConnectionState::Connecting);
        tracing::debug!(url = %url, "connecting notification socket");

        let connect_result = match handshake_request(&url, token.as_deref()) {
            Ok(request) => {
                tokio::select! {
                    result = tokio_tungstenite::connect_async(request) => result.map_err(ClientError::from),
                    _ = cancel.cancelled() => break,
                }
            }
            Err(e) => Err(e),
        };

        match connect_result {
            Ok((ws_stream, _)) => {
                state_tx.send_replace(ConnectionState::Open);
                tracing::info!(url = %url, "notification socket open");

                run_connection(ws_stream, &mut backoff, &cancel, &mut on_text).await;

                if cancel.is_cancelled() {
                    break;
                }
                tracing::warn!(url = %url, "notification socket closed");
            }
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "connection failed");
            }
        }

        let delay = backoff.next_delay();
        state_tx.send_replace(ConnectionState::Retrying { delay });
        tracing::debug!(delay_ms = delay.as_millis() as u64, "scheduling reconnect");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => break,
        }
    }

    state_tx.send_replace(ConnectionState::Disconnected);
    tracing::debug!(url = %url, "connection task stopped");
}

async fn run_connection<F>(
    ws_stream: WsStream,
    backoff: &mut Backoff,
    cancel: &CancellationToken,
    on_text: &mut F,
) where
    F: FnMut(&str),
{
    let (mut sink, mut stream) = ws_stream.split();

    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        // Any frame proves the server is alive.
                        backoff.reset();
                        on_text(&text);
                    }
                    Some(Ok(Message::Binary(data))) => {
                        backoff.reset();
                        match std::str::from_utf8(&data) {
                            Ok(text) => on_text(text),
                            Err(_) => tracing::warn!(len = data.len(), "dropping non-UTF-8 binary frame"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        backoff.reset();
                        if sink.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => backoff.reset(),
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "notification socket error");
                        break;
                    }
                }
            }
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::default();
        let delays: Vec<u64> = (0..9).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1600, 3200, 5000, 5000, 5000]);
    }

    #[test]
    fn backoff_reset_returns_to_floor() {
        let mut backoff = Backoff::default();
        for _ in 0..3 {
            backoff.next_delay();
        }
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
    }

    #[test]
    fn handshake_request_carries_bearer_token() {
        let url = Url::parse("ws://127.0.0.1:1/api/process/notify").unwrap();
        let request = handshake_request(&url, Some("tok")).unwrap();
        assert_eq!(request.headers()["Authorization"], "Bearer tok");

        let request = handshake_request(&url, None).unwrap();
        assert!(request.headers().get("Authorization").is_none());
    }

    /// Server that sends `frames` on every connection, then hangs up.
    async fn spawn_flaky_server(frames: Vec<&'static str>) -> (std::net::SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let frames = frames.clone();
                tokio::spawn(async move {
                    if let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await {
                        for f in frames {
                            let _ = ws.send(Message::Text(f.to_string().into())).await;
                        }
                        let _ = ws.close(None).await;
                    }
                });
            }
        });
        (addr, accepted)
    }

    #[tokio::test]
    async fn delivers_frames_and_reconnects_after_close() {
        let (addr, accepted) = spawn_flaky_server(vec!["one", "two"]).await;
        let url = Url::parse(&format!("ws://{}/notify", addr)).unwrap();
        let (state_tx, _state_rx) = watch::channel(ConnectionState::Disconnected);
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        let task = tokio::spawn(connection_loop(
            url,
            None,
            ReconnectConfig::default(),
            state_tx,
            cancel.clone(),
            move |text| {
                let _ = tx.send(text.to_string());
            },
        ));

        let mut got = Vec::new();
        timeout(Duration::from_secs(5), async {
            while got.len() < 4 {
                got.push(rx.recv().await.unwrap());
            }
        })
        .await
        .expect("frames from two connections");
        assert_eq!(got, vec!["one", "two", "one", "two"]);
        assert!(accepted.load(Ordering::SeqCst) >= 2);

        cancel.cancel();
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn inbound_frame_resets_reconnect_delay() {
        // Refuse the first three handshakes, then say one thing per socket.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut refused = 0;
            while let Ok((stream, _)) = listener.accept().await {
                if refused < 3 {
                    refused += 1;
                    drop(stream);
                    continue;
                }
                tokio::spawn(async move {
                    if let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await {
                        let _ = ws.send(Message::Text("alive".to_string().into())).await;
                        let _ = ws.close(None).await;
                    }
                });
            }
        });

        let url = Url::parse(&format!("ws://{}/notify", addr)).unwrap();
        let (state_tx, mut state_rx) = watch::channel(ConnectionState::Disconnected);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(connection_loop(
            url,
            None,
            ReconnectConfig::default(),
            state_tx,
            cancel.clone(),
            |_| {},
        ));

        let mut delays = Vec::new();
        timeout(Duration::from_secs(5), async {
            while delays.len() < 4 {
                state_rx.changed().await.unwrap();
                if let ConnectionState::Retrying { delay } = *state_rx.borrow_and_update() {
                    delays.push(delay.as_millis() as u64);
                }
            }
        })
        .await
        .expect("should schedule four reconnects");
        assert_eq!(delays, vec![100, 200, 400, 100]);

        cancel.cancel();
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn keeps_retrying_unreachable_server_until_cancelled() {
        // Bind then drop to get a port nobody listens on.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let url = Url::parse(&format!("ws://{}/notify", addr)).unwrap();
        let (state_tx, mut state_rx) = watch::channel(ConnectionState::Disconnected);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(connection_loop(
            url,
            None,
            ReconnectConfig::default(),
            state_tx,
            cancel.clone(),
            |_| {},
        ));

        // Observe at least two connection attempts.
        let mut attempts = 0;
        timeout(Duration::from_secs(5), async {
            while attempts < 2 {
                state_rx.changed().await.unwrap();
                if *state_rx.borrow_and_update() == ConnectionState::Connecting {
                    attempts += 1;
                }
            }
        })
        .await
        .expect("should retry");

        cancel.cancel();
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(*state_rx.borrow(), ConnectionState::Disconnected);
    }
}

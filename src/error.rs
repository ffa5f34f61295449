use thiserror::Error;

/// Errors surfaced by the process client.
///
/// Transport failures on the notification socket never appear here; the
/// connection task recovers from them on its own.
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    /// Both a command and an action were given to a process start. This is a
    /// caller bug and is raised before any request is sent.
    #[error("command and action are mutually exclusive")]
    ConflictingLaunch,

    /// The process API answered with a non-success status. Displays as the
    /// server's status keyword, verbatim.
    #[error("{status}")]
    Remote { code: u16, status: String },

    #[error("http error: {0}")]
    Http(String),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error("unsupported url scheme: {0}")]
    UnsupportedScheme(String),

    #[error("websocket request error: {0}")]
    WebSocket(String),

    #[error("trigger {0} is not registered")]
    UnregisteredTrigger(String),

    /// A registered handler returned an error or panicked.
    #[error("handler for {trigger} failed: {message}")]
    Handler { trigger: String, message: String },

    #[error("client is shut down")]
    Closed,
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            ClientError::Http(format!("could not connect to process api: {}", e))
        } else if e.is_timeout() {
            ClientError::Http(format!("process api timed out: {}", e))
        } else {
            ClientError::Http(e.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::WebSocket(e.to_string())
    }
}

impl ClientError {
    /// Status keyword reported by the server, if this is a remote failure.
    pub fn remote_status(&self) -> Option<&str> {
        match self {
            ClientError::Remote { status, .. } => Some(status),
            _ => None,
        }
    }
}

//! Wire types for the process notification socket and the process HTTP API.
//!
//! Inbound WebSocket frames are UTF-8 JSON objects of two shapes:
//!
//! - `{"notify": "processStart", "token": ..., "command": ..., "extraData": ...}`
//!   announces a new remote process.
//! - `{"token": ..., ...payload}` belongs to the stream of an existing process.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Value of the `notify` key that announces a new process.
pub const PROCESS_START: &str = "processStart";

const PROCESS_DATA: &str = "processData";
const PROCESS_EXIT: &str = "processExit";

/// Server-issued identifier of one remote process.
pub type Token = String;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("frame has no string token")]
    MissingToken,
}

/// Metadata attached to processes started through the event manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtraData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
    #[serde(default)]
    pub args: Value,
}

impl ExtraData {
    pub fn trigger(name: impl Into<String>, args: Value) -> Self {
        Self {
            trigger: Some(name.into()),
            args,
        }
    }
}

/// Client-side record of one remote process. Created once per token.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub token: Token,
    pub command: Value,
    pub extra_data: Option<ExtraData>,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    ProcessStart(Program),
    /// Payload for an existing process. `payload` is the whole frame object,
    /// token included.
    Message { token: Token, payload: Value },
}

impl Frame {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        Self::try_from(value)
    }
}

impl TryFrom<Value> for Frame {
    type Error = ProtocolError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let obj = value.as_object().ok_or(ProtocolError::NotAnObject)?;
        let token = obj
            .get("token")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingToken)?
            .to_string();

        if obj.get("notify").and_then(Value::as_str) != Some(PROCESS_START) {
            return Ok(Frame::Message {
                token,
                payload: value,
            });
        }

        let command = obj.get("command").cloned().unwrap_or(Value::Null);
        // extraData is whatever the starting client sent; a shape we do not
        // understand still announces a process.
        let extra_data = match obj.get("extraData") {
            None | Some(Value::Null) => None,
            Some(raw) => match serde_json::from_value(raw.clone()) {
                Ok(extra) => Some(extra),
                Err(e) => {
                    tracing::warn!(token = %token, error = %e, "ignoring undecodable extraData");
                    None
                }
            },
        };
        Ok(Frame::ProcessStart(Program {
            token,
            command,
            extra_data,
        }))
    }
}

/// Body of `POST /api/process`.
///
/// Exactly one of `command` / `action` is expected; the manager enforces
/// that before building the request.
#[derive(Debug, Clone, Serialize)]
pub struct StartRequest {
    pub token: Token,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<Value>,
    #[serde(rename = "extraData")]
    pub extra_data: Option<ExtraData>,
}

/// Success body of `POST /api/process`.
#[derive(Debug, Clone, Deserialize)]
pub struct StartResponse {
    pub token: Token,
}

/// Failure body of the process API. `status` is an error keyword such as
/// `quota_reached` or `notfound`.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Stdout,
    Stderr,
}

/// Typed view of a per-process message.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    Data { kind: OutputKind, data: String },
    Exit {
        status: Option<i64>,
        signal: Option<String>,
    },
    Other(Value),
}

impl ProcessEvent {
    pub fn from_payload(payload: &Value) -> Self {
        match payload.get("notify").and_then(Value::as_str) {
            Some(PROCESS_DATA) => {
                let kind = payload
                    .get("kind")
                    .cloned()
                    .and_then(|k| serde_json::from_value(k).ok());
                let data = payload.get("data").and_then(Value::as_str);
                match (kind, data) {
                    (Some(kind), Some(data)) => ProcessEvent::Data {
                        kind,
                        data: data.to_string(),
                    },
                    _ => ProcessEvent::Other(payload.clone()),
                }
            }
            Some(PROCESS_EXIT) => ProcessEvent::Exit {
                status: payload.get("status").and_then(Value::as_i64),
                signal: payload
                    .get("signal")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            },
            _ => ProcessEvent::Other(payload.clone()),
        }
    }
}

//! Client for a remote process service.
//!
//! Processes are started with `POST /api/process` and mirrored locally from
//! one notification WebSocket. [`ProcessManager`] keeps the registry of
//! started processes and per-process message queues; [`EventManager`] runs
//! named trigger handlers for processes tagged with `extraData.trigger`.

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod notify;
pub mod process;
pub mod protocol;

pub use client::Client;
pub use config::ClientConfig;
pub use error::ClientError;
pub use events::{Dispatch, EventManager, Gate};
pub use notify::AsyncNotify;
pub use process::{ConnectionState, ProcessExit, ProcessManager};
pub use protocol::{ExtraData, Frame, Program, Token};

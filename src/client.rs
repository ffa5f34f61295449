//! Session context: one process manager and one event manager sharing a
//! single notification socket.

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::events::EventManager;
use crate::process::ProcessManager;

/// Owns the manager pair for one authenticated session.
///
/// Build it with [`Client::new`], register trigger handlers on
/// [`events`](Self::events), then call [`start`](Self::start).
#[derive(Clone)]
pub struct Client {
    processes: ProcessManager,
    events: EventManager,
}

impl Client {
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        let processes = ProcessManager::new(config)?;
        let events = EventManager::new(processes.clone());
        Ok(Self { processes, events })
    }

    /// Build, open the socket and start dispatching. Handlers registered
    /// after this see only processes that arrive later.
    pub fn connect(config: &ClientConfig) -> Result<Self, ClientError> {
        let client = Self::new(config)?;
        client.start();
        Ok(client)
    }

    /// Open the notification socket and start the dispatch task.
    pub fn start(&self) {
        self.processes.connect();
        self.events.start();
    }

    pub fn processes(&self) -> &ProcessManager {
        &self.processes
    }

    pub fn events(&self) -> &EventManager {
        &self.events
    }

    /// Stop dispatching, then close the socket.
    pub async fn shutdown(&self) {
        self.events.shutdown().await;
        self.processes.shutdown().await;
        tracing::debug!("client shut down");
    }
}

//! Trigger dispatch on top of the process registry.
//!
//! A process started through [`EventManager::run`] carries
//! `extraData = {trigger, args}`. When its start frame arrives, the dispatch
//! task looks up the handler registered for `trigger`, runs it if the current
//! [`Gate`] allows that name, and hands the outcome to whoever is awaiting
//! `run()` for that token. Processes whose trigger is not allowed yet are
//! parked in a deferred queue and replayed, in order, by
//! [`EventManager::set_allowed_handler`].

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use regex::Regex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::ClientError;
use crate::notify::AsyncNotify;
use crate::process::ProcessManager;
use crate::protocol::{ExtraData, Program, Token};

/// What a handler produced, as delivered to the matching `run()` call.
pub type Outcome = Result<Value, ClientError>;

type Handler = Arc<dyn Fn(Value, Program) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Which trigger names may run right now.
#[derive(Debug, Clone)]
pub enum Gate {
    Restricted(Regex),
    Open,
}

impl Gate {
    /// Matches nothing. The initial state.
    pub fn deny_all() -> Self {
        Gate::Restricted(Regex::new("^$").expect("static pattern"))
    }

    pub fn pattern(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Gate::Restricted(Regex::new(pattern)?))
    }

    pub fn allows(&self, trigger: &str) -> bool {
        match self {
            Gate::Restricted(re) => re.is_match(trigger),
            Gate::Open => true,
        }
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::deny_all()
    }
}

/// Result of offering one process to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Carries no trigger; not started through [`EventManager::run`].
    Ignored,
    /// Trigger not allowed by the current gate; queued for replay.
    Deferred,
    /// Handler ran and its outcome was delivered.
    Handled,
}

enum Admission {
    Ignore,
    Defer,
    Run {
        trigger: String,
        args: Value,
        handler: Handler,
    },
}

struct State {
    handlers: HashMap<String, Handler>,
    gate: Gate,
    deferred: Vec<Program>,
    waiting: HashMap<Token, AsyncNotify<Outcome>>,
    /// `run()` calls whose start request has not answered yet.
    posting: usize,
    /// Outcomes nobody was waiting for, kept while a start request is in
    /// flight in case the server answers with a token of its own.
    unclaimed: HashMap<Token, Outcome>,
}

struct Inner {
    processes: ProcessManager,
    state: Mutex<State>,
    cancel: CancellationToken,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Maps trigger names to handlers and correlates `run()` calls with their
/// handler's outcome. Clones share state.
#[derive(Clone)]
pub struct EventManager {
    inner: Arc<Inner>,
}

impl EventManager {
    pub fn new(processes: ProcessManager) -> Self {
        Self {
            inner: Arc::new(Inner {
                processes,
                state: Mutex::new(State {
                    handlers: HashMap::new(),
                    gate: Gate::deny_all(),
                    deferred: Vec::new(),
                    waiting: HashMap::new(),
                    posting: 0,
                    unclaimed: HashMap::new(),
                }),
                cancel: CancellationToken::new(),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn processes(&self) -> &ProcessManager {
        &self.inner.processes
    }

    /// Install `handler` for trigger `name`. Register everything before
    /// [`start`](Self::start); a trigger whose process was already offered
    /// before registration is reported as unregistered.
    pub fn register<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Value, Program) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |args, program| handler(args, program).boxed());
        self.inner.state.lock().handlers.insert(name.into(), handler);
    }

    /// Start consuming processes in a background task: first every process
    /// already known, then each new arrival. Does nothing if already started.
    pub fn start(&self) {
        let mut task = self.inner.task.lock();
        if task.is_some() || self.inner.cancel.is_cancelled() {
            return;
        }
        let em = self.clone();
        *task = Some(tokio::spawn(async move { em.supervise().await }));
    }

    /// Stop the dispatch task. In-flight handlers run to completion.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    pub fn gate(&self) -> Gate {
        self.inner.state.lock().gate.clone()
    }

    /// Tokens of processes waiting for the gate to open, in queue order.
    pub fn deferred(&self) -> Vec<Token> {
        self.inner
            .state
            .lock()
            .deferred
            .iter()
            .map(|p| p.token.clone())
            .collect()
    }

    /// Replace the gate, then replay the deferred queue in its original order.
    ///
    /// The swap and the admission of every queued process happen under one
    /// lock, so entries the new gate still refuses stay queued in order and
    /// nothing deferred concurrently can slip between them. Admitted handlers
    /// then run one after another with no lock held; a handler may change the
    /// gate again.
    pub async fn set_allowed_handler(&self, gate: Gate) {
        let admitted = {
            let mut state = self.inner.state.lock();
            tracing::debug!(?gate, deferred = state.deferred.len(), "changing allowed handlers");
            state.gate = gate;
            let queued = std::mem::take(&mut state.deferred);

            let mut admitted = Vec::new();
            for program in queued {
                match admit_locked(&mut state, &program) {
                    Ok(Admission::Run {
                        trigger,
                        args,
                        handler,
                    }) => admitted.push((trigger, args, handler, program)),
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!(token = %program.token, error = %e, "dropping deferred process");
                    }
                }
            }
            admitted
        };

        for (trigger, args, handler, program) in admitted {
            self.invoke(trigger, args, handler, program).await;
        }
    }

    /// Offer one process to the dispatcher and, if allowed, run its handler
    /// to completion.
    ///
    /// Handler failures are not errors here: they are delivered to the
    /// matching `run()` call as [`ClientError::Handler`]. The only error is an
    /// unregistered trigger.
    pub async fn handle_proc(&self, program: Program) -> Result<Dispatch, ClientError> {
        match self.admit(&program)? {
            Admission::Ignore => Ok(Dispatch::Ignored),
            Admission::Defer => Ok(Dispatch::Deferred),
            Admission::Run {
                trigger,
                args,
                handler,
            } => {
                self.invoke(trigger, args, handler, program).await;
                Ok(Dispatch::Handled)
            }
        }
    }

    /// Start a remote process tagged with trigger `name` and wait for the
    /// outcome of its handler.
    ///
    /// Errors from starting the process (conflicting command/action, HTTP
    /// failure) are returned directly; a failing handler comes back as
    /// [`ClientError::Handler`]. After [`shutdown`](Self::shutdown) the call
    /// fails with [`ClientError::Closed`].
    pub async fn run(
        &self,
        name: &str,
        args: Option<Value>,
        command: Option<Value>,
        action: Option<Value>,
    ) -> Outcome {
        if self.inner.cancel.is_cancelled() {
            return Err(ClientError::Closed);
        }
        tracing::debug!(trigger = %name, "running trigger");
        let extra = ExtraData::trigger(name, args.unwrap_or(Value::Null));

        // Listen before the request goes out: the start frame can beat the
        // HTTP response.
        let requested = uuid::Uuid::new_v4().to_string();
        let outcome = self.expect(&requested);

        let posting = Posting::begin(&self.inner);
        let assigned = match self
            .inner
            .processes
            .run_with_token(requested.clone(), command, action, Some(extra))
            .await
        {
            Ok(token) => token,
            Err(e) => {
                self.inner.state.lock().waiting.remove(&requested);
                return Err(e);
            }
        };

        if assigned != requested {
            tracing::debug!(requested = %requested, assigned = %assigned, "server assigned a different token");
            let mut state = self.inner.state.lock();
            state.waiting.remove(&requested);
            // The handler may already have finished under the new token.
            if let Some(early) = state.unclaimed.remove(&assigned) {
                return early;
            }
            state.waiting.insert(assigned.clone(), outcome.clone());
        }
        drop(posting);

        let result = tokio::select! {
            result = outcome.wait() => result,
            _ = self.inner.cancel.cancelled() => Err(ClientError::Closed),
        };
        self.inner.state.lock().waiting.remove(&assigned);
        result
    }

    /// Register a correlation waiter for `token`.
    pub(crate) fn expect(&self, token: &str) -> AsyncNotify<Outcome> {
        self.inner
            .state
            .lock()
            .waiting
            .entry(token.to_string())
            .or_default()
            .clone()
    }

    /// Gate and handler lookup, done synchronously so queueing order follows
    /// arrival order.
    fn admit(&self, program: &Program) -> Result<Admission, ClientError> {
        admit_locked(&mut self.inner.state.lock(), program)
    }

    async fn invoke(&self, trigger: String, args: Value, handler: Handler, program: Program) {
        let token = program.token.clone();
        tracing::debug!(token = %token, trigger = %trigger, "invoking handler");

        let result = AssertUnwindSafe(handler(args, program)).catch_unwind().await;
        let outcome = match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                tracing::debug!(token = %token, trigger = %trigger, error = %e, "handler failed");
                Err(ClientError::Handler {
                    trigger,
                    message: format!("{:#}", e),
                })
            }
            Err(panic) => {
                tracing::error!(token = %token, trigger = %trigger, "handler panicked");
                Err(ClientError::Handler {
                    trigger,
                    message: panic_message(&*panic),
                })
            }
        };

        let mut state = self.inner.state.lock();
        match state.waiting.get(&token) {
            Some(waiting) => waiting.notify(outcome),
            None if state.posting > 0 => {
                state.unclaimed.insert(token, outcome);
            }
            None => {}
        }
    }

    /// Run the dispatch loop, restarting it from its cursor if it panics.
    async fn supervise(&self) {
        let mut cursor = 0usize;
        loop {
            let result = AssertUnwindSafe(self.listen(&mut cursor)).catch_unwind().await;
            match result {
                Ok(()) => break,
                Err(e) => {
                    tracing::error!(cursor, "dispatch loop panicked, restarting: {}", panic_message(&*e));
                }
            }
        }
        tracing::debug!("dispatch loop stopped");
    }

    async fn listen(&self, cursor: &mut usize) {
        tracing::debug!("starting event dispatch");
        loop {
            // Catch up on everything that arrived since the last pass; the
            // "any new process" signal only remembers the latest arrival.
            for program in self.inner.processes.programs_since(*cursor) {
                *cursor += 1;
                self.offer(program);
            }

            tokio::select! {
                _ = self.inner.processes.next_program() => {}
                _ = self.inner.cancel.cancelled() => return,
            }
        }
    }

    /// Admit `program` in order, then run its handler concurrently.
    fn offer(&self, program: Program) {
        match self.admit(&program) {
            Ok(Admission::Run {
                trigger,
                args,
                handler,
            }) => {
                let em = self.clone();
                tokio::spawn(async move { em.invoke(trigger, args, handler, program).await });
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(token = %program.token, error = %e, "skipping process");
            }
        }
    }
}

/// Marks a start request in flight. Unclaimed outcomes are only kept while
/// at least one is.
struct Posting<'a> {
    inner: &'a Inner,
}

impl<'a> Posting<'a> {
    fn begin(inner: &'a Inner) -> Self {
        inner.state.lock().posting += 1;
        Self { inner }
    }
}

impl Drop for Posting<'_> {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.posting -= 1;
        if state.posting == 0 {
            state.unclaimed.clear();
        }
    }
}

/// Gate check and handler lookup against already-locked state.
fn admit_locked(state: &mut State, program: &Program) -> Result<Admission, ClientError> {
    let trigger = match program.extra_data.as_ref().and_then(|e| e.trigger.as_ref()) {
        Some(trigger) => trigger.clone(),
        None => return Ok(Admission::Ignore),
    };

    if !state.gate.allows(&trigger) {
        tracing::debug!(token = %program.token, trigger = %trigger, "deferring process");
        state.deferred.push(program.clone());
        return Ok(Admission::Defer);
    }

    let handler = state
        .handlers
        .get(&trigger)
        .cloned()
        .ok_or_else(|| ClientError::UnregisteredTrigger(trigger.clone()))?;
    let args = program
        .extra_data
        .as_ref()
        .map(|e| e.args.clone())
        .unwrap_or(Value::Null);
    Ok(Admission::Run {
        trigger,
        args,
        handler,
    })
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

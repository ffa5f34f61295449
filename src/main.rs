//! procmux - watch and drive processes on a remote process service.
//!
//! `procmux watch` mirrors every process start and message as JSON lines,
//! `procmux run -- CMD...` starts a process and streams its output,
//! `procmux kill TOKEN` terminates one, and `procmux config` stores the
//! current `--url`/`--token` in the config file.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use procmux::config::{default_config_path, ConfigError};
use procmux::protocol::{ExtraData, OutputKind, ProcessEvent};
use procmux::{ClientConfig, ClientError, ProcessManager, Program};
use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// procmux - client for a remote process service
#[derive(Parser, Debug)]
#[command(name = "procmux", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Server base URL (overrides the config file)
    #[arg(long, env = "PROCMUX_URL", global = true)]
    url: Option<String>,

    /// Bearer token (overrides the config file)
    #[arg(long, env = "PROCMUX_TOKEN", global = true)]
    token: Option<String>,

    /// Config file path
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print every process start and message as JSON lines
    Watch,

    /// Start a process and stream its output until it exits
    Run {
        /// Named server-side action instead of a command
        #[arg(long, conflicts_with = "command")]
        action: Option<String>,

        /// Trigger name to tag the process with
        #[arg(long)]
        trigger: Option<String>,

        /// JSON arguments for the trigger
        #[arg(long, requires = "trigger")]
        args: Option<String>,

        /// Seconds to wait for the notification socket before giving up
        #[arg(long, default_value_t = 10)]
        connect_timeout: u64,

        /// Command and arguments
        #[arg(last = true)]
        command: Vec<String>,
    },

    /// Terminate a process
    Kill {
        /// Token of the process to terminate
        token: String,
    },

    /// Write the effective settings to the config file
    Config,
}

#[derive(Error, Debug)]
enum CliError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Client(#[from] ClientError),

    #[error("invalid --args: {0}")]
    Args(#[from] serde_json::Error),

    #[error("nothing to run: give a command after -- or --action")]
    NothingToRun,

    #[error("notification socket did not open within {0}s")]
    ConnectTimeout(u64),

    #[error("no config directory; pass --config")]
    NoConfigPath,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("procmux: {}", e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32, CliError> {
    let config = load_config(&cli)?;
    let path = config_path(&cli);
    // Also validates the URLs before they are saved.
    let manager = ProcessManager::new(&config)?;

    match cli.command {
        Commands::Watch => run_watch(manager).await,
        Commands::Run {
            action,
            trigger,
            args,
            connect_timeout,
            command,
        } => run_process(manager, action, trigger, args, connect_timeout, command).await,
        Commands::Kill { token } => {
            manager.terminate(&token).await?;
            println!("Process '{}' terminated.", token);
            Ok(0)
        }
        Commands::Config => {
            let path = path.ok_or(CliError::NoConfigPath)?;
            config.save(&path)?;
            println!("{}", path.display());
            Ok(0)
        }
    }
}

fn config_path(cli: &Cli) -> Option<PathBuf> {
    cli.config.clone().or_else(default_config_path)
}

/// Config file first, then flags and environment on top.
fn load_config(cli: &Cli) -> Result<ClientConfig, CliError> {
    let mut config = match config_path(cli) {
        Some(path) => ClientConfig::load(&path)?.unwrap_or_default(),
        None => ClientConfig::default(),
    };
    if let Some(url) = &cli.url {
        config.base_url = url.clone();
    }
    if let Some(token) = &cli.token {
        config.token = Some(token.clone());
    }
    Ok(config)
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "procmux=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

// ── Watch ──────────────────────────────────────────────────────────

async fn run_watch(manager: ProcessManager) -> Result<i32, CliError> {
    manager.connect();

    let mut cursor = 0;
    loop {
        for program in manager.programs_since(cursor) {
            cursor += 1;
            print_start(&program);
            tokio::spawn(forward_messages(manager.clone(), program.token));
        }

        tokio::select! {
            _ = manager.next_program() => {}
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    manager.shutdown().await;
    Ok(0)
}

fn print_start(program: &Program) {
    let line = serde_json::json!({
        "notify": "processStart",
        "token": program.token,
        "command": program.command,
        "extraData": program.extra_data,
    });
    println!("{}", line);
}

async fn forward_messages(manager: ProcessManager, token: String) {
    loop {
        let payload = manager.receive(&token).await;
        println!("{}", payload);
        if matches!(ProcessEvent::from_payload(&payload), ProcessEvent::Exit { .. }) {
            break;
        }
    }
}

// ── Run ────────────────────────────────────────────────────────────

async fn run_process(
    manager: ProcessManager,
    action: Option<String>,
    trigger: Option<String>,
    args: Option<String>,
    connect_timeout: u64,
    command: Vec<String>,
) -> Result<i32, CliError> {
    let command = (!command.is_empty()).then(|| Value::from(command));
    let action = action.map(Value::from);
    if command.is_none() && action.is_none() {
        return Err(CliError::NothingToRun);
    }
    let extra_data = match trigger {
        Some(name) => {
            let args = match args {
                Some(raw) => serde_json::from_str(&raw)?,
                None => Value::Null,
            };
            Some(ExtraData::trigger(name, args))
        }
        None => None,
    };

    manager.connect();
    tokio::time::timeout(Duration::from_secs(connect_timeout), manager.wait_connected())
        .await
        .map_err(|_| CliError::ConnectTimeout(connect_timeout))?;

    let token = manager.run(command, action, extra_data).await?;
    tracing::info!(token = %token, "process started");

    let code = stream_until_exit(&manager, &token).await?;
    manager.shutdown().await;
    Ok(code)
}

async fn stream_until_exit(manager: &ProcessManager, token: &str) -> Result<i32, CliError> {
    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();
    loop {
        let payload = tokio::select! {
            payload = manager.receive(token) => payload,
            _ = tokio::signal::ctrl_c() => {
                manager.terminate(token).await?;
                continue;
            }
        };
        match ProcessEvent::from_payload(&payload) {
            ProcessEvent::Data { kind: OutputKind::Stdout, data } => {
                stdout.write_all(data.as_bytes()).await?;
                stdout.flush().await?;
            }
            ProcessEvent::Data { kind: OutputKind::Stderr, data } => {
                stderr.write_all(data.as_bytes()).await?;
                stderr.flush().await?;
            }
            ProcessEvent::Exit { status, signal } => {
                if let Some(signal) = signal {
                    tracing::info!(token = %token, signal = %signal, "process killed");
                }
                return Ok(exit_code(status));
            }
            ProcessEvent::Other(other) => tracing::debug!(token = %token, %other, "ignoring message"),
        }
    }
}

/// Remote exit status as our own; killed or out-of-range statuses become 1.
fn exit_code(status: Option<i64>) -> i32 {
    status.map_or(1, |s| i32::try_from(s).unwrap_or(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_never_wraps() {
        assert_eq!(exit_code(Some(3)), 3);
        assert_eq!(exit_code(None), 1);
        assert_eq!(exit_code(Some(1 << 32)), 1);
        assert_eq!(exit_code(Some(i64::MIN)), 1);
    }
}

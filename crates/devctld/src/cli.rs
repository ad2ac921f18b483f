//! Command line entry point for the daemon binary.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (foreground)
//! devctld start
//!
//! # Start the daemon (background/daemonized)
//! devctld start -d
//!
//! # Start with an explicit config file
//! devctld start --config ./devctl.toml
//!
//! # Stop the daemon
//! devctld stop
//!
//! # Check daemon status
//! devctld status
//!
//! # Custom socket path
//! DEVCTL_SOCKET=/run/user/1000/devctl.sock devctld start
//!
//! # Enable debug logging
//! RUST_LOG=devctld=debug devctld start
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: stop accepting clients, kill every supervised tree,
//!   then exit

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::DaemonConfig;
use crate::meter::{spawn_usage_logger, ResourceMeter};
use crate::proctable::{ProcessTable, SysinfoTable};
use crate::registry::{spawn_supervisor, SupervisorEvent, SupervisorHandle};
use crate::server::DaemonServer;

/// Upper bound on killing every tree at shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(20);

/// devctl daemon - local dev process supervisor
#[derive(Parser, Debug)]
#[command(name = "devctld", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,

        /// Config file (defaults to <config dir>/devctl/config.toml)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Stop the running daemon
    Stop,
    /// Show daemon status
    Status {
        /// Config file used to locate the socket
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("devctl")
}

/// Returns the path to the PID file.
fn pid_file_path() -> PathBuf {
    state_dir().join("devctld.pid")
}

/// Returns the path to the log file.
fn log_file_path() -> PathBuf {
    state_dir().join("devctld.log")
}

/// Reads the PID from the PID file, if it exists.
fn read_pid() -> Option<u32> {
    let mut file = File::open(pid_file_path()).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

/// Writes the current PID to the PID file.
fn write_pid() -> Result<()> {
    let path = pid_file_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create state directory")?;
    }
    let mut file = File::create(&path).context("Failed to create PID file")?;
    write!(file, "{}", process::id()).context("Failed to write PID")?;
    Ok(())
}

fn remove_pid_file() {
    let _ = fs::remove_file(pid_file_path());
}

fn is_process_running(pid: u32) -> bool {
    SysinfoTable::new().is_alive(pid)
}

/// Checks if the daemon is already running. Removes a stale PID file.
fn is_daemon_running() -> Option<u32> {
    if let Some(pid) = read_pid() {
        if is_process_running(pid) {
            return Some(pid);
        }
        remove_pid_file();
    }
    None
}

/// Sends SIGTERM to the daemon process.
fn stop_daemon(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        let Ok(raw) = libc::pid_t::try_from(pid) else {
            bail!("Invalid daemon pid {}", pid);
        };
        // SAFETY: kill has no memory-safety preconditions
        let result = unsafe { libc::kill(raw, libc::SIGTERM) };
        if result != 0 {
            bail!("Failed to send SIGTERM to process {}", pid);
        }
    }
    #[cfg(not(unix))]
    {
        bail!("Stop command is only supported on Unix systems (pid {pid})");
    }
    Ok(())
}

/// Parses arguments and runs the selected subcommand.
pub fn main() -> Result<()> {
    let args = Args::parse();

    let command = args.command.unwrap_or(Command::Start {
        daemon: false,
        config: None,
    });

    match command {
        Command::Start { daemon, config } => {
            if let Some(pid) = is_daemon_running() {
                eprintln!("Daemon is already running (PID {})", pid);
                eprintln!("Use 'devctld stop' to stop it first.");
                process::exit(1);
            }

            // Config errors surface on the terminal, before forking
            let config = DaemonConfig::load(config.as_deref())?;

            if daemon {
                daemonize()?;
            }

            write_pid()?;
            let result = run_daemon(config);
            remove_pid_file();
            result
        }
        Command::Stop => {
            let Some(pid) = is_daemon_running() else {
                println!("Daemon is not running.");
                return Ok(());
            };

            println!("Stopping daemon (PID {})...", pid);
            stop_daemon(pid)?;

            // Shutdown kills every supervised tree, so allow it some time
            for _ in 0..(SHUTDOWN_GRACE.as_millis() / 100) {
                if !is_process_running(pid) {
                    println!("Daemon stopped.");
                    return Ok(());
                }
                std::thread::sleep(Duration::from_millis(100));
            }

            eprintln!(
                "Daemon did not stop within {} seconds.",
                SHUTDOWN_GRACE.as_secs()
            );
            process::exit(1);
        }
        Command::Status { config } => {
            let Some(pid) = is_daemon_running() else {
                println!("Daemon is not running.");
                process::exit(1);
            };

            println!("Daemon is running (PID {})", pid);
            let socket_path = DaemonConfig::load(config.as_deref())
                .map(|c| c.socket_path())
                .unwrap_or_else(|_| DaemonConfig::default().socket_path());
            if socket_path.exists() {
                println!("Socket: {}", socket_path.display());
            }
            println!("Log: {}", log_file_path().display());
            Ok(())
        }
    }
}

/// Daemonizes the current process.
fn daemonize() -> Result<()> {
    use daemonize::Daemonize;

    let log_path = log_file_path();
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = stdout
        .try_clone()
        .context("Failed to create log file for stderr")?;

    Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize")?;

    Ok(())
}

/// Runs the daemon (async entry point).
#[tokio::main]
async fn run_daemon(config: DaemonConfig) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("devctld=info".parse()?)
                .add_directive("devctl_core=info".parse()?)
                .add_directive("devctl_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "devctl daemon starting"
    );

    let socket_path = config.socket_path();
    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let supervisor = spawn_supervisor(config.supervisor_config());
    spawn_event_logger(&supervisor, cancel_token.clone());
    info!(policy = ?config.restart_policy(), "Supervisor started");

    let meter = ResourceMeter::new(
        Box::new(SysinfoTable::new()),
        config.container_inspector(),
        config.workspace_registry(),
    );
    let _usage_logger = spawn_usage_logger(meter.clone(), supervisor.clone(), cancel_token.clone());

    let server = DaemonServer::new(
        &socket_path,
        supervisor.clone(),
        meter,
        config.meter_interval(),
        cancel_token.clone(),
    );

    info!(socket = %socket_path.display(), "Starting server");
    let served = server.run().await;
    cancel_token.cancel();

    shutdown_supervisor(&supervisor).await;

    if let Err(e) = served {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("devctl daemon stopped");
    Ok(())
}

/// Kills every supervised tree before the process exits.
async fn shutdown_supervisor(supervisor: &SupervisorHandle) {
    match timeout(SHUTDOWN_GRACE, supervisor.shutdown()).await {
        Ok(Ok(())) => info!("All supervised processes stopped"),
        Ok(Err(e)) => warn!(error = %e, "Supervisor shutdown failed"),
        Err(_) => warn!(
            timeout_secs = SHUTDOWN_GRACE.as_secs(),
            "Supervisor shutdown timed out"
        ),
    }
}

/// Mirrors lifecycle transitions into the daemon log.
fn spawn_event_logger(supervisor: &SupervisorHandle, cancel_token: CancellationToken) {
    let mut events = supervisor.events();

    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel_token.cancelled() => break,
                event = events.recv() => event,
            };

            match event {
                Ok(SupervisorEvent::Spawned {
                    id,
                    pid,
                    restart_count,
                }) => info!(id = %id, pid, restart_count, "Process spawned"),
                Ok(SupervisorEvent::Exited { id, outcome }) => {
                    info!(id = %id, outcome = %outcome, "Process exited")
                }
                Ok(SupervisorEvent::Restarting { id, restart_count }) => {
                    info!(id = %id, restart_count, "Restart scheduled")
                }
                Ok(SupervisorEvent::Fatal { id, restart_count }) => {
                    warn!(id = %id, restart_count, "Crash loop detected; not restarting")
                }
                Ok(SupervisorEvent::Removed { id, reason }) => {
                    info!(id = %id, reason = ?reason, "Entry removed")
                }
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "Event logger lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

/// Waits for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_state_paths_share_directory() {
        assert_eq!(pid_file_path().parent(), log_file_path().parent());
        assert!(pid_file_path().ends_with(Path::new("devctl/devctld.pid")));
    }

    #[test]
    fn test_args_default_to_start() {
        let args = Args::try_parse_from(["devctld"]).unwrap();
        assert!(args.command.is_none());

        let args = Args::try_parse_from(["devctld", "start", "-d", "--config", "/tmp/c.toml"])
            .unwrap();
        match args.command {
            Some(Command::Start { daemon, config }) => {
                assert!(daemon);
                assert_eq!(config, Some(PathBuf::from("/tmp/c.toml")));
            }
            other => panic!("Expected Start, got {other:?}"),
        }
    }
}

//! Child process launching and output capture.
//!
//! A spawned child is owned by a monitor task; the rest of the daemon only
//! sees a [`ChildHandle`] (pid, a kill request, and the exit outcome once
//! known). stdout and stderr are published to the child's log channel chunk
//! by chunk as they arrive, so prompts and progress bars show up live. The exit outcome is only released after both
//! readers drained, so an exit notice always follows the child's output.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use devctl_core::{EntryId, ExitOutcome};

use crate::broadcast::LogBroadcaster;
use crate::terminator::Terminator;

/// How long to wait for output pipes to close after the child exits.
///
/// Grandchildren that outlive the child can hold the pipes open.
pub const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Largest chunk read from an output pipe at once.
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Everything needed to launch one child.
#[derive(Debug, Clone, Copy)]
pub struct LaunchSpec<'a> {
    /// Log channel receiving the child's output
    pub channel: &'a EntryId,
    /// Resolved executable
    pub program: &'a Path,
    pub args: &'a [String],
    pub directory: &'a Path,
    pub env: Option<&'a BTreeMap<String, String>>,
}

/// Handle to a child owned by its monitor task.
#[derive(Debug)]
pub struct ChildHandle {
    pid: u32,
    kill_tx: Option<oneshot::Sender<()>>,
    exit_rx: watch::Receiver<Option<ExitOutcome>>,
}

impl ChildHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Asks the monitor to kill the direct child only.
    ///
    /// Returns false if a kill was already requested or the monitor is gone.
    pub fn kill(&mut self) -> bool {
        match self.kill_tx.take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    /// Exit outcome, if the child has exited and its output drained.
    pub fn exit_outcome(&self) -> Option<ExitOutcome> {
        self.exit_rx.borrow().clone()
    }

    /// Detached watcher resolving when the child exits.
    pub fn exit_watch(&self) -> ExitWatch {
        ExitWatch(self.exit_rx.clone())
    }

    /// Waits for the child to exit.
    pub async fn wait(&mut self) -> ExitOutcome {
        wait_exit(&mut self.exit_rx).await
    }
}

/// Resolves with the exit outcome of one child.
#[derive(Debug)]
pub struct ExitWatch(watch::Receiver<Option<ExitOutcome>>);

impl ExitWatch {
    pub async fn wait(mut self) -> ExitOutcome {
        wait_exit(&mut self.0).await
    }
}

async fn wait_exit(rx: &mut watch::Receiver<Option<ExitOutcome>>) -> ExitOutcome {
    let lost = || ExitOutcome::Unknown("child monitor stopped".to_string());
    match rx.wait_for(Option::is_some).await {
        Ok(outcome) => outcome.clone().unwrap_or_else(lost),
        Err(_) => lost(),
    }
}

/// Spawns a child in its own process group with piped output.
pub fn spawn_child(spec: LaunchSpec<'_>, logs: &LogBroadcaster) -> io::Result<ChildHandle> {
    let mut command = Command::new(spec.program);
    command
        .args(spec.args)
        .current_dir(spec.directory)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(env) = spec.env {
        command.envs(env);
    }

    // The child leads a new group so the whole tree can be signalled at once
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command.spawn()?;
    let pid = child
        .id()
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "child exited before spawn returned"))?;

    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(pump_output(stdout, spec.channel.clone(), logs.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(pump_output(stderr, spec.channel.clone(), logs.clone())));
    }

    let (kill_tx, kill_rx) = oneshot::channel();
    let (exit_tx, exit_rx) = watch::channel(None);

    debug!(channel = %spec.channel, pid, program = %spec.program.display(), "Spawned child");

    tokio::spawn(monitor_child(
        child,
        spec.channel.clone(),
        readers,
        kill_rx,
        exit_tx,
    ));

    Ok(ChildHandle {
        pid,
        kill_tx: Some(kill_tx),
        exit_rx,
    })
}

/// Publishes output chunks in arrival order.
///
/// A UTF-8 sequence cut by a read boundary is held back until the next read
/// completes it.
async fn pump_output<R>(mut reader: R, channel: EntryId, logs: LogBroadcaster)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    let mut pending: Vec<u8> = Vec::new();

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                pending.extend_from_slice(buf.get(..n).unwrap_or_default());
                let text = take_decodable(&mut pending);
                if !text.is_empty() {
                    logs.publish(&channel, text);
                }
            }
            Err(e) => {
                debug!(channel = %channel, error = %e, "Output pipe read failed");
                break;
            }
        }
    }

    if !pending.is_empty() {
        logs.publish(&channel, String::from_utf8_lossy(&pending).into_owned());
    }
}

/// Drains `pending` up to any incomplete trailing UTF-8 sequence.
/// Invalid bytes are replaced.
fn take_decodable(pending: &mut Vec<u8>) -> String {
    let keep = incomplete_tail_len(pending);
    let tail = pending.split_off(pending.len() - keep);
    let text = String::from_utf8_lossy(pending).into_owned();
    *pending = tail;
    text
}

/// Length of a multi-byte sequence at the end of `bytes` still missing
/// continuation bytes, or 0.
fn incomplete_tail_len(bytes: &[u8]) -> usize {
    for (index, &byte) in bytes.iter().rev().take(3).enumerate() {
        let seen = index + 1;
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            0xF0..=0xF7 => 4,
            0xE0..=0xEF => 3,
            0xC0..=0xDF => 2,
            _ => 1,
        };
        return if width > seen { seen } else { 0 };
    }
    0
}

/// Owns the child until it exits.
async fn monitor_child(
    mut child: Child,
    channel: EntryId,
    readers: Vec<JoinHandle<()>>,
    mut kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<ExitOutcome>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = &mut kill_rx => {
            debug!(channel = %channel, "Killing child by handle");
            if let Err(e) = child.start_kill() {
                warn!(channel = %channel, error = %e, "Handle kill failed");
            }
            child.wait().await
        }
    };

    let outcome = match status {
        Ok(status) => ExitOutcome::from_status(status),
        Err(e) => ExitOutcome::Unknown(e.to_string()),
    };

    for mut reader in readers {
        if timeout(READER_DRAIN_TIMEOUT, &mut reader).await.is_err() {
            debug!(channel = %channel, "Output still open after exit; detaching reader");
            reader.abort();
        }
    }

    debug!(channel = %channel, outcome = %outcome, "Child exited");
    let _ = exit_tx.send(Some(outcome));
}

/// Why a run-to-completion command did not finish on its own.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Failed to launch: {0}")]
    Launch(#[from] io::Error),

    #[error("Timed out after {}s", .0.as_secs())]
    TimedOut(Duration),
}

/// Runs a command to completion, killing its tree if it exceeds `limit`.
pub async fn run_with_timeout(
    spec: LaunchSpec<'_>,
    logs: &LogBroadcaster,
    limit: Duration,
    terminator: &Terminator,
) -> Result<ExitOutcome, RunError> {
    let mut handle = spawn_child(spec, logs)?;

    match timeout(limit, handle.wait()).await {
        Ok(outcome) => Ok(outcome),
        Err(_) => {
            info!(
                channel = %spec.channel,
                pid = handle.pid(),
                limit_secs = limit.as_secs(),
                "Command exceeded its time limit; killing tree"
            );
            terminator.terminate(&mut handle).await;
            Err(RunError::TimedOut(limit))
        }
    }
}

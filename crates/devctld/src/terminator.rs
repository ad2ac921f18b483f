//! Whole-tree process termination.
//!
//! Killing only a service's direct child leaves dev servers, watchers and
//! compilers it spawned running. Termination therefore works from one fresh
//! process table snapshot taken at kill time:
//!
//! - POSIX: SIGKILL the child's process group (children are spawned as group
//!   leaders), then SIGKILL every snapshot descendant individually to catch
//!   processes that moved to another group.
//! - Windows: `taskkill /PID <pid> /T /F`.
//! - Anywhere the tree-wide kill is unavailable or fails, fall back to
//!   killing the tracked child handle.

use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, warn};

use crate::proctable::{ProcessTable, SysinfoTable};
use crate::spawn::ChildHandle;

/// How long to wait for a killed child to be reaped before escalating.
pub const EXIT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

/// How a process tree is killed on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillStrategy {
    /// Signal the process group, then each snapshot descendant
    ProcessGroup,
    /// `taskkill /T /F`
    TaskKill,
    /// Kill the tracked child handle only
    HandleOnly,
}

impl KillStrategy {
    pub fn for_host() -> Self {
        if cfg!(unix) {
            Self::ProcessGroup
        } else if cfg!(windows) {
            Self::TaskKill
        } else {
            Self::HandleOnly
        }
    }
}

/// What one tree kill did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TerminationReport {
    pub root: u32,
    /// Root followed by every descendant seen in the snapshot
    pub targets: Vec<u32>,
    /// Whether the tree-wide kill was delivered
    pub tree_signalled: bool,
    /// Pids that could not be signalled (usually already gone)
    pub missed: Vec<u32>,
}

impl TerminationReport {
    fn untouched(root: u32) -> Self {
        Self {
            root,
            targets: vec![root],
            ..Self::default()
        }
    }
}

/// Kills process trees.
#[derive(Debug, Clone, Copy)]
pub struct Terminator {
    strategy: KillStrategy,
}

impl Terminator {
    pub fn new(strategy: KillStrategy) -> Self {
        Self { strategy }
    }

    pub fn for_host() -> Self {
        Self::new(KillStrategy::for_host())
    }

    pub fn strategy(&self) -> KillStrategy {
        self.strategy
    }

    /// Kills `root` and all of its descendants. Blocking.
    ///
    /// Pid 0, pid 1 and the daemon itself are never signalled.
    pub fn kill_tree(&self, table: &mut dyn ProcessTable, root: u32) -> TerminationReport {
        let own = std::process::id();
        if root <= 1 || root == own {
            warn!(root, "Refusing to kill protected pid");
            return TerminationReport::untouched(root);
        }

        let tree = table.snapshot();
        let targets: Vec<u32> = tree
            .subtree(root)
            .into_iter()
            .filter(|pid| *pid > 1 && *pid != own)
            .collect();

        let mut report = TerminationReport {
            root,
            targets: targets.clone(),
            ..TerminationReport::default()
        };

        match self.strategy {
            KillStrategy::ProcessGroup => {
                report.tree_signalled = signal_group(root);
                // Descendants may have left the group; without a group kill
                // the root needs its own signal too
                let individual = if report.tree_signalled {
                    targets.get(1..).unwrap_or_default()
                } else {
                    targets.as_slice()
                };
                for &pid in individual {
                    if !signal_pid(pid) {
                        report.missed.push(pid);
                    }
                }
            }
            KillStrategy::TaskKill => {
                report.tree_signalled = task_kill(root);
            }
            KillStrategy::HandleOnly => {}
        }

        debug!(
            root,
            targets = report.targets.len(),
            tree_signalled = report.tree_signalled,
            missed = report.missed.len(),
            "Killed process tree"
        );
        report
    }

    /// Kills a child's whole tree and waits until the child is reaped.
    pub async fn terminate(&self, handle: &mut ChildHandle) -> TerminationReport {
        let root = handle.pid();
        if let Some(outcome) = handle.exit_outcome() {
            debug!(root, outcome = %outcome, "Child already exited");
        }

        let terminator = *self;
        let report = match tokio::task::spawn_blocking(move || {
            terminator.kill_tree(&mut SysinfoTable::new(), root)
        })
        .await
        {
            Ok(report) => report,
            Err(e) => {
                warn!(root, error = %e, "Tree kill task failed");
                TerminationReport::untouched(root)
            }
        };

        if !report.tree_signalled {
            debug!(root, "Tree kill unavailable; killing child handle");
            handle.kill();
        }

        if timeout(EXIT_CONFIRM_TIMEOUT, handle.wait()).await.is_err() {
            warn!(root, "Child survived tree kill; killing child handle");
            handle.kill();
            if timeout(EXIT_CONFIRM_TIMEOUT, handle.wait()).await.is_err() {
                warn!(root, "Child still not reaped");
            }
        }

        report
    }
}

impl Default for Terminator {
    fn default() -> Self {
        Self::for_host()
    }
}

#[cfg(unix)]
fn signal_group(pgid: u32) -> bool {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return false;
    };
    // SAFETY: killpg takes plain integers and has no memory preconditions
    unsafe { libc::killpg(pgid, libc::SIGKILL) == 0 }
}

#[cfg(unix)]
fn signal_pid(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: kill takes plain integers and has no memory preconditions
    unsafe { libc::kill(pid, libc::SIGKILL) == 0 }
}

#[cfg(not(unix))]
fn signal_group(_pgid: u32) -> bool {
    false
}

#[cfg(not(unix))]
fn signal_pid(_pid: u32) -> bool {
    false
}

#[cfg(windows)]
fn task_kill(pid: u32) -> bool {
    std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(not(windows))]
fn task_kill(_pid: u32) -> bool {
    false
}

//! Supervisor commands, errors and events.
//!
//! - `SupervisorCommand`: requests sent to the actor, plus the internal
//!   notifications its own tasks send back (child exits, backoff expiry,
//!   finished stops)
//! - `SupervisorError`: what a caller can get back
//! - `SupervisorEvent`: lifecycle transitions published for observers

use std::path::PathBuf;

use thiserror::Error;
use tokio::sync::oneshot;

use devctl_core::{
    CommandSpec, EntryId, EntrySummary, ExitOutcome, ProcessConfig, RootKind, ValidationError,
};

use crate::broadcast::LogSubscription;

// ============================================================================
// Supervisor Commands
// ============================================================================

/// Commands sent to the supervisor actor.
#[derive(Debug)]
pub enum SupervisorCommand {
    /// Start a service, or confirm it is already running.
    ///
    /// # Errors
    /// - `SupervisorError::Validation` if the launch parameters are invalid
    /// - `SupervisorError::Stopping` while a stop for the id is in flight
    /// - `SupervisorError::Fatal` if the id crash-looped and was not stopped
    Start {
        id: EntryId,
        config: ProcessConfig,
        respond_to: oneshot::Sender<Result<StartOutcome, SupervisorError>>,
    },

    /// Stop a service and kill its process tree, then optionally run a
    /// shutdown command. Responds once everything finished.
    Stop {
        id: EntryId,
        stop_command: Option<CommandSpec>,
        /// Where to run the shutdown command when the id is not tracked
        directory: Option<PathBuf>,
        respond_to: oneshot::Sender<Result<(), SupervisorError>>,
    },

    /// Launch a command once, unsupervised. Responds with the job id and a
    /// subscription taken before the job was spawned.
    RunOneOff {
        directory: PathBuf,
        command: CommandSpec,
        respond_to: oneshot::Sender<Result<JobLaunch, SupervisorError>>,
    },

    /// Join a log channel. A subscriber that attaches while the entry has a
    /// live child is greeted with an attach notice.
    Subscribe {
        channel: EntryId,
        respond_to: oneshot::Sender<LogSubscription>,
    },

    /// Summary of one service or job.
    GetEntry {
        id: EntryId,
        respond_to: oneshot::Sender<Option<EntrySummary>>,
    },

    /// Summaries of every service and job.
    ListEntries {
        respond_to: oneshot::Sender<Vec<EntrySummary>>,
    },

    /// Root pids the resource meter should walk.
    TrackedRoots {
        respond_to: oneshot::Sender<TrackedRoots>,
    },

    /// Stop everything and refuse new work. Responds once every tree is dead.
    Shutdown { respond_to: oneshot::Sender<()> },

    /// A child exited and its output drained.
    ChildExited {
        id: EntryId,
        generation: u64,
        outcome: ExitOutcome,
    },

    /// A service's backoff delay elapsed.
    RespawnDue { id: EntryId, generation: u64 },

    /// The stop task for a service finished.
    StopFinished { id: EntryId },
}

/// Result of a start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new entry was created and its first spawn attempted
    Started,
    /// The id already had an active entry; nothing changed
    AlreadyRunning,
}

/// A freshly launched one-off job.
#[derive(Debug)]
pub struct JobLaunch {
    pub id: EntryId,
    /// Receives the job's output from its first line
    pub subscription: LogSubscription,
}

/// One process tree the meter should account for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedRoot {
    pub kind: RootKind,
    pub id: String,
    pub pid: u32,
}

/// Live roots plus entry counts, taken atomically by the actor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackedRoots {
    pub roots: Vec<TrackedRoot>,
    pub active_services: usize,
    pub active_jobs: usize,
}

// ============================================================================
// Supervisor Errors
// ============================================================================

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SupervisorError {
    /// Launch parameters rejected before anything was spawned
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A stop for this id is still in progress
    #[error("Service {0} is stopping; retry once the stop completes")]
    Stopping(EntryId),

    /// Restarts were disabled after a crash loop; only a stop clears it
    #[error("Service {0} is fatal after repeated crashes; stop it before starting again")]
    Fatal(EntryId),

    /// A one-off job could not be launched
    #[error("Failed to launch job: {0}")]
    Launch(String),

    /// The daemon is shutting down
    #[error("Supervisor is shutting down")]
    ShuttingDown,

    /// The actor is gone
    #[error("Supervisor channel closed")]
    ChannelClosed,
}

impl SupervisorError {
    /// Short machine-readable code for wire errors.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Stopping(_) => "stopping",
            Self::Fatal(_) => "fatal",
            Self::Launch(_) => "launch",
            Self::ShuttingDown => "shutting_down",
            Self::ChannelClosed => "unavailable",
        }
    }
}

// ============================================================================
// Supervisor Events
// ============================================================================

/// Why an entry left the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemovalReason {
    /// Stopped on request
    Stopped,
    /// Exited with code 0
    Completed,
    /// The first spawn failed at the OS level
    LaunchFailed,
    /// A one-off job finished
    JobFinished,
}

/// Lifecycle transitions published by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    Spawned {
        id: EntryId,
        pid: u32,
        restart_count: u32,
    },
    Exited {
        id: EntryId,
        outcome: ExitOutcome,
    },
    Restarting {
        id: EntryId,
        restart_count: u32,
    },
    Fatal {
        id: EntryId,
        restart_count: u32,
    },
    Removed {
        id: EntryId,
        reason: RemovalReason,
    },
}

impl SupervisorEvent {
    pub fn id(&self) -> &EntryId {
        match self {
            Self::Spawned { id, .. }
            | Self::Exited { id, .. }
            | Self::Restarting { id, .. }
            | Self::Fatal { id, .. }
            | Self::Removed { id, .. } => id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = SupervisorError::from(ValidationError::EmptyBinary);
        assert_eq!(err.code(), "validation");
        assert_eq!(err.to_string(), "Binary must not be empty");

        let err = SupervisorError::Stopping(EntryId::new("web"));
        assert_eq!(err.code(), "stopping");
        assert!(err.to_string().contains("web"));

        let err = SupervisorError::Fatal(EntryId::new("api"));
        assert_eq!(err.code(), "fatal");
        assert!(err.to_string().contains("stop it"));
    }

    #[test]
    fn test_event_id() {
        let event = SupervisorEvent::Removed {
            id: EntryId::new("api"),
            reason: RemovalReason::Completed,
        };
        assert_eq!(event.id().as_str(), "api");
    }
}

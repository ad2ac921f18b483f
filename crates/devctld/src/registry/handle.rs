//! Client interface for the supervisor actor.
//!
//! `SupervisorHandle` is cheap to clone and shared by every connection. Each
//! method sends one command and awaits the oneshot reply; a closed channel
//! maps to `SupervisorError::ChannelClosed` (or an empty answer for
//! queries).

use std::path::PathBuf;

use tokio::sync::{broadcast, mpsc, oneshot};

use devctl_core::{CommandSpec, EntryId, EntrySummary, ProcessConfig};

use super::commands::{
    JobLaunch, StartOutcome, SupervisorCommand, SupervisorError, SupervisorEvent, TrackedRoots,
};
use crate::broadcast::{LogBroadcaster, LogSubscription};

/// Handle for interacting with the supervisor actor.
#[derive(Clone)]
pub struct SupervisorHandle {
    sender: mpsc::Sender<SupervisorCommand>,
    event_sender: broadcast::Sender<SupervisorEvent>,
    logs: LogBroadcaster,
}

impl SupervisorHandle {
    pub fn new(
        sender: mpsc::Sender<SupervisorCommand>,
        event_sender: broadcast::Sender<SupervisorEvent>,
        logs: LogBroadcaster,
    ) -> Self {
        Self {
            sender,
            event_sender,
            logs,
        }
    }

    /// Sends a command built around a fresh reply channel and awaits the reply.
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SupervisorCommand,
    ) -> Result<T, SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| SupervisorError::ChannelClosed)?;
        rx.await.map_err(|_| SupervisorError::ChannelClosed)
    }

    /// Starts a service. Idempotent while the service is active.
    ///
    /// # Errors
    ///
    /// Validation failures are returned before any entry exists.
    pub async fn start(
        &self,
        id: EntryId,
        config: ProcessConfig,
    ) -> Result<StartOutcome, SupervisorError> {
        self.request(|respond_to| SupervisorCommand::Start {
            id,
            config,
            respond_to,
        })
        .await?
    }

    /// Stops a service, kills its tree and runs the optional shutdown
    /// command. Returns once the entry is gone.
    pub async fn stop(
        &self,
        id: EntryId,
        stop_command: Option<CommandSpec>,
        directory: Option<PathBuf>,
    ) -> Result<(), SupervisorError> {
        self.request(|respond_to| SupervisorCommand::Stop {
            id,
            stop_command,
            directory,
            respond_to,
        })
        .await?
    }

    /// Launches a one-off job.
    pub async fn run_one_off(
        &self,
        directory: PathBuf,
        command: CommandSpec,
    ) -> Result<JobLaunch, SupervisorError> {
        self.request(|respond_to| SupervisorCommand::RunOneOff {
            directory,
            command,
            respond_to,
        })
        .await?
    }

    /// Joins a log channel, with an attach notice if the entry is live.
    pub async fn subscribe(&self, channel: EntryId) -> Result<LogSubscription, SupervisorError> {
        self.request(|respond_to| SupervisorCommand::Subscribe {
            channel,
            respond_to,
        })
        .await
    }

    /// Summary of one entry, or `None` if unknown or the actor is gone.
    pub async fn get_entry(&self, id: EntryId) -> Option<EntrySummary> {
        self.request(|respond_to| SupervisorCommand::GetEntry { id, respond_to })
            .await
            .ok()
            .flatten()
    }

    /// Summaries of every entry, sorted by id. Empty if the actor is gone.
    pub async fn list_entries(&self) -> Vec<EntrySummary> {
        self.request(|respond_to| SupervisorCommand::ListEntries { respond_to })
            .await
            .unwrap_or_default()
    }

    /// Live roots and entry counts for the resource meter.
    pub async fn tracked_roots(&self) -> Result<TrackedRoots, SupervisorError> {
        self.request(|respond_to| SupervisorCommand::TrackedRoots { respond_to })
            .await
    }

    /// Kills every tracked tree and refuses further work.
    pub async fn shutdown(&self) -> Result<(), SupervisorError> {
        self.request(|respond_to| SupervisorCommand::Shutdown { respond_to })
            .await
    }

    /// Subscribes to lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.event_sender.subscribe()
    }

    /// The log fan-out shared with the actor.
    pub fn logs(&self) -> &LogBroadcaster {
        &self.logs
    }

    /// Returns false once the actor has stopped.
    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }
}

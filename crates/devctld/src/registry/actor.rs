//! Supervisor actor - the single owner of every service and job entry.
//!
//! All entry mutation happens inside `handle_command`, which never awaits:
//! anything slow (tree kills, shutdown commands, backoff delays, waiting for
//! a child to exit) runs in a spawned task that reports back with an
//! internal command. Each spawn gets a fresh generation number, and every
//! internal notification carries the generation it was created for, so a
//! late exit or respawn timer from a previous child is recognised and
//! dropped.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Response channel failures (caller went away) are ignored

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use devctl_core::{
    resolve_binary, CommandSpec, DesiredState, EntryId, EntryKind, EntrySummary, ExitDecision,
    ExitOutcome, LifecycleState, ProcessConfig, RestartPolicy, RootKind, ValidationError,
    JOB_ID_PREFIX,
};

use super::commands::{
    JobLaunch, RemovalReason, StartOutcome, SupervisorCommand, SupervisorError, SupervisorEvent,
    TrackedRoot, TrackedRoots,
};
use super::SupervisorConfig;
use crate::broadcast::{LogBroadcaster, LogSubscription};
use crate::spawn::{run_with_timeout, spawn_child, ChildHandle, ExitWatch, LaunchSpec, RunError};
use crate::terminator::Terminator;

type StopResponder = oneshot::Sender<Result<(), SupervisorError>>;

// ============================================================================
// Entries
// ============================================================================

/// A supervised long-running service.
struct ServiceEntry {
    config: ProcessConfig,
    /// Resolved executable, fixed at validation time
    program: PathBuf,
    desired: DesiredState,
    state: LifecycleState,
    restart_count: u32,
    /// Generation of the current (or last) child
    generation: u64,
    child: Option<ChildHandle>,
    started_at: Option<Instant>,
    last_start: Option<DateTime<Utc>>,
    backoff: Option<JoinHandle<()>>,
    stop_waiters: Vec<StopResponder>,
}

impl ServiceEntry {
    fn new(config: ProcessConfig, program: PathBuf) -> Self {
        Self {
            config,
            program,
            desired: DesiredState::Running,
            state: LifecycleState::Spawning,
            restart_count: 0,
            generation: 0,
            child: None,
            started_at: None,
            last_start: None,
            backoff: None,
            stop_waiters: Vec::new(),
        }
    }

    fn summary(&self, id: &EntryId) -> EntrySummary {
        EntrySummary {
            id: id.clone(),
            kind: EntryKind::Service,
            state: self.state,
            pid: self.child.as_ref().map(ChildHandle::pid),
            restart_count: self.restart_count,
            last_start: self.last_start,
            command: self.config.command.to_string(),
        }
    }

    fn cancel_backoff(&mut self) {
        if let Some(timer) = self.backoff.take() {
            timer.abort();
        }
    }
}

/// A one-off job. Removed as soon as it exits.
struct JobEntry {
    command: CommandSpec,
    generation: u64,
    child: Option<ChildHandle>,
    started: DateTime<Utc>,
    stopping: bool,
}

impl JobEntry {
    fn summary(&self, id: &EntryId) -> EntrySummary {
        EntrySummary {
            id: id.clone(),
            kind: EntryKind::Job,
            state: if self.stopping {
                LifecycleState::Terminating
            } else {
                LifecycleState::Running
            },
            pid: self.child.as_ref().map(ChildHandle::pid),
            restart_count: 0,
            last_start: Some(self.started),
            command: self.command.to_string(),
        }
    }
}

// ============================================================================
// Supervisor Actor
// ============================================================================

/// The supervisor actor.
///
/// Created by [`super::spawn_supervisor`]; runs until every command sender
/// is dropped.
pub struct SupervisorActor {
    receiver: mpsc::Receiver<SupervisorCommand>,

    /// Weak so that the actor does not keep its own channel open
    sender: mpsc::WeakSender<SupervisorCommand>,

    event_sender: broadcast::Sender<SupervisorEvent>,
    logs: LogBroadcaster,
    terminator: Terminator,
    policy: RestartPolicy,
    shutdown_timeout: Duration,
    path_var: Option<OsString>,

    services: HashMap<EntryId, ServiceEntry>,
    jobs: HashMap<EntryId, JobEntry>,

    next_generation: u64,
    next_job_seq: u64,
    shutting_down: bool,
}

impl SupervisorActor {
    pub fn new(
        receiver: mpsc::Receiver<SupervisorCommand>,
        sender: mpsc::WeakSender<SupervisorCommand>,
        event_sender: broadcast::Sender<SupervisorEvent>,
        logs: LogBroadcaster,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            receiver,
            sender,
            event_sender,
            logs,
            terminator: config.terminator,
            policy: config.policy,
            shutdown_timeout: config.shutdown_timeout,
            path_var: config.path_var,
            services: HashMap::new(),
            jobs: HashMap::new(),
            next_generation: 0,
            next_job_seq: 0,
            shutting_down: false,
        }
    }

    /// Processes commands until the channel closes.
    pub async fn run(mut self) {
        info!(
            max_restarts = self.policy.max_restarts,
            uptime_threshold_ms = self.policy.uptime_threshold.as_millis() as u64,
            backoff_ms = self.policy.backoff.as_millis() as u64,
            "Supervisor started"
        );

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!(
            services = self.services.len(),
            jobs = self.jobs.len(),
            "Supervisor stopped"
        );
    }

    fn handle_command(&mut self, cmd: SupervisorCommand) {
        match cmd {
            SupervisorCommand::Start {
                id,
                config,
                respond_to,
            } => {
                let result = self.handle_start(id, config);
                let _ = respond_to.send(result);
            }
            SupervisorCommand::Stop {
                id,
                stop_command,
                directory,
                respond_to,
            } => {
                self.handle_stop(id, stop_command, directory, respond_to);
            }
            SupervisorCommand::RunOneOff {
                directory,
                command,
                respond_to,
            } => {
                let result = self.handle_run_one_off(directory, command);
                let _ = respond_to.send(result);
            }
            SupervisorCommand::Subscribe {
                channel,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_subscribe(&channel));
            }
            SupervisorCommand::GetEntry { id, respond_to } => {
                let _ = respond_to.send(self.summary_of(&id));
            }
            SupervisorCommand::ListEntries { respond_to } => {
                let _ = respond_to.send(self.list_entries());
            }
            SupervisorCommand::TrackedRoots { respond_to } => {
                let _ = respond_to.send(self.tracked_roots());
            }
            SupervisorCommand::Shutdown { respond_to } => {
                self.handle_shutdown(respond_to);
            }
            SupervisorCommand::ChildExited {
                id,
                generation,
                outcome,
            } => {
                if self.jobs.contains_key(&id) {
                    self.handle_job_exited(id, generation, outcome);
                } else {
                    self.handle_service_exited(id, generation, outcome);
                }
            }
            SupervisorCommand::RespawnDue { id, generation } => {
                self.handle_respawn_due(id, generation);
            }
            SupervisorCommand::StopFinished { id } => {
                self.handle_stop_finished(id);
            }
        }
    }

    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn emit(&self, event: SupervisorEvent) {
        // No observers is fine
        let _ = self.event_sender.send(event);
    }

    // ------------------------------------------------------------------------
    // Services
    // ------------------------------------------------------------------------

    fn handle_start(
        &mut self,
        id: EntryId,
        config: ProcessConfig,
    ) -> Result<StartOutcome, SupervisorError> {
        if self.shutting_down {
            return Err(SupervisorError::ShuttingDown);
        }
        if id.is_empty() {
            return Err(ValidationError::EmptyId.into());
        }
        if id.is_job() {
            return Err(ValidationError::ReservedId {
                id: id.to_string(),
                prefix: JOB_ID_PREFIX,
            }
            .into());
        }

        match self.services.get(&id).map(|entry| entry.state) {
            Some(state) if state.is_active() => {
                debug!(id = %id, state = %state, "Start ignored: already active");
                return Ok(StartOutcome::AlreadyRunning);
            }
            Some(LifecycleState::Fatal) => {
                debug!(id = %id, "Start refused: service is fatal");
                return Err(SupervisorError::Fatal(id));
            }
            Some(_) => {
                return Err(SupervisorError::Stopping(id));
            }
            None => {}
        }

        let program = config.validate(self.path_var.as_deref())?;

        info!(
            id = %id,
            command = %config.command,
            directory = %config.directory.display(),
            "Starting service"
        );

        self.services
            .insert(id.clone(), ServiceEntry::new(config, program));
        self.spawn_service(&id);

        Ok(StartOutcome::Started)
    }

    /// Spawns the next child for a service. A launch failure ends the entry.
    fn spawn_service(&mut self, id: &EntryId) {
        let generation = self.bump_generation();
        let sender = self.sender.upgrade();

        let Some(entry) = self.services.get_mut(id) else {
            return;
        };

        entry.generation = generation;
        entry.state = LifecycleState::Spawning;
        entry.backoff = None;

        let spec = LaunchSpec {
            channel: id,
            program: &entry.program,
            args: &entry.config.command.args,
            directory: &entry.config.directory,
            env: Some(&entry.config.env),
        };

        match spawn_child(spec, &self.logs) {
            Ok(child) => {
                let pid = child.pid();
                watch_exit(sender, id.clone(), generation, child.exit_watch());

                entry.child = Some(child);
                entry.state = LifecycleState::Running;
                entry.started_at = Some(Instant::now());
                entry.last_start = Some(Utc::now());

                info!(id = %id, pid, restart_count = entry.restart_count, "Service spawned");
                let restart_count = entry.restart_count;
                self.emit(SupervisorEvent::Spawned {
                    id: id.clone(),
                    pid,
                    restart_count,
                });
            }
            Err(e) => {
                error!(id = %id, error = %e, "Service failed to launch");
                self.logs.notice(
                    id,
                    &format!("failed to launch {}: {e}", entry.config.command),
                );
                entry.state = LifecycleState::Terminal;
                self.remove_service(id, RemovalReason::LaunchFailed);
            }
        }
    }

    fn handle_service_exited(&mut self, id: EntryId, generation: u64, outcome: ExitOutcome) {
        let policy = self.policy;
        let sender = self.sender.upgrade();

        let Some(entry) = self.services.get_mut(&id) else {
            debug!(id = %id, generation, "Exit for unknown entry ignored");
            return;
        };
        if entry.generation != generation {
            debug!(id = %id, generation, current = entry.generation, "Stale exit ignored");
            return;
        }

        // During a stop the handle already moved to the stop task
        entry.child = None;
        let uptime = entry
            .started_at
            .map(|started| started.elapsed())
            .unwrap_or_default();

        let decision = policy.evaluate_exit(entry.desired, entry.restart_count, uptime, &outcome);
        entry.state = decision.next_state();

        match decision {
            ExitDecision::Stopped => {
                debug!(id = %id, outcome = %outcome, "Service exited after stop request");
            }
            ExitDecision::Completed => {
                info!(id = %id, uptime_ms = uptime.as_millis() as u64, "Service exited cleanly");
                self.logs.notice(&id, &format!("process exited cleanly ({outcome})"));
            }
            ExitDecision::Restart {
                restart_count,
                delay,
            } => {
                entry.restart_count = restart_count;
                entry.backoff = schedule_respawn(sender, id.clone(), generation, delay);

                warn!(
                    id = %id,
                    outcome = %outcome,
                    uptime_ms = uptime.as_millis() as u64,
                    restart_count,
                    "Service crashed; restarting after backoff"
                );
                self.logs.notice(
                    &id,
                    &format!(
                        "process crashed ({outcome}); restarting in {} (quick crashes: {restart_count}/{})",
                        format_delay(delay),
                        policy.max_restarts
                    ),
                );
            }
            ExitDecision::CrashLimitExceeded { restart_count } => {
                entry.restart_count = restart_count;

                error!(
                    id = %id,
                    outcome = %outcome,
                    restart_count,
                    "Service exceeded crash limit; restarts disabled"
                );
                self.logs.notice(
                    &id,
                    &format!(
                        "FATAL: crashed {restart_count} times within {} of starting; not restarting until stopped",
                        format_delay(policy.uptime_threshold)
                    ),
                );
            }
        }

        self.emit(SupervisorEvent::Exited {
            id: id.clone(),
            outcome,
        });

        match decision {
            ExitDecision::Completed => self.remove_service(&id, RemovalReason::Completed),
            ExitDecision::Restart { restart_count, .. } => self.emit(SupervisorEvent::Restarting {
                id,
                restart_count,
            }),
            ExitDecision::CrashLimitExceeded { restart_count } => {
                self.emit(SupervisorEvent::Fatal { id, restart_count })
            }
            ExitDecision::Stopped => {}
        }
    }

    fn handle_respawn_due(&mut self, id: EntryId, generation: u64) {
        let Some(entry) = self.services.get(&id) else {
            return;
        };

        let due = entry.generation == generation
            && entry.state == LifecycleState::BackoffWait
            && entry.desired == DesiredState::Running;
        if !due {
            debug!(id = %id, generation, "Stale respawn ignored");
            return;
        }

        self.logs.notice(&id, "restarting");
        self.spawn_service(&id);
    }

    fn handle_stop(
        &mut self,
        id: EntryId,
        stop_command: Option<CommandSpec>,
        directory: Option<PathBuf>,
        respond_to: StopResponder,
    ) {
        if self.jobs.contains_key(&id) {
            self.stop_job(id, respond_to);
            return;
        }

        let sender = self.sender.upgrade();
        let mut task = StopTask {
            id: id.clone(),
            child: None,
            shutdown: None,
            logs: self.logs.clone(),
            terminator: self.terminator,
            shutdown_timeout: self.shutdown_timeout,
            path_var: self.path_var.clone(),
        };

        let Some(entry) = self.services.get_mut(&id) else {
            // Nothing tracked; the shutdown command still runs
            task.shutdown = match (stop_command, directory) {
                (Some(command), Some(directory)) => Some((command, directory)),
                (Some(command), None) => {
                    warn!(id = %id, command = %command, "Shutdown command without directory skipped");
                    None
                }
                (None, _) => None,
            };
            debug!(id = %id, "Stop for untracked id");
            tokio::spawn(async move {
                task.run().await;
                let _ = respond_to.send(Ok(()));
            });
            return;
        };

        entry.stop_waiters.push(respond_to);
        if entry.state == LifecycleState::Terminating {
            debug!(id = %id, "Stop already in progress");
            return;
        }

        info!(id = %id, state = %entry.state, "Stopping service");
        entry.desired = DesiredState::Stopped;
        entry.state = LifecycleState::Terminating;
        entry.cancel_backoff();

        task.child = entry.child.take();
        task.shutdown = stop_command.map(|command| {
            let directory = directory.unwrap_or_else(|| entry.config.directory.clone());
            (command, directory)
        });

        tokio::spawn(async move {
            task.run().await;
            if let Some(sender) = sender {
                let _ = sender.send(SupervisorCommand::StopFinished { id }).await;
            }
        });
    }

    fn handle_stop_finished(&mut self, id: EntryId) {
        let finished = self
            .services
            .get(&id)
            .map(|entry| entry.state == LifecycleState::Terminating)
            .unwrap_or(false);
        if !finished {
            return;
        }

        self.logs.notice(&id, "stopped");
        info!(id = %id, "Service stopped");
        self.remove_service(&id, RemovalReason::Stopped);
    }

    /// Drops a service entry and answers anyone waiting on its stop.
    fn remove_service(&mut self, id: &EntryId, reason: RemovalReason) {
        let Some(mut entry) = self.services.remove(id) else {
            return;
        };

        entry.cancel_backoff();
        for waiter in entry.stop_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }

        debug!(id = %id, reason = ?reason, "Service entry removed");
        self.emit(SupervisorEvent::Removed {
            id: id.clone(),
            reason,
        });
    }

    // ------------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------------

    fn handle_run_one_off(
        &mut self,
        directory: PathBuf,
        command: CommandSpec,
    ) -> Result<JobLaunch, SupervisorError> {
        if self.shutting_down {
            return Err(SupervisorError::ShuttingDown);
        }
        if !directory.is_dir() {
            return Err(ValidationError::DirectoryNotFound { path: directory }.into());
        }
        let program = resolve_binary(&command.binary, &directory, self.path_var.as_deref())?;

        self.next_job_seq += 1;
        let id = EntryId::job(Utc::now().timestamp_millis(), self.next_job_seq);
        let generation = self.bump_generation();

        // Subscribed before spawning so the caller sees the first line
        let subscription = self.logs.subscribe(&id);

        let spec = LaunchSpec {
            channel: &id,
            program: &program,
            args: &command.args,
            directory: &directory,
            env: None,
        };
        let child = spawn_child(spec, &self.logs).map_err(|e| {
            error!(command = %command, error = %e, "Job failed to launch");
            SupervisorError::Launch(e.to_string())
        })?;

        let pid = child.pid();
        watch_exit(self.sender.upgrade(), id.clone(), generation, child.exit_watch());

        info!(id = %id, pid, command = %command, "Job started");
        self.jobs.insert(
            id.clone(),
            JobEntry {
                command,
                generation,
                child: Some(child),
                started: Utc::now(),
                stopping: false,
            },
        );
        self.emit(SupervisorEvent::Spawned {
            id: id.clone(),
            pid,
            restart_count: 0,
        });

        Ok(JobLaunch { id, subscription })
    }

    fn handle_job_exited(&mut self, id: EntryId, generation: u64, outcome: ExitOutcome) {
        let current = self.jobs.get(&id).map(|job| job.generation);
        if current != Some(generation) {
            return;
        }
        self.jobs.remove(&id);

        info!(id = %id, outcome = %outcome, "Job finished");
        self.logs.notice(&id, &format!("job finished ({outcome})"));
        self.logs.close(&id);
        self.emit(SupervisorEvent::Exited {
            id: id.clone(),
            outcome,
        });
        self.emit(SupervisorEvent::Removed {
            id,
            reason: RemovalReason::JobFinished,
        });
    }

    /// Kills a running job's tree. The entry is removed by its exit.
    fn stop_job(&mut self, id: EntryId, respond_to: StopResponder) {
        let terminator = self.terminator;
        let Some(job) = self.jobs.get_mut(&id) else {
            let _ = respond_to.send(Ok(()));
            return;
        };

        job.stopping = true;
        let Some(mut child) = job.child.take() else {
            // Another stop owns the child; it answers once the tree is gone
            let _ = respond_to.send(Ok(()));
            return;
        };

        info!(id = %id, pid = child.pid(), "Stopping job");
        tokio::spawn(async move {
            terminator.terminate(&mut child).await;
            let _ = respond_to.send(Ok(()));
        });
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    fn handle_subscribe(&self, channel: &EntryId) -> LogSubscription {
        let subscription = self.logs.subscribe(channel);

        let live_pid = self
            .services
            .get(channel)
            .and_then(|entry| entry.child.as_ref())
            .or_else(|| self.jobs.get(channel).and_then(|job| job.child.as_ref()))
            .map(ChildHandle::pid);

        match live_pid {
            Some(pid) => subscription.with_greeting(&format!("attached to {channel} (pid {pid})")),
            None => subscription,
        }
    }

    fn summary_of(&self, id: &EntryId) -> Option<EntrySummary> {
        self.services
            .get(id)
            .map(|entry| entry.summary(id))
            .or_else(|| self.jobs.get(id).map(|job| job.summary(id)))
    }

    fn list_entries(&self) -> Vec<EntrySummary> {
        let mut entries: Vec<EntrySummary> = self
            .services
            .iter()
            .map(|(id, entry)| entry.summary(id))
            .chain(self.jobs.iter().map(|(id, job)| job.summary(id)))
            .collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    fn tracked_roots(&self) -> TrackedRoots {
        let services = self.services.iter().filter_map(|(id, entry)| {
            entry.child.as_ref().map(|child| TrackedRoot {
                kind: RootKind::Service,
                id: id.to_string(),
                pid: child.pid(),
            })
        });
        let jobs = self.jobs.iter().filter_map(|(id, job)| {
            job.child.as_ref().map(|child| TrackedRoot {
                kind: RootKind::Job,
                id: id.to_string(),
                pid: child.pid(),
            })
        });

        TrackedRoots {
            roots: services.chain(jobs).collect(),
            active_services: self
                .services
                .values()
                .filter(|entry| entry.state.is_active())
                .count(),
            active_jobs: self.jobs.len(),
        }
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    fn handle_shutdown(&mut self, respond_to: oneshot::Sender<()>) {
        self.shutting_down = true;
        let terminator = self.terminator;
        let mut kills = JoinSet::new();

        for entry in self.services.values_mut() {
            entry.desired = DesiredState::Stopped;
            entry.state = LifecycleState::Terminating;
            entry.cancel_backoff();
            if let Some(mut child) = entry.child.take() {
                kills.spawn(async move { terminator.terminate(&mut child).await });
            }
        }
        for job in self.jobs.values_mut() {
            job.stopping = true;
            if let Some(mut child) = job.child.take() {
                kills.spawn(async move { terminator.terminate(&mut child).await });
            }
        }

        info!(trees = kills.len(), "Supervisor shutting down; killing all process trees");

        tokio::spawn(async move {
            while let Some(result) = kills.join_next().await {
                if let Err(e) = result {
                    warn!(error = %e, "Tree kill task failed during shutdown");
                }
            }
            let _ = respond_to.send(());
        });
    }
}

// ============================================================================
// Background Tasks
// ============================================================================

/// Forwards a child's exit to the actor.
fn watch_exit(
    sender: Option<mpsc::Sender<SupervisorCommand>>,
    id: EntryId,
    generation: u64,
    exit: ExitWatch,
) {
    let Some(sender) = sender else {
        return;
    };

    tokio::spawn(async move {
        let outcome = exit.wait().await;
        let _ = sender
            .send(SupervisorCommand::ChildExited {
                id,
                generation,
                outcome,
            })
            .await;
    });
}

/// Fires `RespawnDue` after the backoff delay. Aborted if the entry stops.
fn schedule_respawn(
    sender: Option<mpsc::Sender<SupervisorCommand>>,
    id: EntryId,
    generation: u64,
    delay: Duration,
) -> Option<JoinHandle<()>> {
    let sender = sender?;

    Some(tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = sender
            .send(SupervisorCommand::RespawnDue { id, generation })
            .await;
    }))
}

fn format_delay(delay: Duration) -> String {
    if delay.subsec_millis() == 0 {
        format!("{}s", delay.as_secs())
    } else {
        format!("{}ms", delay.as_millis())
    }
}

/// Kills a service tree, then runs its shutdown command.
struct StopTask {
    id: EntryId,
    child: Option<ChildHandle>,
    shutdown: Option<(CommandSpec, PathBuf)>,
    logs: LogBroadcaster,
    terminator: Terminator,
    shutdown_timeout: Duration,
    path_var: Option<OsString>,
}

impl StopTask {
    async fn run(mut self) {
        if let Some(child) = self.child.as_mut() {
            let report = self.terminator.terminate(child).await;
            info!(
                id = %self.id,
                root = report.root,
                processes = report.targets.len(),
                tree_signalled = report.tree_signalled,
                "Process tree killed"
            );
        }

        if let Some((command, directory)) = self.shutdown.take() {
            self.run_shutdown_command(command, directory).await;
        }
    }

    async fn run_shutdown_command(&self, command: CommandSpec, directory: PathBuf) {
        let id = &self.id;

        if !directory.is_dir() {
            self.logs.notice(
                id,
                &format!("shutdown command skipped: directory not found: {}", directory.display()),
            );
            return;
        }
        let program =
            match resolve_binary(&command.binary, &directory, self.path_var.as_deref()) {
                Ok(program) => program,
                Err(e) => {
                    self.logs
                        .notice(id, &format!("shutdown command skipped: {e}"));
                    return;
                }
            };

        info!(id = %id, command = %command, "Running shutdown command");
        self.logs
            .notice(id, &format!("running shutdown command: {command}"));

        let spec = LaunchSpec {
            channel: id,
            program: &program,
            args: &command.args,
            directory: &directory,
            env: None,
        };

        let message = match run_with_timeout(spec, &self.logs, self.shutdown_timeout, &self.terminator)
            .await
        {
            Ok(outcome) if outcome.is_success() => "shutdown command finished".to_string(),
            Ok(outcome) => format!("shutdown command failed ({outcome})"),
            Err(RunError::TimedOut(limit)) => {
                warn!(id = %id, command = %command, "Shutdown command timed out");
                format!("shutdown command timed out after {}; killed", format_delay(limit))
            }
            Err(RunError::Launch(e)) => format!("shutdown command failed to launch: {e}"),
        };
        self.logs.notice(id, &message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_delay() {
        assert_eq!(format_delay(Duration::from_secs(5)), "5s");
        assert_eq!(format_delay(Duration::from_millis(250)), "250ms");
        assert_eq!(format_delay(Duration::from_millis(1500)), "1500ms");
    }
}

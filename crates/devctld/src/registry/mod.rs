//! Process supervisor using the actor pattern.
//!
//! The supervisor is the single owner of the service and job registry. It
//! receives commands over a tokio mpsc channel, owns every child handle, and
//! applies the restart policy when children exit.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐  SupervisorCommand  ┌──────────────────┐  SupervisorEvent
//! │ SupervisorHandle │────(mpsc)──────────▶│ SupervisorActor  │────(broadcast)───▶ observers
//! └──────────────────┘                     └────────┬─────────┘
//!                                                   │ spawns
//!            ChildExited / RespawnDue /             ▼
//!            StopFinished  ◀──────────── monitor, backoff and stop tasks
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()` or `.expect()` in production code
//! - Channel operations handle closure gracefully

use std::env;
use std::ffi::OsString;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};

use devctl_core::RestartPolicy;

use crate::broadcast::{LogBroadcaster, DEFAULT_CHANNEL_CAPACITY};
use crate::terminator::Terminator;

mod actor;
mod commands;
mod handle;

pub use actor::SupervisorActor;
pub use commands::{
    JobLaunch, RemovalReason, StartOutcome, SupervisorCommand, SupervisorError, SupervisorEvent,
    TrackedRoot, TrackedRoots,
};
pub use handle::SupervisorHandle;

/// Channel buffer sizes
const COMMAND_BUFFER: usize = 256;
const EVENT_BUFFER: usize = 256;

/// Default time limit for a service's shutdown command.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(15);

/// Supervisor settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub policy: RestartPolicy,

    /// Shutdown commands running longer than this are killed
    pub shutdown_timeout: Duration,

    /// Ring size of each log channel
    pub log_capacity: usize,

    /// `PATH` used to resolve bare binary names
    pub path_var: Option<OsString>,

    pub terminator: Terminator,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            policy: RestartPolicy::default(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            log_capacity: DEFAULT_CHANNEL_CAPACITY,
            path_var: env::var_os("PATH"),
            terminator: Terminator::for_host(),
        }
    }
}

/// Spawns the supervisor actor and returns a handle to it.
///
/// # Example
///
/// ```no_run
/// use devctld::registry::{spawn_supervisor, SupervisorConfig};
///
/// #[tokio::main]
/// async fn main() {
///     let supervisor = spawn_supervisor(SupervisorConfig::default());
///     let entries = supervisor.list_entries().await;
///     assert!(entries.is_empty());
/// }
/// ```
pub fn spawn_supervisor(config: SupervisorConfig) -> SupervisorHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (event_tx, _) = broadcast::channel(EVENT_BUFFER);
    let logs = LogBroadcaster::new(config.log_capacity);

    let actor = SupervisorActor::new(
        cmd_rx,
        cmd_tx.downgrade(),
        event_tx.clone(),
        logs.clone(),
        config,
    );
    tokio::spawn(actor.run());

    SupervisorHandle::new(cmd_tx, event_tx, logs)
}

//! devctl Core - Shared types for local process supervision
//!
//! This crate provides the domain types shared between the daemon
//! (devctld) and the CLI (devctl):
//! - identifiers for supervised entries, jobs and log channels
//! - structured commands and the launch validation rules
//! - the per-entry lifecycle state machine and restart policy
//! - process tree snapshots and resource usage snapshots
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod command;
pub mod entry;
pub mod error;
pub mod id;
pub mod lifecycle;
pub mod resources;
pub mod tree;

// Re-exports for convenience
pub use command::{
    manifest_rule_for, resolve_binary, BinaryKind, CommandSpec, ManifestRule, ProcessConfig,
};
pub use entry::{EntryKind, EntrySummary};
pub use error::{ValidationError, ValidationResult};
pub use id::{EntryId, JOB_ID_PREFIX};
pub use lifecycle::{DesiredState, ExitDecision, ExitOutcome, LifecycleState, RestartPolicy};
pub use resources::{ContainerUsage, PeakTracker, ResourceSnapshot, RootKind, RootUsage};
pub use tree::ProcessTree;

//! devctl Protocol - Wire protocol for daemon communication
//!
//! Newline-delimited JSON messages exchanged over the daemon's Unix
//! socket: control requests from clients (start, stop, run, subscribe)
//! and responses plus pushed log/resource events from the daemon.

pub mod message;
pub mod version;

pub use message::{ClientMessage, DaemonMessage, MessageType};
pub use version::{ProtocolVersion, VersionError};

//! devctl CLI - Library modules
//!
//! The command line client for the devctl daemon:
//! - `client` - Socket connection, handshake and typed requests
//! - `daemon` - Starting the daemon on demand
//! - `format` - Table rendering for `ls` and `top`
//! - `cli` - Argument parsing and subcommand dispatch

pub mod cli;
pub mod client;
pub mod daemon;
pub mod error;
pub mod format;

pub use client::{ClientConfig, DaemonClient};
pub use error::{CliError, Result};

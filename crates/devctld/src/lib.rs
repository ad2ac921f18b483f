//! devctl Daemon - Process supervisor, log fan-out and resource meter
//!
//! This crate provides the daemon side of devctl:
//! - `registry` - Supervisor actor owning every service and one-off job
//! - `spawn` / `terminator` - Child launching and whole-tree termination
//! - `broadcast` - Per-entry live log fan-out
//! - `meter` - Aggregate memory accounting over supervised trees
//! - `server` - Unix socket server for client connections
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      devctld daemon                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │  DaemonServer   │────▶│     SupervisorActor         │   │
//! │  │ (Unix Socket)   │     │  (entry state owner)        │   │
//! │  └────────┬────────┘     └──────────────┬──────────────┘   │
//! │           │                             │ spawn / kill      │
//! │           │ connections                 ▼                   │
//! │           ▼                  ┌─────────────────────┐        │
//! │  ┌─────────────────┐         │  child monitors     │        │
//! │  │ConnectionHandler│◀────────│  (stdout/stderr)    │        │
//! │  │  (per client)   │  logs   └─────────────────────┘        │
//! │  └────────┬────────┘                                        │
//! │           │ snapshots      ┌─────────────────────────────┐  │
//! │           └───────────────▶│  ResourceMeter (sysinfo)    │  │
//! │                            └─────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod broadcast;
pub mod cli;
pub mod collab;
pub mod config;
pub mod meter;
pub mod proctable;
pub mod registry;
pub mod server;
pub mod spawn;
pub mod terminator;

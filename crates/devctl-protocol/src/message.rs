//! Protocol message types for daemon communication.

use std::collections::BTreeMap;
use std::path::PathBuf;

use devctl_core::{CommandSpec, EntryId, EntrySummary, ResourceSnapshot};
use serde::{Deserialize, Serialize};

use crate::version::ProtocolVersion;

/// Message types that can be sent by clients to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageType {
    /// Client handshake/connection request
    Connect {
        /// Client identifier (optional)
        #[serde(skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },

    /// Start (or keep running) a supervised service
    Start {
        id: EntryId,
        directory: PathBuf,
        command: CommandSpec,
        /// Environment overrides
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
    },

    /// Stop a service, optionally running a shutdown command afterwards
    Stop {
        id: EntryId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stop_command: Option<CommandSpec>,
        /// Working directory for the shutdown command
        #[serde(default, skip_serializing_if = "Option::is_none")]
        directory: Option<PathBuf>,
    },

    /// Run a command to completion as a one-off job
    RunOneOff {
        directory: PathBuf,
        command: CommandSpec,
        /// Stream the job's output on this connection from its first line
        #[serde(default)]
        follow: bool,
    },

    /// Join the live log tail of a service or job
    Subscribe { channel: EntryId },

    /// Leave a log channel
    Unsubscribe { channel: EntryId },

    /// Start receiving periodic resource snapshots
    WatchResources,

    /// Stop receiving resource snapshots
    UnwatchResources,

    /// Request a summary of every entry
    ListEntries,

    /// Ping to check connection
    Ping {
        /// Sequence number for matching pong response
        seq: u64,
    },

    /// Client disconnecting gracefully
    Disconnect,
}

/// Messages sent from client to daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    /// Protocol version
    pub protocol_version: ProtocolVersion,

    /// Message payload
    #[serde(flatten)]
    pub message: MessageType,
}

impl ClientMessage {
    /// Creates a new client message with current protocol version.
    pub fn new(message: MessageType) -> Self {
        Self {
            protocol_version: ProtocolVersion::CURRENT,
            message,
        }
    }

    pub fn connect(client_id: Option<String>) -> Self {
        Self::new(MessageType::Connect { client_id })
    }

    pub fn start(
        id: EntryId,
        directory: impl Into<PathBuf>,
        command: CommandSpec,
        env: BTreeMap<String, String>,
    ) -> Self {
        Self::new(MessageType::Start {
            id,
            directory: directory.into(),
            command,
            env,
        })
    }

    pub fn stop(id: EntryId, stop_command: Option<CommandSpec>, directory: Option<PathBuf>) -> Self {
        Self::new(MessageType::Stop {
            id,
            stop_command,
            directory,
        })
    }

    pub fn run_one_off(directory: impl Into<PathBuf>, command: CommandSpec, follow: bool) -> Self {
        Self::new(MessageType::RunOneOff {
            directory: directory.into(),
            command,
            follow,
        })
    }

    pub fn subscribe(channel: EntryId) -> Self {
        Self::new(MessageType::Subscribe { channel })
    }

    pub fn unsubscribe(channel: EntryId) -> Self {
        Self::new(MessageType::Unsubscribe { channel })
    }

    pub fn watch_resources() -> Self {
        Self::new(MessageType::WatchResources)
    }

    pub fn unwatch_resources() -> Self {
        Self::new(MessageType::UnwatchResources)
    }

    pub fn list_entries() -> Self {
        Self::new(MessageType::ListEntries)
    }

    pub fn ping(seq: u64) -> Self {
        Self::new(MessageType::Ping { seq })
    }

    pub fn disconnect() -> Self {
        Self::new(MessageType::Disconnect)
    }
}

/// Messages sent from daemon to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonMessage {
    /// Connection accepted
    Connected {
        /// Daemon's protocol version
        protocol_version: ProtocolVersion,
        /// Assigned client ID
        client_id: String,
    },

    /// Connection rejected (version mismatch, too many clients)
    Rejected {
        reason: String,
        /// Daemon's protocol version (for client to upgrade)
        protocol_version: ProtocolVersion,
    },

    /// Start request accepted (also sent when the service was already running)
    Started { id: EntryId },

    /// Stop request completed
    Stopped { id: EntryId },

    /// One-off job spawned
    JobStarted { job_id: EntryId },

    /// Subscription to a log channel is active
    Subscribed { channel: EntryId },

    /// One chunk of process output, or a daemon notice, on a channel
    Log { id: EntryId, text: String },

    /// Periodic resource snapshot
    Resources { snapshot: Box<ResourceSnapshot> },

    /// Response to `list_entries`
    EntryList { entries: Vec<EntrySummary> },

    /// Pong response to ping
    Pong { seq: u64 },

    /// Error response
    Error {
        message: String,
        /// Error code (optional)
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl DaemonMessage {
    pub fn connected(client_id: String) -> Self {
        Self::Connected {
            protocol_version: ProtocolVersion::CURRENT,
            client_id,
        }
    }

    pub fn rejected(reason: &str) -> Self {
        Self::Rejected {
            reason: reason.to_string(),
            protocol_version: ProtocolVersion::CURRENT,
        }
    }

    pub fn started(id: EntryId) -> Self {
        Self::Started { id }
    }

    pub fn stopped(id: EntryId) -> Self {
        Self::Stopped { id }
    }

    pub fn job_started(job_id: EntryId) -> Self {
        Self::JobStarted { job_id }
    }

    pub fn subscribed(channel: EntryId) -> Self {
        Self::Subscribed { channel }
    }

    pub fn log(id: EntryId, text: impl Into<String>) -> Self {
        Self::Log {
            id,
            text: text.into(),
        }
    }

    pub fn resources(snapshot: ResourceSnapshot) -> Self {
        Self::Resources {
            snapshot: Box::new(snapshot),
        }
    }

    pub fn entry_list(entries: Vec<EntrySummary>) -> Self {
        Self::EntryList { entries }
    }

    pub fn pong(seq: u64) -> Self {
        Self::Pong { seq }
    }

    pub fn error(message: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            code: None,
        }
    }

    pub fn error_with_code(message: &str, code: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            code: Some(code.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_message_shape() {
        let msg = ClientMessage::start(
            EntryId::new("svc-a"),
            "backend",
            CommandSpec::new("node", ["server.js"]),
            BTreeMap::new(),
        );
        let json = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["type"], "start");
        assert_eq!(json["id"], "svc-a");
        assert_eq!(json["command"]["binary"], "node");
        assert_eq!(json["command"]["args"][0], "server.js");
        assert_eq!(json["protocol_version"]["major"], 1);
        assert!(json.get("env").is_none());
    }

    #[test]
    fn test_stop_accepts_minimal_payload() {
        let raw = r#"{"protocol_version":{"major":1,"minor":0},"type":"stop","id":"svc-a"}"#;
        let parsed: ClientMessage = serde_json::from_str(raw).unwrap();

        match parsed.message {
            MessageType::Stop {
                id,
                stop_command,
                directory,
            } => {
                assert_eq!(id.as_str(), "svc-a");
                assert!(stop_command.is_none());
                assert!(directory.is_none());
            }
            other => panic!("Expected Stop message, got {other:?}"),
        }
    }

    #[test]
    fn test_command_args_default_to_empty() {
        let raw = r#"{"protocol_version":{"major":1,"minor":0},"type":"run_one_off","directory":"/tmp","command":{"binary":"make"}}"#;
        let parsed: ClientMessage = serde_json::from_str(raw).unwrap();

        match parsed.message {
            MessageType::RunOneOff {
                command, follow, ..
            } => {
                assert_eq!(command.binary, "make");
                assert!(command.args.is_empty());
                assert!(!follow);
            }
            other => panic!("Expected RunOneOff message, got {other:?}"),
        }
    }

    #[test]
    fn test_log_event_shape() {
        let msg = DaemonMessage::log(EntryId::new("job-1-1"), "compiling...\n");
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            json,
            r#"{"type":"log","id":"job-1-1","text":"compiling...\n"}"#
        );
    }

    #[test]
    fn test_unit_variants_use_type_tag() {
        let json = serde_json::to_string(&ClientMessage::watch_resources()).unwrap();
        assert!(json.contains("\"type\":\"watch_resources\""));
    }
}

//! Daemon connection client for the devctl CLI.
//!
//! `DaemonClient` owns one Unix socket connection:
//! - performs the protocol handshake on connect
//! - sends requests and waits for their reply, skipping pushed log and
//!   resource messages that arrive in between
//! - exposes the raw message stream for `logs`, `run` and `top`
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::{debug, info};

use devctl_core::{CommandSpec, EntryId, EntrySummary};
use devctl_protocol::{ClientMessage, DaemonMessage, ProtocolVersion};

use crate::error::{CliError, Result};

/// Default socket path, shared with the daemon.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/devctl.sock";

/// Environment variable overriding the socket path.
pub const SOCKET_ENV: &str = "DEVCTL_SOCKET";

// ============================================================================
// Configuration
// ============================================================================

/// Connection settings.
///
/// # Example
///
/// ```rust
/// use devctl_cli::client::ClientConfig;
/// use std::time::Duration;
///
/// let config = ClientConfig {
///     socket_path: std::path::PathBuf::from("/tmp/my-devctl.sock"),
///     request_timeout: Duration::from_secs(60),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Path to the Unix socket where the daemon listens.
    pub socket_path: PathBuf,

    /// Limit on connecting and on the handshake.
    pub connect_timeout: Duration,

    /// Limit on waiting for a request's reply. Stops wait for shutdown
    /// commands, so this is generous.
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            connect_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl ClientConfig {
    /// Defaults, with the socket taken from `DEVCTL_SOCKET` when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(path) = env::var_os(SOCKET_ENV) {
            config.socket_path = PathBuf::from(path);
        }
        config
    }
}

// ============================================================================
// Daemon Client
// ============================================================================

/// A connected, handshaken client.
pub struct DaemonClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    client_id: String,
    request_timeout: Duration,
}

impl DaemonClient {
    /// Connects to the daemon and performs the handshake.
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        let stream = timeout(config.connect_timeout, UnixStream::connect(&config.socket_path))
            .await
            .map_err(|_| CliError::Timeout)?
            .map_err(|e| connection_error(&config.socket_path, e))?;

        let (reader, writer) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(reader),
            writer,
            client_id: String::new(),
            request_timeout: config.request_timeout,
        };

        client.send(&ClientMessage::connect(None)).await?;
        let response = timeout(config.connect_timeout, client.next_message())
            .await
            .map_err(|_| CliError::Timeout)??;

        match response {
            Some(DaemonMessage::Connected {
                protocol_version,
                client_id,
            }) => {
                if !ProtocolVersion::CURRENT.is_compatible_with(&protocol_version) {
                    return Err(CliError::VersionMismatch {
                        client_version: ProtocolVersion::CURRENT.to_string(),
                        daemon_version: protocol_version.to_string(),
                    });
                }
                debug!(client_id = %client_id, protocol_version = %protocol_version, "Handshake complete");
                client.client_id = client_id;
                Ok(client)
            }
            Some(DaemonMessage::Rejected {
                reason,
                protocol_version,
            }) => {
                info!(reason = %reason, "Daemon rejected connection");
                if ProtocolVersion::CURRENT.is_compatible_with(&protocol_version) {
                    return Err(CliError::DaemonConnection(format!("rejected: {reason}")));
                }
                Err(CliError::VersionMismatch {
                    client_version: ProtocolVersion::CURRENT.to_string(),
                    daemon_version: protocol_version.to_string(),
                })
            }
            Some(other) => Err(CliError::ProtocolError(format!(
                "Unexpected response to connect: {other:?}"
            ))),
            None => Err(CliError::DaemonConnection(
                "daemon closed the connection during handshake".to_string(),
            )),
        }
    }

    /// Identifier the daemon assigned to this connection.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Sends one message.
    pub async fn send(&mut self, message: &ClientMessage) -> Result<()> {
        let json = serde_json::to_string(message)?;
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        debug!(message_type = ?message.message, "Sent message to daemon");
        Ok(())
    }

    /// Reads the next message. `None` once the daemon closed the socket.
    pub async fn next_message(&mut self) -> Result<Option<DaemonMessage>> {
        let mut line = String::new();
        let read = self.reader.read_line(&mut line).await?;
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(line.trim())?))
    }

    /// Sends a request and returns its reply.
    ///
    /// Pushed `Log` and `Resources` messages are skipped. A daemon `Error`
    /// becomes `CliError::Daemon`.
    pub async fn request(&mut self, message: ClientMessage) -> Result<DaemonMessage> {
        self.send(&message).await?;

        let reply = timeout(self.request_timeout, self.next_reply())
            .await
            .map_err(|_| CliError::Timeout)??;

        match reply {
            DaemonMessage::Error { message, code } => Err(CliError::Daemon { message, code }),
            reply => Ok(reply),
        }
    }

    /// Next message that is not a pushed log line or snapshot.
    async fn next_reply(&mut self) -> Result<DaemonMessage> {
        loop {
            match self.next_message().await? {
                Some(DaemonMessage::Log { .. } | DaemonMessage::Resources { .. }) => continue,
                Some(reply) => return Ok(reply),
                None => {
                    return Err(CliError::DaemonConnection(
                        "daemon closed the connection".to_string(),
                    ))
                }
            }
        }
    }

    /// Starts (or confirms) a service.
    pub async fn start(
        &mut self,
        id: EntryId,
        directory: PathBuf,
        command: CommandSpec,
        env: BTreeMap<String, String>,
    ) -> Result<()> {
        match self
            .request(ClientMessage::start(id, directory, command, env))
            .await?
        {
            DaemonMessage::Started { .. } => Ok(()),
            other => Err(unexpected("start", &other)),
        }
    }

    /// Stops a service and waits for the stop to finish.
    pub async fn stop(
        &mut self,
        id: EntryId,
        stop_command: Option<CommandSpec>,
        directory: Option<PathBuf>,
    ) -> Result<()> {
        match self
            .request(ClientMessage::stop(id, stop_command, directory))
            .await?
        {
            DaemonMessage::Stopped { .. } => Ok(()),
            other => Err(unexpected("stop", &other)),
        }
    }

    /// Launches a one-off job and returns its id.
    pub async fn run_one_off(
        &mut self,
        directory: PathBuf,
        command: CommandSpec,
        follow: bool,
    ) -> Result<EntryId> {
        match self
            .request(ClientMessage::run_one_off(directory, command, follow))
            .await?
        {
            DaemonMessage::JobStarted { job_id } => Ok(job_id),
            other => Err(unexpected("run", &other)),
        }
    }

    /// Joins a log channel.
    pub async fn subscribe(&mut self, channel: EntryId) -> Result<()> {
        match self.request(ClientMessage::subscribe(channel)).await? {
            DaemonMessage::Subscribed { .. } => Ok(()),
            other => Err(unexpected("subscribe", &other)),
        }
    }

    /// Lists every service and job.
    pub async fn list_entries(&mut self) -> Result<Vec<EntrySummary>> {
        match self.request(ClientMessage::list_entries()).await? {
            DaemonMessage::EntryList { entries } => Ok(entries),
            other => Err(unexpected("list", &other)),
        }
    }

    /// Asks for periodic resource snapshots. They arrive through
    /// [`Self::next_message`].
    pub async fn watch_resources(&mut self) -> Result<()> {
        self.send(&ClientMessage::watch_resources()).await
    }

    /// Round trip time of a ping.
    pub async fn ping(&mut self, seq: u64) -> Result<Duration> {
        let started = Instant::now();
        match self.request(ClientMessage::ping(seq)).await? {
            DaemonMessage::Pong { seq: got } if got == seq => Ok(started.elapsed()),
            other => Err(unexpected("ping", &other)),
        }
    }

    /// Says goodbye. Errors are irrelevant at this point.
    pub async fn disconnect(mut self) {
        let _ = self.send(&ClientMessage::disconnect()).await;
    }
}

fn connection_error(socket_path: &Path, error: std::io::Error) -> CliError {
    CliError::DaemonConnection(format!(
        "{} ({error}); is devctld running?",
        socket_path.display()
    ))
}

fn unexpected(request: &str, reply: &DaemonMessage) -> CliError {
    CliError::ProtocolError(format!("Unexpected reply to {request}: {reply:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    /// Serves one connection with canned replies, one per request line.
    async fn fake_daemon(listener: UnixListener, replies: Vec<DaemonMessage>) {
        let (stream, _) = listener.accept().await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        for reply in replies {
            let mut line = String::new();
            if reader.read_line(&mut line).await.unwrap() == 0 {
                return;
            }
            let json = serde_json::to_string(&reply).unwrap();
            writer.write_all(json.as_bytes()).await.unwrap();
            writer.write_all(b"\n").await.unwrap();
        }
    }

    fn config_for(dir: &tempfile::TempDir) -> ClientConfig {
        ClientConfig {
            socket_path: dir.path().join("d.sock"),
            ..ClientConfig::default()
        }
    }

    #[tokio::test]
    async fn test_connect_missing_socket() {
        let dir = tempfile::tempdir().unwrap();
        let result = DaemonClient::connect(&config_for(&dir)).await;
        match result {
            Err(CliError::DaemonConnection(msg)) => assert!(msg.contains("devctld")),
            Err(other) => panic!("Expected DaemonConnection, got {other:?}"),
            Ok(_) => panic!("Expected an error"),
        }
    }

    #[tokio::test]
    async fn test_request_maps_daemon_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_for(&dir);
        let listener = UnixListener::bind(&config.socket_path).unwrap();
        tokio::spawn(fake_daemon(
            listener,
            vec![
                DaemonMessage::connected("client-0".to_string()),
                DaemonMessage::error_with_code("Binary not found: pnpm", "validation"),
            ],
        ));

        let mut client = DaemonClient::connect(&config).await.unwrap();
        assert_eq!(client.client_id(), "client-0");

        let err = client
            .start(
                EntryId::new("web"),
                PathBuf::from("/tmp"),
                CommandSpec::new("pnpm", ["dev"]),
                BTreeMap::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.daemon_code(), Some("validation"));
        assert!(err.to_string().contains("pnpm"));
    }

    #[tokio::test]
    async fn test_request_skips_pushed_logs() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_for(&dir);
        let listener = UnixListener::bind(&config.socket_path).unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut reader = BufReader::new(reader);
            let mut line = String::new();

            reader.read_line(&mut line).await.unwrap();
            let connected = DaemonMessage::connected("c".to_string());
            let log = DaemonMessage::log(EntryId::new("web"), "noise\n");
            let pong = DaemonMessage::pong(9);

            writer
                .write_all(format!("{}\n", serde_json::to_string(&connected).unwrap()).as_bytes())
                .await
                .unwrap();
            line.clear();
            reader.read_line(&mut line).await.unwrap();
            for msg in [log, pong] {
                writer
                    .write_all(format!("{}\n", serde_json::to_string(&msg).unwrap()).as_bytes())
                    .await
                    .unwrap();
            }
        });

        let mut client = DaemonClient::connect(&config).await.unwrap();
        assert!(client.ping(9).await.is_ok());
    }

    #[tokio::test]
    async fn test_rejected_handshake() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_for(&dir);
        let listener = UnixListener::bind(&config.socket_path).unwrap();
        tokio::spawn(fake_daemon(
            listener,
            vec![DaemonMessage::rejected("Too many clients (max: 32)")],
        ));

        match DaemonClient::connect(&config).await {
            Err(CliError::DaemonConnection(msg)) => assert!(msg.contains("Too many clients")),
            Err(other) => panic!("Expected DaemonConnection, got {other:?}"),
            Ok(_) => panic!("Expected an error"),
        }
    }
}

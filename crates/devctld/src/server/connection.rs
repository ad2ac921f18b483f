//! Connection handler for individual client connections.
//!
//! Each client connection gets its own `ConnectionHandler` that:
//! - Performs protocol version negotiation
//! - Parses incoming messages and routes them to the supervisor
//! - Runs one forwarding task per log subscription and one for the
//!   resource stream, all writing through the shared writer
//! - Cancels every forwarding task when the connection ends
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Connection errors are logged and result in graceful disconnect

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use devctl_core::{EntryId, ProcessConfig};
use devctl_protocol::{ClientMessage, DaemonMessage, MessageType, ProtocolVersion};

use crate::broadcast::LogSubscription;
use crate::meter::{spawn_resource_stream, ResourceMeter};
use crate::registry::{SupervisorError, SupervisorHandle};

/// Writer shared between the handler and its forwarding tasks
pub type ClientWriter = Arc<Mutex<BufWriter<OwnedWriteHalf>>>;

/// Maximum message size (1 MB)
pub const MAX_MESSAGE_SIZE: usize = 1_048_576;

/// Read timeout for idle connections (5 minutes)
const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Write timeout (10 seconds)
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

type ClientId = String;

/// Daemon services a connection needs.
#[derive(Clone)]
pub struct ConnectionContext {
    pub supervisor: SupervisorHandle,
    pub meter: ResourceMeter,
    pub meter_interval: Duration,
}

/// Connection handler for a single client.
pub struct ConnectionHandler {
    reader: BufReader<OwnedReadHalf>,
    writer: ClientWriter,
    context: ConnectionContext,

    /// Assigned after handshake
    client_id: Option<ClientId>,

    /// Parent of every forwarding task's token
    cancel: CancellationToken,

    /// Active log subscriptions by channel
    log_streams: HashMap<EntryId, CancellationToken>,

    /// Active resource stream
    resource_stream: Option<CancellationToken>,

    connection_number: u64,
}

impl ConnectionHandler {
    /// Creates a handler. `cancel` should be a child of the server token.
    pub fn new(
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        context: ConnectionContext,
        cancel: CancellationToken,
        connection_number: u64,
    ) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer: Arc::new(Mutex::new(BufWriter::new(writer))),
            context,
            client_id: None,
            cancel,
            log_streams: HashMap::new(),
            resource_stream: None,
            connection_number,
        }
    }

    /// Runs the connection until it closes. Returns the client id, if the
    /// handshake completed.
    pub async fn run(mut self) -> Option<ClientId> {
        debug!(connection = self.connection_number, "New client connected");

        if let Err(e) = self.handle_handshake().await {
            warn!(
                connection = self.connection_number,
                error = %e,
                "Handshake failed"
            );
            self.cancel.cancel();
            return None;
        }
        info!(client_id = ?self.client_id, "Client handshake completed");

        if let Err(e) = self.process_messages().await {
            debug!(client_id = ?self.client_id, error = %e, "Connection closed");
        }

        // Stops every log forwarder and the resource stream
        self.cancel.cancel();

        info!(client_id = ?self.client_id, "Client disconnected");
        self.client_id
    }

    /// Tells a client it cannot be served and closes.
    pub async fn reject(self, reason: &str) {
        if let Err(e) = self.send_message(DaemonMessage::rejected(reason)).await {
            debug!(connection = self.connection_number, error = %e, "Reject not delivered");
        }
    }

    async fn handle_handshake(&mut self) -> Result<(), ConnectionError> {
        let msg = timeout(READ_TIMEOUT, self.read_message())
            .await
            .map_err(|_| ConnectionError::Timeout)??;

        let client_version = msg.protocol_version;
        if let Err(e) = client_version.ensure_current() {
            warn!(
                client_version = %client_version,
                server_version = %ProtocolVersion::CURRENT,
                "Protocol version mismatch"
            );
            self.send_message(DaemonMessage::rejected(&e.to_string()))
                .await?;
            return Err(ConnectionError::VersionMismatch {
                client: client_version,
                server: ProtocolVersion::CURRENT,
            });
        }

        match msg.message {
            MessageType::Connect { client_id } => {
                let assigned_id =
                    client_id.unwrap_or_else(|| format!("client-{}", self.connection_number));
                self.client_id = Some(assigned_id.clone());
                self.send_message(DaemonMessage::connected(assigned_id))
                    .await
            }
            other => {
                self.send_message(DaemonMessage::error(
                    "Expected Connect message for handshake",
                ))
                .await?;
                Err(ConnectionError::UnexpectedMessage(format!("{other:?}")))
            }
        }
    }

    async fn process_messages(&mut self) -> Result<(), ConnectionError> {
        let cancel = self.cancel.clone();

        loop {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(client_id = ?self.client_id, "Server shutting down connection");
                    return Ok(());
                }
                read = timeout(READ_TIMEOUT, self.read_message()) => read,
            };

            let msg = match read {
                Ok(Ok(msg)) => msg,
                Ok(Err(ConnectionError::Eof)) => {
                    debug!(client_id = ?self.client_id, "Client sent EOF");
                    return Ok(());
                }
                Ok(Err(ConnectionError::ParseError(e))) => {
                    // A malformed line does not end the session
                    self.send_message(DaemonMessage::error_with_code(
                        &format!("Invalid message: {e}"),
                        "parse",
                    ))
                    .await?;
                    continue;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    debug!(client_id = ?self.client_id, "Connection timed out");
                    return Err(ConnectionError::Timeout);
                }
            };

            match self.handle_message(msg).await {
                Ok(()) => {}
                Err(ConnectionError::Eof) => return Ok(()),
                Err(e) => {
                    error!(client_id = ?self.client_id, error = %e, "Error handling message");
                    return Err(e);
                }
            }
        }
    }

    async fn handle_message(&mut self, msg: ClientMessage) -> Result<(), ConnectionError> {
        match msg.message {
            MessageType::Connect { .. } => {
                self.send_message(DaemonMessage::error("Already connected"))
                    .await?;
            }

            MessageType::Start {
                id,
                directory,
                command,
                env,
            } => {
                let config = ProcessConfig::new(directory, command).with_env(env);
                let reply = match self.context.supervisor.start(id.clone(), config).await {
                    Ok(outcome) => {
                        debug!(client_id = ?self.client_id, id = %id, outcome = ?outcome, "Start handled");
                        DaemonMessage::started(id)
                    }
                    Err(e) => error_reply(&e),
                };
                self.send_message(reply).await?;
            }

            MessageType::Stop {
                id,
                stop_command,
                directory,
            } => {
                let reply = match self
                    .context
                    .supervisor
                    .stop(id.clone(), stop_command, directory)
                    .await
                {
                    Ok(()) => DaemonMessage::stopped(id),
                    Err(e) => error_reply(&e),
                };
                self.send_message(reply).await?;
            }

            MessageType::RunOneOff {
                directory,
                command,
                follow,
            } => match self.context.supervisor.run_one_off(directory, command).await {
                Ok(launch) => {
                    self.send_message(DaemonMessage::job_started(launch.id.clone()))
                        .await?;
                    if follow {
                        self.forward_logs(launch.subscription);
                    }
                }
                Err(e) => self.send_message(error_reply(&e)).await?,
            },

            MessageType::Subscribe { channel } => {
                let live = self
                    .log_streams
                    .get(&channel)
                    .is_some_and(|token| !token.is_cancelled());
                if live {
                    self.send_message(DaemonMessage::subscribed(channel)).await?;
                    return Ok(());
                }
                match self.context.supervisor.subscribe(channel.clone()).await {
                    Ok(subscription) => {
                        self.send_message(DaemonMessage::subscribed(channel)).await?;
                        self.forward_logs(subscription);
                    }
                    Err(e) => self.send_message(error_reply(&e)).await?,
                }
            }

            MessageType::Unsubscribe { channel } => {
                if let Some(token) = self.log_streams.remove(&channel) {
                    token.cancel();
                    debug!(client_id = ?self.client_id, channel = %channel, "Unsubscribed from logs");
                }
            }

            MessageType::WatchResources => {
                if self.resource_stream.is_none() {
                    self.watch_resources();
                }
            }

            MessageType::UnwatchResources => {
                if let Some(token) = self.resource_stream.take() {
                    token.cancel();
                    debug!(client_id = ?self.client_id, "Resource stream cancelled");
                }
            }

            MessageType::ListEntries => {
                let entries = self.context.supervisor.list_entries().await;
                self.send_message(DaemonMessage::entry_list(entries)).await?;
            }

            MessageType::Ping { seq } => {
                self.send_message(DaemonMessage::pong(seq)).await?;
            }

            MessageType::Disconnect => {
                debug!(client_id = ?self.client_id, "Client requested disconnect");
                return Err(ConnectionError::Eof);
            }
        }

        Ok(())
    }

    /// Spawns a task pushing one channel's lines to this client.
    fn forward_logs(&mut self, mut subscription: LogSubscription) {
        let channel = subscription.channel().clone();
        let token = self.cancel.child_token();
        // Forwarders of closed channels cancel their own token on exit
        self.log_streams.retain(|_, stream| !stream.is_cancelled());
        if let Some(previous) = self.log_streams.insert(channel.clone(), token.clone()) {
            previous.cancel();
        }

        let writer = Arc::clone(&self.writer);
        let client_id = self.client_id.clone();

        tokio::spawn(async move {
            loop {
                let line = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    line = subscription.recv() => line,
                };
                let Some(line) = line else {
                    break;
                };
                if let Err(e) = send_to(&writer, &DaemonMessage::log(line.channel, line.text)).await
                {
                    debug!(client_id = ?client_id, channel = %channel, error = %e, "Log forward failed");
                    break;
                }
            }
            token.cancel();
            debug!(client_id = ?client_id, channel = %channel, "Log forwarder stopped");
        });
    }

    /// Spawns the resource stream and its forwarder.
    fn watch_resources(&mut self) {
        let token = self.cancel.child_token();
        self.resource_stream = Some(token.clone());

        let (mut snapshots, _stream) = spawn_resource_stream(
            self.context.meter.clone(),
            self.context.supervisor.clone(),
            self.context.meter_interval,
            token,
        );
        let writer = Arc::clone(&self.writer);
        let client_id = self.client_id.clone();

        debug!(client_id = ?client_id, "Resource stream started");
        tokio::spawn(async move {
            while let Some(snapshot) = snapshots.recv().await {
                if let Err(e) = send_to(&writer, &DaemonMessage::resources(snapshot)).await {
                    debug!(client_id = ?client_id, error = %e, "Resource forward failed");
                    break;
                }
            }
        });
    }

    async fn read_message(&mut self) -> Result<ClientMessage, ConnectionError> {
        let mut line = String::new();

        let bytes_read = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        if bytes_read == 0 {
            return Err(ConnectionError::Eof);
        }

        if line.len() > MAX_MESSAGE_SIZE {
            return Err(ConnectionError::MessageTooLarge {
                size: line.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        let msg: ClientMessage = serde_json::from_str(&line)
            .map_err(|e| ConnectionError::ParseError(e.to_string()))?;

        debug!(
            client_id = ?self.client_id,
            message_type = ?std::mem::discriminant(&msg.message),
            "Received message"
        );

        Ok(msg)
    }

    async fn send_message(&self, msg: DaemonMessage) -> Result<(), ConnectionError> {
        send_to(&self.writer, &msg).await
    }

    /// Returns the client ID (if connected).
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }
}

fn error_reply(err: &SupervisorError) -> DaemonMessage {
    DaemonMessage::error_with_code(&err.to_string(), err.code())
}

/// Writes one JSON line to a client, bounded by the write timeout.
pub async fn send_to(writer: &ClientWriter, msg: &DaemonMessage) -> Result<(), ConnectionError> {
    let json =
        serde_json::to_string(msg).map_err(|e| ConnectionError::ParseError(e.to_string()))?;

    let mut writer = writer.lock().await;

    match timeout(WRITE_TIMEOUT, async {
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok::<(), std::io::Error>(())
    })
    .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ConnectionError::Io(e.to_string())),
        Err(_) => Err(ConnectionError::WriteTimeout),
    }
}

/// Errors that can occur during connection handling.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Protocol version mismatch: client {client}, server {server}")]
    VersionMismatch {
        client: ProtocolVersion,
        server: ProtocolVersion,
    },

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection closed")]
    Eof,

    #[error("Read timeout")]
    Timeout,

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use devctl_core::ValidationError;

    #[test]
    fn test_connection_error_display() {
        let err = ConnectionError::VersionMismatch {
            client: ProtocolVersion::new(2, 0),
            server: ProtocolVersion::new(1, 0),
        };
        assert!(err.to_string().contains("2.0"));
        assert!(err.to_string().contains("1.0"));
    }

    #[test]
    fn test_error_reply_carries_code() {
        let reply = error_reply(&SupervisorError::from(ValidationError::BinaryNotFound {
            binary: "pnpm".to_string(),
        }));
        match reply {
            DaemonMessage::Error { message, code } => {
                assert!(message.contains("pnpm"));
                assert_eq!(code.as_deref(), Some("validation"));
            }
            other => panic!("Expected Error, got {other:?}"),
        }
    }
}

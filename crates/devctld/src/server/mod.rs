//! Unix socket server for the devctl daemon.
//!
//! The server:
//! - Listens on a Unix socket for client connections
//! - Spawns a ConnectionHandler for each client, up to a client limit
//! - Gives every connection a child cancellation token so shutdown
//!   reaches all log and resource forwarders
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   DaemonServer  │
//! │                 │
//! │  UnixListener   │
//! └───────┬─────────┘
//!         │ accept()
//!         ▼
//! ┌─────────────────┐     ┌──────────────────┐
//! │ConnectionHandler│────▶│ SupervisorHandle │
//! │   (per client)  │     └──────────────────┘
//! │                 │     ┌──────────────────┐
//! │  log forwarders │────▶│  ResourceMeter   │
//! │  resource feed  │     └──────────────────┘
//! └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Server errors are logged and allow continued operation

mod connection;

pub use connection::{
    send_to, ClientWriter, ConnectionContext, ConnectionError, ConnectionHandler,
    MAX_MESSAGE_SIZE,
};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::meter::ResourceMeter;
use crate::registry::SupervisorHandle;

/// Default socket path
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/devctl.sock";

/// Maximum number of concurrent clients
pub const MAX_CLIENTS: usize = 32;

/// Unix socket server for the devctl daemon.
pub struct DaemonServer {
    socket_path: PathBuf,

    context: ConnectionContext,

    /// Cancellation token for graceful shutdown
    cancel_token: CancellationToken,

    /// Connection counter for generating client IDs
    connection_counter: AtomicU64,

    /// Connections currently being served
    active_clients: Arc<AtomicUsize>,
}

impl DaemonServer {
    /// Creates a new daemon server.
    ///
    /// # Arguments
    ///
    /// * `socket_path` - Path where the Unix socket will be created
    /// * `supervisor` - Handle to the supervisor actor
    /// * `meter` - Meter used for resource streams
    /// * `meter_interval` - Period between streamed snapshots
    /// * `cancel_token` - Token for graceful shutdown
    pub fn new(
        socket_path: impl Into<PathBuf>,
        supervisor: SupervisorHandle,
        meter: ResourceMeter,
        meter_interval: Duration,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            socket_path: socket_path.into(),
            context: ConnectionContext {
                supervisor,
                meter,
                meter_interval,
            },
            cancel_token,
            connection_counter: AtomicU64::new(0),
            active_clients: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Returns the socket path.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Returns the number of connected clients.
    pub fn client_count(&self) -> usize {
        self.active_clients.load(Ordering::Relaxed)
    }

    /// Binds the socket. A stale socket file is replaced.
    pub fn bind(&self) -> Result<UnixListener, ServerError> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(|e| self.setup_error(e))?;
        }

        if let Some(parent) = self.socket_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| self.setup_error(e))?;
            }
        }

        UnixListener::bind(&self.socket_path).map_err(|e| self.setup_error(e))
    }

    /// Runs the server.
    ///
    /// Listens for connections until the cancellation token is triggered.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind()?;
        self.serve(listener).await;
        Ok(())
    }

    /// Accepts connections on an already bound listener until cancelled.
    pub async fn serve(&self, listener: UnixListener) {
        info!(
            socket = %self.socket_path.display(),
            "Daemon server listening"
        );

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Server shutdown requested");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let conn_num = self.connection_counter.fetch_add(1, Ordering::Relaxed);
                            self.handle_connection(stream, conn_num);
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        }

        self.cleanup();
    }

    /// Handles a new client connection by spawning a handler task.
    fn handle_connection(&self, stream: UnixStream, connection_number: u64) {
        let (reader, writer) = stream.into_split();
        let handler = ConnectionHandler::new(
            reader,
            writer,
            self.context.clone(),
            self.cancel_token.child_token(),
            connection_number,
        );

        let active = Arc::clone(&self.active_clients);
        let previous = active.fetch_add(1, Ordering::AcqRel);

        tokio::spawn(async move {
            if previous >= MAX_CLIENTS {
                let err = ServerError::TooManyClients { max: MAX_CLIENTS };
                warn!(connection = connection_number, "Rejecting client: {err}");
                handler.reject(&err.to_string()).await;
            } else {
                let client_id = handler.run().await;
                debug!(client_id = ?client_id, "Connection handler finished");
            }
            active.fetch_sub(1, Ordering::AcqRel);
        });
    }

    fn setup_error(&self, error: std::io::Error) -> ServerError {
        ServerError::SocketSetup {
            path: self.socket_path.clone(),
            error: error.to_string(),
        }
    }

    /// Removes the socket file.
    fn cleanup(&self) {
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(
                    socket = %self.socket_path.display(),
                    error = %e,
                    "Failed to remove socket file"
                );
            }
        }

        info!("Server cleanup complete");
    }
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to setup socket at {}: {error}", path.display())]
    SocketSetup { path: PathBuf, error: String },

    #[error("Too many clients (max: {max})")]
    TooManyClients { max: usize },

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_socket_path() {
        assert_eq!(DEFAULT_SOCKET_PATH, "/tmp/devctl.sock");
    }

    #[test]
    fn test_server_error_display() {
        let err = ServerError::SocketSetup {
            path: PathBuf::from("/tmp/test.sock"),
            error: "permission denied".to_string(),
        };
        assert!(err.to_string().contains("/tmp/test.sock"));
        assert!(err.to_string().contains("permission denied"));
    }

    #[test]
    fn test_max_clients_error() {
        let err = ServerError::TooManyClients { max: MAX_CLIENTS };
        assert!(err.to_string().contains(&MAX_CLIENTS.to_string()));
    }
}

//! Integration tests for the Unix socket server.
//!
//! These tests run a real `DaemonServer` on a temporary socket and talk to
//! it over the wire protocol: handshake, control requests, log streaming
//! and resource snapshots.
//!
//! Tests CAN use `.unwrap()` and `.expect()`; the panic-free behavior of
//! production code is verified through assertions.

#![cfg(unix)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use devctl_core::{CommandSpec, EntryId, LifecycleState};
use devctl_protocol::{ClientMessage, DaemonMessage, MessageType, ProtocolVersion};
use devctld::collab::{NoContainers, StaticWorkspace};
use devctld::meter::ResourceMeter;
use devctld::proctable::SysinfoTable;
use devctld::registry::{spawn_supervisor, SupervisorConfig, SupervisorHandle};
use devctld::server::DaemonServer;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Constants
// ============================================================================

/// Maximum time to wait for server socket to appear
const SOCKET_WAIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Interval between socket existence checks
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Grace period for server shutdown
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_millis(100);

/// Upper bound on waiting for any single response
const RECV_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Test Helpers
// ============================================================================

/// Test server context that manages server lifecycle and cleanup.
struct TestServer {
    socket_path: PathBuf,
    cancel_token: CancellationToken,
    supervisor: SupervisorHandle,
    temp_dir: TempDir,
}

impl TestServer {
    async fn spawn() -> Self {
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        let socket_path = temp_dir.path().join("test.sock");

        let supervisor = spawn_supervisor(SupervisorConfig::default());
        let meter = ResourceMeter::new(
            Box::new(SysinfoTable::new()),
            Arc::new(NoContainers),
            Arc::new(StaticWorkspace(4)),
        );
        let cancel_token = CancellationToken::new();

        let server = DaemonServer::new(
            socket_path.clone(),
            supervisor.clone(),
            meter,
            Duration::from_millis(100),
            cancel_token.clone(),
        );

        tokio::spawn(async move {
            let _ = server.run().await;
        });

        let start = tokio::time::Instant::now();
        while start.elapsed() < SOCKET_WAIT_TIMEOUT {
            if socket_path.exists() {
                break;
            }
            sleep(SOCKET_POLL_INTERVAL).await;
        }

        assert!(
            socket_path.exists(),
            "Server socket did not appear within {SOCKET_WAIT_TIMEOUT:?}"
        );

        TestServer {
            socket_path,
            cancel_token,
            supervisor,
            temp_dir,
        }
    }

    /// A directory that exists for launched commands.
    fn workdir(&self) -> PathBuf {
        self.temp_dir.path().to_path_buf()
    }

    async fn connect(&self) -> TestClient {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .expect("connect to server");
        TestClient::new(stream)
    }

    /// Connects and completes the handshake.
    async fn connect_ready(&self) -> TestClient {
        let mut client = self.connect().await;
        client.handshake(None).await;
        client
    }

    async fn shutdown(self) {
        let _ = self.supervisor.shutdown().await;
        self.cancel_token.cancel();
        sleep(SHUTDOWN_GRACE_PERIOD).await;
    }
}

/// Test client connection with protocol helpers.
struct TestClient {
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: tokio::net::unix::OwnedWriteHalf,
}

impl TestClient {
    fn new(stream: UnixStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    async fn send(&mut self, msg: ClientMessage) {
        let json = serde_json::to_string(&msg).unwrap();
        self.send_raw(&json).await;
    }

    async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn recv(&mut self) -> DaemonMessage {
        let mut line = String::new();
        timeout(RECV_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("response in time")
            .unwrap();
        serde_json::from_str(&line).unwrap()
    }

    /// Skips pushed messages until `pred` matches.
    async fn recv_until<F>(&mut self, mut pred: F) -> DaemonMessage
    where
        F: FnMut(&DaemonMessage) -> bool,
    {
        loop {
            let msg = self.recv().await;
            if pred(&msg) {
                return msg;
            }
        }
    }

    async fn handshake(&mut self, client_id: Option<String>) -> String {
        self.send(ClientMessage::connect(client_id)).await;

        match self.recv().await {
            DaemonMessage::Connected { client_id, .. } => client_id,
            other => panic!("Expected Connected, got {other:?}"),
        }
    }
}

fn sh(script: &str) -> CommandSpec {
    CommandSpec::new("sh", ["-c", script])
}

// ============================================================================
// Connection Tests
// ============================================================================

#[tokio::test]
async fn test_handshake_success() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    client
        .send(ClientMessage::connect(Some("dashboard".to_string())))
        .await;

    match client.recv().await {
        DaemonMessage::Connected {
            protocol_version,
            client_id,
        } => {
            assert_eq!(protocol_version, ProtocolVersion::CURRENT);
            assert_eq!(client_id, "dashboard");
        }
        other => panic!("Expected Connected, got {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_handshake_auto_assigns_client_id() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    let client_id = client.handshake(None).await;
    assert!(client_id.starts_with("client-"), "got: {client_id}");

    server.shutdown().await;
}

#[tokio::test]
async fn test_handshake_version_mismatch() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    client
        .send(ClientMessage {
            protocol_version: ProtocolVersion::new(99, 0),
            message: MessageType::Connect { client_id: None },
        })
        .await;

    assert!(matches!(
        client.recv().await,
        DaemonMessage::Rejected { .. }
    ));

    server.shutdown().await;
}

#[tokio::test]
async fn test_request_before_handshake_is_refused() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    client.send(ClientMessage::list_entries()).await;
    assert!(matches!(client.recv().await, DaemonMessage::Error { .. }));

    server.shutdown().await;
}

#[tokio::test]
async fn test_ping_pong() {
    let server = TestServer::spawn().await;
    let mut client = server.connect_ready().await;

    client.send(ClientMessage::ping(42)).await;
    assert_eq!(client.recv().await, DaemonMessage::pong(42));

    server.shutdown().await;
}

#[tokio::test]
async fn test_malformed_line_keeps_connection() {
    let server = TestServer::spawn().await;
    let mut client = server.connect_ready().await;

    client.send_raw("{not json").await;
    match client.recv().await {
        DaemonMessage::Error { code, .. } => assert_eq!(code.as_deref(), Some("parse")),
        other => panic!("Expected Error, got {other:?}"),
    }

    client.send(ClientMessage::ping(1)).await;
    assert_eq!(client.recv().await, DaemonMessage::pong(1));

    server.shutdown().await;
}

// ============================================================================
// Control Requests
// ============================================================================

#[tokio::test]
async fn test_start_list_stop() {
    let server = TestServer::spawn().await;
    let mut client = server.connect_ready().await;
    let id = EntryId::new("web");

    client
        .send(ClientMessage::start(
            id.clone(),
            server.workdir(),
            sh("sleep 30"),
            Default::default(),
        ))
        .await;
    assert_eq!(client.recv().await, DaemonMessage::started(id.clone()));

    client.send(ClientMessage::list_entries()).await;
    match client.recv().await {
        DaemonMessage::EntryList { entries } => {
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].id, id);
            assert_eq!(entries[0].state, LifecycleState::Running);
            assert!(entries[0].pid.is_some());
        }
        other => panic!("Expected EntryList, got {other:?}"),
    }

    client.send(ClientMessage::stop(id.clone(), None, None)).await;
    assert_eq!(client.recv().await, DaemonMessage::stopped(id));

    client.send(ClientMessage::list_entries()).await;
    assert_eq!(client.recv().await, DaemonMessage::entry_list(Vec::new()));

    server.shutdown().await;
}

#[tokio::test]
async fn test_validation_error_has_code() {
    let server = TestServer::spawn().await;
    let mut client = server.connect_ready().await;

    client
        .send(ClientMessage::start(
            EntryId::new("web"),
            server.workdir().join("missing"),
            sh("true"),
            Default::default(),
        ))
        .await;

    match client.recv().await {
        DaemonMessage::Error { message, code } => {
            assert_eq!(code.as_deref(), Some("validation"));
            assert!(message.contains("missing"), "got: {message}");
        }
        other => panic!("Expected Error, got {other:?}"),
    }

    server.shutdown().await;
}

// ============================================================================
// Log Streaming
// ============================================================================

#[tokio::test]
async fn test_subscribe_streams_service_output() {
    let server = TestServer::spawn().await;
    let mut client = server.connect_ready().await;
    let id = EntryId::new("printer");

    client.send(ClientMessage::subscribe(id.clone())).await;
    assert_eq!(client.recv().await, DaemonMessage::subscribed(id.clone()));

    client
        .send(ClientMessage::start(
            id.clone(),
            server.workdir(),
            sh("echo hello; echo world; sleep 30"),
            Default::default(),
        ))
        .await;

    // Output arrives in chunks; reassemble it
    let mut output = String::new();
    while output.lines().count() < 2 {
        match client.recv().await {
            DaemonMessage::Log { id: from, text } => {
                assert_eq!(from, id);
                output.push_str(&text);
            }
            DaemonMessage::Started { .. } => {}
            other => panic!("Unexpected message {other:?}"),
        }
    }
    assert_eq!(output, "hello\nworld\n");

    client.send(ClientMessage::unsubscribe(id.clone())).await;
    client.send(ClientMessage::stop(id.clone(), None, None)).await;
    let reply = client
        .recv_until(|m| matches!(m, DaemonMessage::Stopped { .. }))
        .await;
    assert_eq!(reply, DaemonMessage::stopped(id));

    server.shutdown().await;
}

#[tokio::test]
async fn test_run_one_off_with_follow() {
    let server = TestServer::spawn().await;
    let mut client = server.connect_ready().await;

    client
        .send(ClientMessage::run_one_off(
            server.workdir(),
            sh("echo first; echo second"),
            true,
        ))
        .await;

    let job_id = match client.recv().await {
        DaemonMessage::JobStarted { job_id } => job_id,
        other => panic!("Expected JobStarted, got {other:?}"),
    };
    assert!(job_id.is_job());

    let mut output = String::new();
    loop {
        match client.recv().await {
            DaemonMessage::Log { id, text } => {
                assert_eq!(id, job_id);
                output.push_str(&text);
                if text.contains("job finished") {
                    break;
                }
            }
            other => panic!("Unexpected message {other:?}"),
        }
    }
    let lines: Vec<&str> = output.lines().collect();
    assert_eq!(lines[..2], ["first", "second"]);
    assert!(lines[2].starts_with("[devctl] job finished"));

    // The finished job's channel is released; the connection keeps working
    client.send(ClientMessage::ping(3)).await;
    assert_eq!(client.recv().await, DaemonMessage::pong(3));
    assert_eq!(server.supervisor.logs().channel_count(), 0);

    server.shutdown().await;
}

// ============================================================================
// Resource Snapshots
// ============================================================================

#[tokio::test]
async fn test_watch_resources_streams_snapshots() {
    let server = TestServer::spawn().await;
    let mut client = server.connect_ready().await;

    client
        .send(ClientMessage::start(
            EntryId::new("svc"),
            server.workdir(),
            sh("sleep 30"),
            Default::default(),
        ))
        .await;
    assert!(matches!(client.recv().await, DaemonMessage::Started { .. }));

    client.send(ClientMessage::watch_resources()).await;

    for _ in 0..2 {
        match client.recv().await {
            DaemonMessage::Resources { snapshot } => {
                assert_eq!(snapshot.active_services, 1);
                assert_eq!(snapshot.repository_count, 4);
                assert!(snapshot.memory_of("svc").is_some());
                assert!(snapshot.memory_of("devctld").is_some());
                assert!(snapshot.peak_memory_bytes >= snapshot.used_memory_bytes);
            }
            other => panic!("Expected Resources, got {other:?}"),
        }
    }

    client.send(ClientMessage::unwatch_resources()).await;
    client.send(ClientMessage::ping(7)).await;
    let pong = client
        .recv_until(|m| !matches!(m, DaemonMessage::Resources { .. }))
        .await;
    assert_eq!(pong, DaemonMessage::pong(7));

    server.shutdown().await;
}

#[tokio::test]
async fn test_server_removes_socket_on_shutdown() {
    let server = TestServer::spawn().await;
    let socket_path = server.socket_path.clone();

    server.cancel_token.cancel();
    let gone = timeout(Duration::from_secs(2), async {
        while socket_path.exists() {
            sleep(SOCKET_POLL_INTERVAL).await;
        }
    })
    .await;
    assert!(gone.is_ok(), "socket file should be removed");

    server.shutdown().await;
}

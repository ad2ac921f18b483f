//! Daemon management for the devctl CLI.
//!
//! Starts `devctld` in the background when its socket is not accepting
//! connections.

use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

/// How long to wait for a freshly spawned daemon to listen
const STARTUP_WAIT: Duration = Duration::from_secs(3);

const STARTUP_POLL: Duration = Duration::from_millis(100);

/// Returns true if something accepts connections on `socket_path`.
pub fn is_daemon_listening(socket_path: &Path) -> bool {
    UnixStream::connect(socket_path).is_ok()
}

/// Locates `devctld`: next to the current binary, else on `PATH`.
fn daemon_binary() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.join("devctld")))
        .filter(|p| p.exists())
        .unwrap_or_else(|| PathBuf::from("devctld"))
}

/// Starts the daemon in the background.
fn spawn_daemon(socket_path: &Path) -> std::io::Result<()> {
    let binary = daemon_binary();
    debug!(path = %binary.display(), "Starting daemon");

    Command::new(&binary)
        .args(["start", "-d"])
        .env(crate::client::SOCKET_ENV, socket_path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;

    Ok(())
}

/// Ensures the daemon is listening, starting it if necessary.
pub fn ensure_daemon_running(socket_path: &Path) -> Result<(), String> {
    if is_daemon_listening(socket_path) {
        debug!("Daemon already running");
        return Ok(());
    }

    info!("Daemon not running, starting it...");
    spawn_daemon(socket_path).map_err(|e| format!("Failed to start daemon: {e}"))?;

    let attempts = STARTUP_WAIT.as_millis() / STARTUP_POLL.as_millis();
    for i in 0..attempts {
        thread::sleep(STARTUP_POLL);
        if is_daemon_listening(socket_path) {
            info!(attempts = i + 1, "Daemon started successfully");
            return Ok(());
        }
    }

    Err(format!(
        "Daemon failed to start within {} seconds",
        STARTUP_WAIT.as_secs()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;

    #[test]
    fn test_listening_socket_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.sock");
        assert!(!is_daemon_listening(&path));

        let _listener = UnixListener::bind(&path).unwrap();
        assert!(is_daemon_listening(&path));
        assert!(ensure_daemon_running(&path).is_ok());
    }
}

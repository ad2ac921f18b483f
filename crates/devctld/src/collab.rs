//! Injected collaborators for the resource meter.
//!
//! The meter does not know how containers are run or where repositories are
//! registered; it asks these traits. Failures degrade to empty results so a
//! missing container runtime never blocks a snapshot.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use devctl_core::ContainerUsage;

/// Upper bound on one container stats query.
pub const CONTAINER_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from collaborator queries.
#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error("Failed to run {binary}: {reason}")]
    Launch { binary: String, reason: String },

    #[error("{binary} exited with {status}")]
    Failed { binary: String, status: String },

    #[error("{binary} did not answer within {}s", .timeout.as_secs())]
    TimedOut { binary: String, timeout: Duration },

    #[error("Failed to read {}: {reason}", path.display())]
    Read { path: PathBuf, reason: String },

    #[error("Failed to parse {}: {reason}", path.display())]
    Parse { path: PathBuf, reason: String },
}

/// Reports memory used by running containers.
#[async_trait]
pub trait ContainerInspector: Send + Sync {
    async fn container_memory(&self) -> Result<Vec<ContainerUsage>, CollaboratorError>;
}

/// Reports how many repositories the workspace knows about.
#[async_trait]
pub trait WorkspaceRegistry: Send + Sync {
    async fn repository_count(&self) -> Result<usize, CollaboratorError>;
}

// ============================================================================
// Containers
// ============================================================================

/// Container inspection disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoContainers;

#[async_trait]
impl ContainerInspector for NoContainers {
    async fn container_memory(&self) -> Result<Vec<ContainerUsage>, CollaboratorError> {
        Ok(Vec::new())
    }
}

/// Reads `<binary> stats --no-stream` from a Docker-compatible CLI.
#[derive(Debug, Clone)]
pub struct DockerStats {
    binary: String,
}

impl DockerStats {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl ContainerInspector for DockerStats {
    async fn container_memory(&self) -> Result<Vec<ContainerUsage>, CollaboratorError> {
        let query = Command::new(&self.binary)
            .args(["stats", "--no-stream", "--format", "{{.Name}}\t{{.MemUsage}}"])
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = timeout(CONTAINER_QUERY_TIMEOUT, query)
            .await
            .map_err(|_| CollaboratorError::TimedOut {
                binary: self.binary.clone(),
                timeout: CONTAINER_QUERY_TIMEOUT,
            })?
            .map_err(|e| CollaboratorError::Launch {
                binary: self.binary.clone(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(CollaboratorError::Failed {
                binary: self.binary.clone(),
                status: output.status.to_string(),
            });
        }

        let usage = parse_stats_output(&String::from_utf8_lossy(&output.stdout));
        debug!(binary = %self.binary, containers = usage.len(), "Queried container memory");
        Ok(usage)
    }
}

/// Parses `name<TAB>used / limit` lines. Unparseable lines are skipped.
pub fn parse_stats_output(text: &str) -> Vec<ContainerUsage> {
    text.lines()
        .filter_map(|line| {
            let (name, usage) = line.split_once('\t')?;
            let used = usage.split('/').next()?;
            Some(ContainerUsage {
                name: name.trim().to_string(),
                memory_bytes: parse_memory_size(used)?,
            })
        })
        .collect()
}

/// Parses sizes like `12.5MiB`, `512kB` or `1.2GB` into bytes.
pub fn parse_memory_size(text: &str) -> Option<u64> {
    let text = text.trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let value: f64 = number.parse().ok()?;

    let multiplier: f64 = match unit.trim() {
        "" | "B" => 1.0,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        "kB" | "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        _ => return None,
    };

    Some((value * multiplier).round() as u64)
}

// ============================================================================
// Workspace
// ============================================================================

/// A fixed repository count.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticWorkspace(pub usize);

#[async_trait]
impl WorkspaceRegistry for StaticWorkspace {
    async fn repository_count(&self) -> Result<usize, CollaboratorError> {
        Ok(self.0)
    }
}

/// Counts repositories listed in a JSON file.
///
/// Accepts either a top-level array or an object with a `repositories`
/// array. A missing file counts as zero.
#[derive(Debug, Clone)]
pub struct WorkspaceFile {
    path: PathBuf,
}

impl WorkspaceFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl WorkspaceRegistry for WorkspaceFile {
    async fn repository_count(&self) -> Result<usize, CollaboratorError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(CollaboratorError::Read {
                    path: self.path.clone(),
                    reason: e.to_string(),
                })
            }
        };

        let value: serde_json::Value =
            serde_json::from_str(&content).map_err(|e| CollaboratorError::Parse {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;

        let list = match &value {
            serde_json::Value::Array(items) => Some(items),
            other => other.get("repositories").and_then(|v| v.as_array()),
        };

        list.map(Vec::len).ok_or_else(|| CollaboratorError::Parse {
            path: self.path.clone(),
            reason: "expected an array or a 'repositories' array".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory_size_units() {
        assert_eq!(parse_memory_size("512B"), Some(512));
        assert_eq!(parse_memory_size("1KiB"), Some(1024));
        assert_eq!(parse_memory_size("12.5MiB"), Some(13_107_200));
        assert_eq!(parse_memory_size(" 1.5GB "), Some(1_500_000_000));
        assert_eq!(parse_memory_size("3kB"), Some(3000));
        assert_eq!(parse_memory_size("lots"), None);
        assert_eq!(parse_memory_size("4 parsecs"), None);
    }

    #[test]
    fn test_parse_stats_output() {
        let out = "db\t120MiB / 1.944GiB\ncache\t8.5MiB / 1.944GiB\ngarbage line\n";
        let usage = parse_stats_output(out);

        assert_eq!(usage.len(), 2);
        assert_eq!(usage[0].name, "db");
        assert_eq!(usage[0].memory_bytes, 120 * 1024 * 1024);
        assert_eq!(usage[1].name, "cache");
    }

    #[tokio::test]
    async fn test_missing_container_binary_is_an_error() {
        let inspector = DockerStats::new("devctl-no-such-container-cli");
        let err = inspector.container_memory().await.unwrap_err();
        assert!(matches!(err, CollaboratorError::Launch { .. }));
    }

    #[tokio::test]
    async fn test_workspace_file_shapes() {
        let dir = tempfile::tempdir().unwrap();

        let array = dir.path().join("array.json");
        std::fs::write(&array, r#"["a", "b", "c"]"#).unwrap();
        assert_eq!(WorkspaceFile::new(&array).repository_count().await.unwrap(), 3);

        let object = dir.path().join("object.json");
        std::fs::write(&object, r#"{"repositories": [{"path": "/src/a"}]}"#).unwrap();
        assert_eq!(WorkspaceFile::new(&object).repository_count().await.unwrap(), 1);

        let missing = dir.path().join("missing.json");
        assert_eq!(WorkspaceFile::new(&missing).repository_count().await.unwrap(), 0);

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, r#"{"projects": 4}"#).unwrap();
        assert!(WorkspaceFile::new(&bad).repository_count().await.is_err());
    }
}

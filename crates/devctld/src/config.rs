//! Daemon configuration.
//!
//! Loaded from a TOML file (by default `<config dir>/devctl/config.toml`).
//! Every key is optional; a missing default file means all defaults. The
//! socket path can also be overridden with `DEVCTL_SOCKET`.
//!
//! ```toml
//! socket_path = "/tmp/devctl.sock"
//!
//! [restart]
//! uptime_threshold_ms = 10000
//! max_restarts = 5
//! backoff_ms = 5000
//!
//! [stop]
//! shutdown_timeout_ms = 15000
//!
//! [logs]
//! channel_capacity = 1024
//!
//! [meter]
//! interval_ms = 10000
//!
//! [collaborators]
//! container_inspection = true
//! container_binary = "docker"
//! workspace_file = "/home/me/.config/devctl/workspace.json"
//! ```

use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use devctl_core::{lifecycle, RestartPolicy};

use crate::broadcast::DEFAULT_CHANNEL_CAPACITY;
use crate::collab::{
    ContainerInspector, DockerStats, NoContainers, StaticWorkspace, WorkspaceFile,
    WorkspaceRegistry,
};
use crate::meter::DEFAULT_METER_INTERVAL;
use crate::registry::{SupervisorConfig, DEFAULT_SHUTDOWN_TIMEOUT};
use crate::server::DEFAULT_SOCKET_PATH;

/// Environment variable overriding the socket path.
pub const SOCKET_ENV: &str = "DEVCTL_SOCKET";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    pub socket_path: Option<PathBuf>,
    pub restart: RestartSection,
    pub stop: StopSection,
    pub logs: LogsSection,
    pub meter: MeterSection,
    pub collaborators: CollaboratorSection,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RestartSection {
    pub uptime_threshold_ms: u64,
    pub max_restarts: u32,
    pub backoff_ms: u64,
}

impl Default for RestartSection {
    fn default() -> Self {
        Self {
            uptime_threshold_ms: lifecycle::DEFAULT_UPTIME_THRESHOLD.as_millis() as u64,
            max_restarts: lifecycle::DEFAULT_MAX_RESTARTS,
            backoff_ms: lifecycle::DEFAULT_BACKOFF.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct StopSection {
    pub shutdown_timeout_ms: u64,
}

impl Default for StopSection {
    fn default() -> Self {
        Self {
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct LogsSection {
    pub channel_capacity: usize,
}

impl Default for LogsSection {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct MeterSection {
    pub interval_ms: u64,
}

impl Default for MeterSection {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_METER_INTERVAL.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct CollaboratorSection {
    pub container_inspection: bool,
    pub container_binary: String,
    pub workspace_file: Option<PathBuf>,
}

impl Default for CollaboratorSection {
    fn default() -> Self {
        Self {
            container_inspection: true,
            container_binary: "docker".to_string(),
            workspace_file: None,
        }
    }
}

/// Default config file location.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("devctl").join("config.toml"))
}

impl DaemonConfig {
    /// Loads the config.
    ///
    /// With an explicit `path` the file must exist. Without one, the default
    /// location is used if present.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => match default_config_path() {
                Some(path) if path.is_file() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.logs.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "logs.channel_capacity must be at least 1".to_string(),
            ));
        }
        if self.meter.interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "meter.interval_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Socket path: `DEVCTL_SOCKET`, then the file, then the default.
    pub fn socket_path(&self) -> PathBuf {
        env::var_os(SOCKET_ENV)
            .map(PathBuf::from)
            .or_else(|| self.socket_path.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH))
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            uptime_threshold: Duration::from_millis(self.restart.uptime_threshold_ms),
            max_restarts: self.restart.max_restarts,
            backoff: Duration::from_millis(self.restart.backoff_ms),
        }
    }

    pub fn meter_interval(&self) -> Duration {
        Duration::from_millis(self.meter.interval_ms)
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            policy: self.restart_policy(),
            shutdown_timeout: Duration::from_millis(self.stop.shutdown_timeout_ms),
            log_capacity: self.logs.channel_capacity,
            ..SupervisorConfig::default()
        }
    }

    pub fn container_inspector(&self) -> Arc<dyn ContainerInspector> {
        if self.collaborators.container_inspection {
            Arc::new(DockerStats::new(&self.collaborators.container_binary))
        } else {
            Arc::new(NoContainers)
        }
    }

    pub fn workspace_registry(&self) -> Arc<dyn WorkspaceRegistry> {
        match &self.collaborators.workspace_file {
            Some(path) => Arc::new(WorkspaceFile::new(path)),
            None => Arc::new(StaticWorkspace(0)),
        }
    }
}

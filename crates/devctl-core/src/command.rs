//! Structured commands and launch validation.
//!
//! Commands travel as `{binary, args}` from the wire to `exec`; nothing in
//! the system concatenates or re-parses shell strings.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ValidationError, ValidationResult};

// ============================================================================
// Command Spec
// ============================================================================

/// A program and its argument vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Program name (looked up on `PATH`) or path to an executable
    pub binary: String,

    /// Arguments passed verbatim to the program
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    /// Creates a command from a binary and any iterable of arguments.
    pub fn new<I, S>(binary: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            binary: binary.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns the rule for this command's binary, if it needs a manifest.
    pub fn manifest_rule(&self) -> Option<&'static ManifestRule> {
        manifest_rule_for(&self.binary)
    }
}

impl fmt::Display for CommandSpec {
    /// Renders the command for humans. Arguments with whitespace are quoted;
    /// the output is never fed back to a shell.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.binary)?;
        for arg in &self.args {
            if arg.is_empty() || arg.chars().any(char::is_whitespace) {
                write!(f, " {arg:?}")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

// ============================================================================
// Process Config
// ============================================================================

/// Everything needed to (re)spawn a supervised process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Working directory of the child
    pub directory: PathBuf,

    /// Program and arguments
    pub command: CommandSpec,

    /// Environment overrides applied on top of the daemon's environment
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl ProcessConfig {
    pub fn new(directory: impl Into<PathBuf>, command: CommandSpec) -> Self {
        Self {
            directory: directory.into(),
            command,
            env: BTreeMap::new(),
        }
    }

    /// Adds environment overrides.
    #[must_use]
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Validates the config against the filesystem and the given `PATH`.
    ///
    /// Checks, in order: the directory exists, the binary resolves to an
    /// executable file, and any manifest required by the binary's kind is
    /// present in the directory. Returns the resolved executable path, which
    /// is what gets spawned.
    pub fn validate(&self, path_var: Option<&OsStr>) -> ValidationResult<PathBuf> {
        if !self.directory.is_dir() {
            return Err(ValidationError::DirectoryNotFound {
                path: self.directory.clone(),
            });
        }

        let resolved = resolve_binary(&self.command.binary, &self.directory, path_var)?;

        if let Some(rule) = self.command.manifest_rule() {
            rule.check(&self.directory, &self.command.binary)?;
        }

        Ok(resolved)
    }
}

// ============================================================================
// Binary Resolution
// ============================================================================

/// Resolves a binary to an executable path.
///
/// Names containing a path separator are taken relative to `directory`
/// (the child's working directory); bare names are searched on `path_var`.
pub fn resolve_binary(
    binary: &str,
    directory: &Path,
    path_var: Option<&OsStr>,
) -> ValidationResult<PathBuf> {
    if binary.trim().is_empty() {
        return Err(ValidationError::EmptyBinary);
    }

    let as_path = Path::new(binary);
    if as_path.components().count() > 1 || as_path.is_absolute() {
        let candidate = if as_path.is_absolute() {
            as_path.to_path_buf()
        } else {
            directory.join(as_path)
        };
        return executable_candidates(&candidate)
            .into_iter()
            .find(|p| is_executable(p))
            .ok_or_else(|| ValidationError::BinaryNotFound {
                binary: binary.to_string(),
            });
    }

    path_var
        .map(std::env::split_paths)
        .into_iter()
        .flatten()
        .filter(|dir| !dir.as_os_str().is_empty())
        .flat_map(|dir| executable_candidates(&dir.join(binary)))
        .find(|p| is_executable(p))
        .ok_or_else(|| ValidationError::BinaryNotFound {
            binary: binary.to_string(),
        })
}

#[cfg(windows)]
fn executable_candidates(base: &Path) -> Vec<PathBuf> {
    let mut out = vec![base.to_path_buf()];
    if base.extension().is_none() {
        let exts = std::env::var("PATHEXT").unwrap_or_else(|_| ".COM;.EXE;.BAT;.CMD".to_string());
        out.extend(
            exts.split(';')
                .filter(|e| !e.is_empty())
                .map(|e| base.with_extension(e.trim_start_matches('.'))),
        );
    }
    out
}

#[cfg(not(windows))]
fn executable_candidates(base: &Path) -> Vec<PathBuf> {
    vec![base.to_path_buf()]
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

// ============================================================================
// Manifest Rules
// ============================================================================

/// Broad category of a launched binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryKind {
    /// Package managers that operate on a project manifest (npm, cargo, ...)
    PackageManager,
    /// Container tooling that needs a container definition (docker, podman)
    Container,
}

/// Files that must exist in the working directory before a binary of a
/// given kind may be launched there. Any one of `manifests` satisfies it.
#[derive(Debug, PartialEq, Eq)]
pub struct ManifestRule {
    pub kind: BinaryKind,
    pub binaries: &'static [&'static str],
    pub manifests: &'static [&'static str],
}

impl ManifestRule {
    /// Fails with `ManifestMissing` unless one of the manifests exists.
    pub fn check(&self, directory: &Path, binary: &str) -> ValidationResult<()> {
        if self.manifests.iter().any(|m| directory.join(m).is_file()) {
            return Ok(());
        }
        Err(ValidationError::ManifestMissing {
            binary: binary.to_string(),
            directory: directory.to_path_buf(),
            expected: self.manifests.join(" or "),
        })
    }
}

const COMPOSE_FILES: &[&str] = &[
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
    "Dockerfile",
    "Containerfile",
];

/// Known binaries with manifest requirements.
pub const MANIFEST_RULES: &[ManifestRule] = &[
    ManifestRule {
        kind: BinaryKind::PackageManager,
        binaries: &["npm", "pnpm", "yarn", "bun"],
        manifests: &["package.json"],
    },
    ManifestRule {
        kind: BinaryKind::PackageManager,
        binaries: &["cargo"],
        manifests: &["Cargo.toml"],
    },
    ManifestRule {
        kind: BinaryKind::Container,
        binaries: &["docker", "docker-compose", "podman", "podman-compose"],
        manifests: COMPOSE_FILES,
    },
];

/// Looks up the manifest rule for a binary.
///
/// Matching uses the file stem, so `/usr/local/bin/npm` and `npm.cmd`
/// both match `npm`.
pub fn manifest_rule_for(binary: &str) -> Option<&'static ManifestRule> {
    let stem = Path::new(binary)
        .file_stem()
        .and_then(OsStr::to_str)?
        .to_ascii_lowercase();

    MANIFEST_RULES
        .iter()
        .find(|rule| rule.binaries.contains(&stem.as_str()))
}

//! Launch validation errors.

use std::path::PathBuf;
use thiserror::Error;

/// Errors returned synchronously by start/run requests, before any process
/// is spawned or any entry is created.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Service id was empty or whitespace
    #[error("Entry id must not be empty")]
    EmptyId,

    /// Service id collides with the generated job namespace
    #[error("Entry id '{id}' uses the reserved prefix '{prefix}'")]
    ReservedId { id: String, prefix: &'static str },

    /// Working directory does not exist
    #[error("Directory not found: {}", path.display())]
    DirectoryNotFound { path: PathBuf },

    /// Binary name was empty
    #[error("Binary must not be empty")]
    EmptyBinary,

    /// Binary could not be resolved to an executable
    #[error("Binary not found: '{binary}' is not installed or not on PATH")]
    BinaryNotFound { binary: String },

    /// Required project or container manifest is missing
    #[error("'{binary}' needs {expected} in {}", directory.display())]
    ManifestMissing {
        binary: String,
        directory: PathBuf,
        expected: String,
    },
}

/// Result type for validation.
pub type ValidationResult<T> = Result<T, ValidationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::DirectoryNotFound {
            path: PathBuf::from("backend/missing"),
        };
        assert_eq!(err.to_string(), "Directory not found: backend/missing");

        let err = ValidationError::BinaryNotFound {
            binary: "pnpm".to_string(),
        };
        assert!(err.to_string().contains("pnpm"));

        let err = ValidationError::ManifestMissing {
            binary: "npm".to_string(),
            directory: PathBuf::from("/srv/web"),
            expected: "package.json".to_string(),
        };
        assert_eq!(err.to_string(), "'npm' needs package.json in /srv/web");
    }
}

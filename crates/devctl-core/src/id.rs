//! Identifiers for supervised entries, jobs and their log channels.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix reserved for identifiers allocated to one-off jobs.
pub const JOB_ID_PREFIX: &str = "job-";

/// Identifier of a supervised service or one-off job.
///
/// Services use a caller-chosen stable id (e.g. "svc-api"); jobs get a
/// generated id carrying [`JOB_ID_PREFIX`]. The same id names the log
/// channel the entry's output is published on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(String);

impl EntryId {
    /// Creates a new EntryId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Allocates a job id from a millisecond timestamp and a sequence number.
    ///
    /// The sequence number keeps ids unique when several jobs start within
    /// the same millisecond.
    pub fn job(timestamp_millis: i64, seq: u64) -> Self {
        Self(format!("{JOB_ID_PREFIX}{timestamp_millis}-{seq}"))
    }

    /// Checks if this id names a one-off job.
    #[must_use]
    pub fn is_job(&self) -> bool {
        self.0.starts_with(JOB_ID_PREFIX)
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true for the empty id (never valid for a service).
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for EntryId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for EntryId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for EntryId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_ids_are_prefixed_and_unique() {
        let a = EntryId::job(1_700_000_000_000, 1);
        let b = EntryId::job(1_700_000_000_000, 2);

        assert!(a.is_job());
        assert_eq!(a.as_str(), "job-1700000000000-1");
        assert_ne!(a, b);
    }

    #[test]
    fn test_service_id_is_not_job() {
        let id = EntryId::new("svc-api");
        assert!(!id.is_job());
        assert_eq!(id.to_string(), "svc-api");
    }

    #[test]
    fn test_blank_id_is_empty() {
        assert!(EntryId::new("").is_empty());
        assert!(EntryId::new("   ").is_empty());
        assert!(!EntryId::new("web").is_empty());
    }

    #[test]
    fn test_serializes_as_plain_string() {
        let json = serde_json::to_string(&EntryId::new("svc-a")).unwrap();
        assert_eq!(json, "\"svc-a\"");
    }
}

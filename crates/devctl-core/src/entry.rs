//! Read-only view of registry entries for clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{EntryId, LifecycleState};

/// Whether an entry is a supervised service or a one-off job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Service,
    Job,
}

/// Summary of one registry entry, as returned by `list_entries`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySummary {
    pub id: EntryId,
    pub kind: EntryKind,
    pub state: LifecycleState,
    /// Pid of the live child, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Always 0 for jobs
    pub restart_count: u32,
    /// When the current (or last) child was spawned
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_start: Option<DateTime<Utc>>,
    /// Human-readable command line
    pub command: String,
}

impl EntrySummary {
    /// Returns true if a child process is currently alive.
    pub fn has_live_child(&self) -> bool {
        self.pid.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_skips_missing_pid() {
        let summary = EntrySummary {
            id: EntryId::new("web"),
            kind: EntryKind::Service,
            state: LifecycleState::BackoffWait,
            pid: None,
            restart_count: 2,
            last_start: None,
            command: "npm run dev".to_string(),
        };

        let json = serde_json::to_string(&summary).unwrap();
        assert!(!json.contains("\"pid\""));
        assert!(json.contains("\"state\":\"backoff_wait\""));
        assert!(!summary.has_live_child());
    }
}

//! Resource usage snapshots pushed to dashboard clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a metered process tree belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RootKind {
    /// A supervised long-running service
    Service,
    /// A one-off job
    Job,
    /// The daemon's own process
    Supervisor,
}

/// Memory used by one tracked root and everything it spawned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootUsage {
    pub kind: RootKind,
    /// Entry id, or "devctld" for the daemon itself
    pub id: String,
    pub pid: u32,
    /// Number of live processes in the subtree, root included
    pub process_count: usize,
    /// Summed resident memory of the subtree
    pub memory_bytes: u64,
}

/// Memory reported for a container by the container collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerUsage {
    pub name: String,
    pub memory_bytes: u64,
}

/// Point-in-time aggregate resource view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub taken_at: DateTime<Utc>,

    /// Total physical memory of the machine
    pub total_memory_bytes: u64,

    /// Sum of every root's memory plus container memory
    pub used_memory_bytes: u64,

    /// Highest `used_memory_bytes` seen since the daemon started
    pub peak_memory_bytes: u64,

    /// Logical CPU count
    pub cpu_count: usize,

    /// Repositories known to the workspace registry
    pub repository_count: usize,

    /// Services currently tracked
    pub active_services: usize,

    /// Jobs currently running
    pub active_jobs: usize,

    /// Per-root breakdown
    pub roots: Vec<RootUsage>,

    /// Per-container breakdown
    pub containers: Vec<ContainerUsage>,

    /// Sum of `containers`
    pub container_memory_bytes: u64,
}

impl ResourceSnapshot {
    /// Memory of a single root by id.
    pub fn memory_of(&self, id: &str) -> Option<u64> {
        self.roots
            .iter()
            .find(|r| r.id == id)
            .map(|r| r.memory_bytes)
    }

    /// Active services plus running jobs.
    pub fn active_count(&self) -> usize {
        self.active_services + self.active_jobs
    }
}

/// Tracks the historical peak of used memory.
///
/// The peak never decreases for the lifetime of the tracker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeakTracker {
    peak: u64,
}

impl PeakTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an observation and returns the updated peak.
    pub fn observe(&mut self, used: u64) -> u64 {
        self.peak = self.peak.max(used);
        self.peak
    }

    pub fn peak(&self) -> u64 {
        self.peak
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peak_is_monotonic() {
        let mut tracker = PeakTracker::new();
        assert_eq!(tracker.observe(100), 100);
        assert_eq!(tracker.observe(40), 100);
        assert_eq!(tracker.observe(250), 250);
        assert_eq!(tracker.observe(0), 250);
        assert_eq!(tracker.peak(), 250);
    }

    #[test]
    fn test_snapshot_lookup() {
        let snapshot = ResourceSnapshot {
            taken_at: Utc::now(),
            total_memory_bytes: 8 << 30,
            used_memory_bytes: 300,
            peak_memory_bytes: 300,
            cpu_count: 8,
            repository_count: 3,
            active_services: 2,
            active_jobs: 1,
            roots: vec![RootUsage {
                kind: RootKind::Service,
                id: "svc-a".to_string(),
                pid: 42,
                process_count: 3,
                memory_bytes: 200,
            }],
            containers: Vec::new(),
            container_memory_bytes: 0,
        };

        assert_eq!(snapshot.memory_of("svc-a"), Some(200));
        assert_eq!(snapshot.memory_of("svc-b"), None);
        assert_eq!(snapshot.active_count(), 3);
    }

    #[test]
    fn test_root_kind_serialization() {
        let json = serde_json::to_string(&RootKind::Supervisor).unwrap();
        assert_eq!(json, "\"supervisor\"");
    }
}

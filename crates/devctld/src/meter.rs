//! Resource metering for supervised process trees.
//!
//! Every sample takes one process table snapshot and charges each process to
//! exactly one tracked root: service and job roots claim their subtrees
//! first, and the daemon's own root keeps whatever it spawned that no entry
//! claimed (shutdown commands, container queries). Used memory is the sum of
//! every root plus container memory; the peak never decreases.
//!
//! Resource streams are per subscriber: one immediate sample, then one per
//! interval, until the subscriber's cancellation token fires.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - A poisoned lock is recovered; a failed collaborator yields empty data

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use devctl_core::{PeakTracker, ResourceSnapshot, RootKind, RootUsage};

use crate::collab::{ContainerInspector, WorkspaceRegistry};
use crate::proctable::ProcessTable;
use crate::registry::{SupervisorHandle, TrackedRoot, TrackedRoots};

/// Default interval between pushed snapshots.
pub const DEFAULT_METER_INTERVAL: Duration = Duration::from_secs(10);

/// How often the daemon logs its own usage summary.
pub const USAGE_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Root id reported for the daemon process.
pub const SUPERVISOR_ROOT_ID: &str = "devctld";

/// Samples memory of tracked process trees.
#[derive(Clone)]
pub struct ResourceMeter {
    table: Arc<Mutex<Box<dyn ProcessTable>>>,
    peak: Arc<Mutex<PeakTracker>>,
    containers: Arc<dyn ContainerInspector>,
    workspace: Arc<dyn WorkspaceRegistry>,
    cpu_count: usize,
}

impl ResourceMeter {
    pub fn new(
        table: Box<dyn ProcessTable>,
        containers: Arc<dyn ContainerInspector>,
        workspace: Arc<dyn WorkspaceRegistry>,
    ) -> Self {
        let cpu_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self {
            table: Arc::new(Mutex::new(table)),
            peak: Arc::new(Mutex::new(PeakTracker::new())),
            containers,
            workspace,
            cpu_count,
        }
    }

    fn lock_peak(&self) -> MutexGuard<'_, PeakTracker> {
        self.peak.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Highest used memory seen so far.
    pub fn peak(&self) -> u64 {
        self.lock_peak().peak()
    }

    /// Takes one snapshot of the given roots plus the daemon itself.
    pub async fn sample(&self, tracked: TrackedRoots) -> ResourceSnapshot {
        let mut roots = tracked.roots;
        roots.push(TrackedRoot {
            kind: RootKind::Supervisor,
            id: SUPERVISOR_ROOT_ID.to_string(),
            pid: std::process::id(),
        });

        let table = Arc::clone(&self.table);
        let measured = tokio::task::spawn_blocking(move || {
            let mut table = table.lock().unwrap_or_else(|e| e.into_inner());
            let usage = measure_roots(table.as_mut(), &roots);
            (usage, table.total_memory())
        })
        .await;

        let (usage, total_memory_bytes) = match measured {
            Ok(measured) => measured,
            Err(e) => {
                warn!(error = %e, "Process table sampling failed");
                (Vec::new(), 0)
            }
        };

        let containers = self.containers.container_memory().await.unwrap_or_else(|e| {
            debug!(error = %e, "Container memory unavailable");
            Vec::new()
        });
        let repository_count = self.workspace.repository_count().await.unwrap_or_else(|e| {
            debug!(error = %e, "Repository count unavailable");
            0
        });

        let container_memory_bytes: u64 = containers.iter().map(|c| c.memory_bytes).sum();
        let used_memory_bytes =
            usage.iter().map(|r| r.memory_bytes).sum::<u64>() + container_memory_bytes;
        let peak_memory_bytes = self.lock_peak().observe(used_memory_bytes);

        ResourceSnapshot {
            taken_at: Utc::now(),
            total_memory_bytes,
            used_memory_bytes,
            peak_memory_bytes,
            cpu_count: self.cpu_count,
            repository_count,
            active_services: tracked.active_services,
            active_jobs: tracked.active_jobs,
            roots: usage,
            containers,
            container_memory_bytes,
        }
    }

    /// Asks the supervisor for its roots and samples them.
    pub async fn sample_supervisor(
        &self,
        supervisor: &SupervisorHandle,
    ) -> Option<ResourceSnapshot> {
        let tracked = supervisor.tracked_roots().await.ok()?;
        Some(self.sample(tracked).await)
    }
}

/// Charges every process in one snapshot to at most one root.
///
/// Service and job roots are measured before the supervisor root so the
/// daemon's own subtree never double counts its children.
pub fn measure_roots(table: &mut dyn ProcessTable, roots: &[TrackedRoot]) -> Vec<RootUsage> {
    let tree = table.snapshot();
    let mut claimed = HashSet::new();

    let ordered = roots
        .iter()
        .filter(|r| r.kind != RootKind::Supervisor)
        .chain(roots.iter().filter(|r| r.kind == RootKind::Supervisor));

    let members: Vec<(&TrackedRoot, Vec<u32>)> = ordered
        .map(|root| {
            let pids = if tree.contains(root.pid) {
                tree.subtree(root.pid)
                    .into_iter()
                    .filter(|pid| claimed.insert(*pid))
                    .collect()
            } else {
                Vec::new()
            };
            (root, pids)
        })
        .collect();

    let all: Vec<u32> = members.iter().flat_map(|(_, pids)| pids.iter().copied()).collect();
    let memory = table.resident_memory(&all);

    members
        .into_iter()
        .map(|(root, pids)| {
            let live: Vec<u64> = pids.iter().filter_map(|pid| memory.get(pid).copied()).collect();
            RootUsage {
                kind: root.kind,
                id: root.id.clone(),
                pid: root.pid,
                process_count: live.len(),
                memory_bytes: live.iter().sum(),
            }
        })
        .collect()
}

/// Streams snapshots for one subscriber: immediately, then every `period`.
///
/// The stream ends when `cancel` fires, the receiver is dropped, or the
/// supervisor goes away.
pub fn spawn_resource_stream(
    meter: ResourceMeter,
    supervisor: SupervisorHandle,
    period: Duration,
    cancel: CancellationToken,
) -> (mpsc::Receiver<ResourceSnapshot>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(1);

    let task = tokio::spawn(async move {
        let mut tick = interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                _ = tick.tick() => {
                    let sampled = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        sampled = meter.sample_supervisor(&supervisor) => sampled,
                    };
                    let Some(snapshot) = sampled else {
                        debug!("Resource stream stopping: supervisor gone");
                        break;
                    };
                    if tx.send(snapshot).await.is_err() {
                        break;
                    }
                }
            }
        }

        debug!("Resource stream stopped");
    });

    (rx, task)
}

/// Periodically logs aggregate usage, like a daemon health line.
pub fn spawn_usage_logger(
    meter: ResourceMeter,
    supervisor: SupervisorHandle,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (mut snapshots, _stream) =
            spawn_resource_stream(meter, supervisor, USAGE_LOG_INTERVAL, cancel_token);

        while let Some(snapshot) = snapshots.recv().await {
            let own = snapshot.memory_of(SUPERVISOR_ROOT_ID).unwrap_or(0);
            info!(
                used_mb = snapshot.used_memory_bytes / 1024 / 1024,
                peak_mb = snapshot.peak_memory_bytes / 1024 / 1024,
                daemon_mb = own / 1024 / 1024,
                services = snapshot.active_services,
                jobs = snapshot.active_jobs,
                "Resource usage"
            );
        }

        debug!("Usage logger stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{CollaboratorError, NoContainers, StaticWorkspace};
    use crate::proctable::FakeTable;
    use async_trait::async_trait;
    use devctl_core::ContainerUsage;

    fn root(kind: RootKind, id: &str, pid: u32) -> TrackedRoot {
        TrackedRoot {
            kind,
            id: id.to_string(),
            pid,
        }
    }

    //   100 (daemon)
    //   ├── 200 (svc-a)
    //   │   ├── 201
    //   │   │   └── 202
    //   │   └── 203
    //   ├── 300 (job)
    //   └── 400 (untracked helper)
    fn table() -> FakeTable {
        FakeTable {
            total: 16_000,
            ..FakeTable::default()
        }
        .with_process(100, Some(1), 50)
        .with_process(200, Some(100), 10)
        .with_process(201, Some(200), 20)
        .with_process(202, Some(201), 30)
        .with_process(203, Some(200), 40)
        .with_process(300, Some(100), 5)
        .with_process(400, Some(100), 7)
    }

    #[test]
    fn test_service_memory_is_subtree_sum() {
        let mut table = table();
        let usage = measure_roots(
            &mut table,
            &[
                root(RootKind::Supervisor, "devctld", 100),
                root(RootKind::Service, "svc-a", 200),
                root(RootKind::Job, "job-1-1", 300),
            ],
        );

        let svc = usage.iter().find(|u| u.id == "svc-a").unwrap();
        assert_eq!(svc.memory_bytes, 10 + 20 + 30 + 40);
        assert_eq!(svc.process_count, 4);

        let job = usage.iter().find(|u| u.id == "job-1-1").unwrap();
        assert_eq!(job.memory_bytes, 5);

        // The daemon keeps only itself and the untracked helper
        let daemon = usage.iter().find(|u| u.id == "devctld").unwrap();
        assert_eq!(daemon.memory_bytes, 50 + 7);
        assert_eq!(daemon.process_count, 2);

        let total: u64 = usage.iter().map(|u| u.memory_bytes).sum();
        assert_eq!(total, 162);
    }

    #[test]
    fn test_vanished_root_reports_zero() {
        let mut table = table();
        let usage = measure_roots(&mut table, &[root(RootKind::Service, "gone", 999)]);
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].memory_bytes, 0);
        assert_eq!(usage[0].process_count, 0);
    }

    struct FixedContainers;

    #[async_trait]
    impl ContainerInspector for FixedContainers {
        async fn container_memory(&self) -> Result<Vec<ContainerUsage>, CollaboratorError> {
            Ok(vec![
                ContainerUsage {
                    name: "db".to_string(),
                    memory_bytes: 1_000,
                },
                ContainerUsage {
                    name: "cache".to_string(),
                    memory_bytes: 500,
                },
            ])
        }
    }

    #[tokio::test]
    async fn test_sample_adds_containers_and_tracks_peak() {
        let meter = ResourceMeter::new(
            Box::new(table()),
            Arc::new(FixedContainers),
            Arc::new(StaticWorkspace(4)),
        );

        let tracked = TrackedRoots {
            roots: vec![root(RootKind::Service, "svc-a", 200)],
            active_services: 1,
            active_jobs: 0,
        };
        let snapshot = meter.sample(tracked).await;

        assert_eq!(snapshot.memory_of("svc-a"), Some(100));
        assert_eq!(snapshot.container_memory_bytes, 1_500);
        assert_eq!(snapshot.repository_count, 4);
        assert_eq!(snapshot.total_memory_bytes, 16_000);
        assert_eq!(snapshot.active_count(), 1);
        assert!(snapshot.cpu_count >= 1);
        // The test process is not in the fake table, so the daemon root is empty
        assert_eq!(snapshot.memory_of(SUPERVISOR_ROOT_ID), Some(0));
        assert_eq!(snapshot.used_memory_bytes, 100 + 1_500);
        assert_eq!(snapshot.peak_memory_bytes, 1_600);

        let smaller = meter.sample(TrackedRoots::default()).await;
        assert_eq!(smaller.used_memory_bytes, 1_500);
        assert_eq!(smaller.peak_memory_bytes, 1_600);
        assert_eq!(meter.peak(), 1_600);
    }

    #[tokio::test]
    async fn test_failed_collaborators_degrade_to_empty() {
        struct Broken;

        #[async_trait]
        impl ContainerInspector for Broken {
            async fn container_memory(&self) -> Result<Vec<ContainerUsage>, CollaboratorError> {
                Err(CollaboratorError::Failed {
                    binary: "docker".to_string(),
                    status: "exit status: 1".to_string(),
                })
            }
        }

        let meter = ResourceMeter::new(
            Box::new(table()),
            Arc::new(Broken),
            Arc::new(StaticWorkspace(0)),
        );
        let snapshot = meter.sample(TrackedRoots::default()).await;
        assert!(snapshot.containers.is_empty());
        assert_eq!(snapshot.container_memory_bytes, 0);

        let quiet = ResourceMeter::new(
            Box::new(table()),
            Arc::new(NoContainers),
            Arc::new(StaticWorkspace(0)),
        );
        assert!(quiet.sample(TrackedRoots::default()).await.containers.is_empty());
    }
}

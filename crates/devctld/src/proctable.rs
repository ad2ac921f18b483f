//! OS process table access.
//!
//! Both tree termination and resource metering work from the same primitive:
//! a fresh OS-wide pid → parent listing. [`ProcessTable`] is the seam; the
//! `sysinfo` implementation is used in production and tests substitute a
//! fixed table.

use std::collections::{HashMap, HashSet};

use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};

use devctl_core::ProcessTree;

/// Source of process snapshots and per-process memory.
pub trait ProcessTable: Send {
    /// Takes a fresh snapshot of every live process.
    fn snapshot(&mut self) -> ProcessTree;

    /// Resident memory in bytes for each pid still alive.
    ///
    /// Pids that vanished since the snapshot are simply absent.
    fn resident_memory(&mut self, pids: &[u32]) -> HashMap<u32, u64>;

    /// Total physical memory of the machine in bytes.
    fn total_memory(&mut self) -> u64;

    /// Returns true if the pid exists and is not a zombie.
    fn is_alive(&mut self, pid: u32) -> bool;
}

/// [`ProcessTable`] backed by `sysinfo`.
pub struct SysinfoTable {
    system: System,
}

impl SysinfoTable {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SysinfoTable {
    fn default() -> Self {
        Self::new()
    }
}

fn is_zombie(status: ProcessStatus) -> bool {
    matches!(status, ProcessStatus::Zombie | ProcessStatus::Dead)
}

impl ProcessTable for SysinfoTable {
    fn snapshot(&mut self) -> ProcessTree {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::new(),
        );

        // Linux lists threads alongside processes; keep thread group leaders only
        let mut threads = HashSet::new();
        for (pid, process) in self.system.processes() {
            if let Some(tasks) = process.tasks() {
                threads.extend(tasks.iter().filter(|task| *task != pid).copied());
            }
        }

        ProcessTree::from_parents(
            self.system
                .processes()
                .iter()
                .filter(|(pid, process)| !threads.contains(*pid) && !is_zombie(process.status()))
                .map(|(pid, process)| (pid.as_u32(), process.parent().map(|p| p.as_u32()))),
        )
    }

    fn resident_memory(&mut self, pids: &[u32]) -> HashMap<u32, u64> {
        let targets: Vec<Pid> = pids.iter().map(|pid| Pid::from_u32(*pid)).collect();
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&targets),
            true,
            ProcessRefreshKind::new().with_memory(),
        );

        targets
            .iter()
            .filter_map(|pid| {
                self.system
                    .process(*pid)
                    .filter(|process| !is_zombie(process.status()))
                    .map(|process| (pid.as_u32(), process.memory()))
            })
            .collect()
    }

    fn total_memory(&mut self) -> u64 {
        self.system.refresh_memory();
        self.system.total_memory()
    }

    fn is_alive(&mut self, pid: u32) -> bool {
        let pid = Pid::from_u32(pid);
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::new(),
        );

        self.system
            .process(pid)
            .map(|process| !is_zombie(process.status()))
            .unwrap_or(false)
    }
}

/// Fixed process table for tests.
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub struct FakeTable {
    pub parents: Vec<(u32, Option<u32>)>,
    pub memory: HashMap<u32, u64>,
    pub total: u64,
}

#[cfg(test)]
impl FakeTable {
    pub fn with_process(mut self, pid: u32, parent: Option<u32>, memory: u64) -> Self {
        self.parents.push((pid, parent));
        self.memory.insert(pid, memory);
        self
    }
}

#[cfg(test)]
impl ProcessTable for FakeTable {
    fn snapshot(&mut self) -> ProcessTree {
        ProcessTree::from_parents(self.parents.iter().copied())
    }

    fn resident_memory(&mut self, pids: &[u32]) -> HashMap<u32, u64> {
        pids.iter()
            .filter_map(|pid| self.memory.get(pid).map(|m| (*pid, *m)))
            .collect()
    }

    fn total_memory(&mut self) -> u64 {
        self.total
    }

    fn is_alive(&mut self, pid: u32) -> bool {
        self.parents.iter().any(|(p, _)| *p == pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_process_is_visible() {
        let mut table = SysinfoTable::new();
        let own = std::process::id();

        let tree = table.snapshot();
        assert!(tree.contains(own));
        assert!(table.is_alive(own));

        let memory = table.resident_memory(&[own]);
        assert!(memory.get(&own).copied().unwrap_or(0) > 0);
        assert!(table.total_memory() > 0);
    }

    #[test]
    fn test_unknown_pid_is_not_alive() {
        let mut table = SysinfoTable::new();
        // Above any possible Linux pid_max
        assert!(!table.is_alive(2_000_000_000));
        assert!(table.resident_memory(&[2_000_000_000]).is_empty());
    }
}

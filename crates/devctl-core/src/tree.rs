//! Process tree snapshots.
//!
//! A [`ProcessTree`] is built from one OS-wide pid → parent listing and
//! inverted into parent → children. It is rebuilt for every query: pids are
//! recycled too quickly for a cached tree to be trusted.

use std::collections::{HashMap, HashSet, VecDeque};

/// Inverted pid/parent snapshot.
#[derive(Debug, Clone, Default)]
pub struct ProcessTree {
    children: HashMap<u32, Vec<u32>>,
    known: HashSet<u32>,
}

impl ProcessTree {
    /// Builds a tree from `(pid, parent)` pairs.
    pub fn from_parents<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (u32, Option<u32>)>,
    {
        let mut tree = Self::default();
        for (pid, parent) in pairs {
            tree.known.insert(pid);
            if let Some(parent) = parent {
                if parent != pid {
                    tree.children.entry(parent).or_default().push(pid);
                }
            }
        }
        for kids in tree.children.values_mut() {
            kids.sort_unstable();
        }
        tree
    }

    /// Number of processes in the snapshot.
    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    /// Returns true if the pid was present when the snapshot was taken.
    pub fn contains(&self, pid: u32) -> bool {
        self.known.contains(&pid)
    }

    /// Direct children of a pid.
    pub fn children_of(&self, pid: u32) -> &[u32] {
        self.children.get(&pid).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Transitive descendants of `root` in breadth-first order, excluding
    /// the root itself.
    pub fn descendants(&self, root: u32) -> Vec<u32> {
        let mut seen = HashSet::from([root]);
        let mut queue = VecDeque::from([root]);
        let mut out = Vec::new();

        while let Some(pid) = queue.pop_front() {
            for &child in self.children_of(pid) {
                // Guards against cycles from pid reuse between reads
                if seen.insert(child) {
                    out.push(child);
                    queue.push_back(child);
                }
            }
        }

        out
    }

    /// The root followed by all of its descendants.
    pub fn subtree(&self, root: u32) -> Vec<u32> {
        let mut out = vec![root];
        out.extend(self.descendants(root));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    //   1
    //   ├── 10
    //   │   ├── 100
    //   │   └── 101
    //   │       └── 1010
    //   └── 20
    fn sample() -> ProcessTree {
        ProcessTree::from_parents([
            (1, None),
            (10, Some(1)),
            (20, Some(1)),
            (100, Some(10)),
            (101, Some(10)),
            (1010, Some(101)),
        ])
    }

    #[test]
    fn test_descendants_breadth_first() {
        let tree = sample();
        assert_eq!(tree.descendants(10), vec![100, 101, 1010]);
        assert_eq!(tree.descendants(1), vec![10, 20, 100, 101, 1010]);
    }

    #[test]
    fn test_leaf_has_no_descendants() {
        let tree = sample();
        assert!(tree.descendants(20).is_empty());
        assert_eq!(tree.subtree(20), vec![20]);
    }

    #[test]
    fn test_unknown_root() {
        let tree = sample();
        assert!(!tree.contains(999));
        assert!(tree.descendants(999).is_empty());
        assert_eq!(tree.subtree(999), vec![999]);
    }

    #[test]
    fn test_cycle_does_not_loop() {
        let tree = ProcessTree::from_parents([(5, Some(6)), (6, Some(5))]);
        assert_eq!(tree.descendants(5), vec![6]);
    }

    #[test]
    fn test_self_parent_ignored() {
        let tree = ProcessTree::from_parents([(0, Some(0)), (7, Some(0))]);
        assert_eq!(tree.descendants(0), vec![7]);
        assert_eq!(tree.len(), 2);
    }
}

//! Serialization of system package merges.
//!
//! Dependencies on packages of the base system are often left unstated,
//! so replacing one of them while builds are running can break those builds.
//! Merges of deep system runtime dependencies are therefore parked in a wait
//! queue and only released one at a time when no job and no other merge is
//! in flight. While a released merge leaves runtime dependencies of the
//! system unsatisfied, no new job starts.

use std::collections::{HashSet, VecDeque};

use tracing::debug;

use crate::graph::{DepGraph, Priority};
use crate::package::{DEFAULT_ROOT, Operation, PkgRef};

/// Edge filter for the dependencies a started system merge leaves open.
fn ignore_non_runtime_or_satisfied(priority: &Priority) -> bool {
    !(priority.is_runtime() && !priority.satisfied)
}

/// Wait queue and bookkeeping for system package merges.
///
/// `T` is whatever the scheduler queues for a merge.
#[derive(Debug)]
pub struct SystemDepsGate<T> {
    deep_system_deps: HashSet<PkgRef>,
    wait_queue: VecDeque<(PkgRef, T)>,
    wait_scheduled: HashSet<PkgRef>,
    unsatisfied: HashSet<PkgRef>,
}

impl<T> Default for SystemDepsGate<T> {
    fn default() -> Self {
        Self {
            deep_system_deps: HashSet::new(),
            wait_queue: VecDeque::new(),
            wait_scheduled: HashSet::new(),
            unsatisfied: HashSet::new(),
        }
    }
}

impl<T> SystemDepsGate<T> {
    pub fn new(deep_system_deps: HashSet<PkgRef>) -> Self {
        Self {
            deep_system_deps,
            ..Self::default()
        }
    }

    /// Whether merges of `pkg` go through the wait queue.
    pub fn is_system_dep(&self, pkg: &PkgRef) -> bool {
        self.deep_system_deps.contains(pkg)
    }

    /// Parks the merge of a system package.
    pub fn defer(&mut self, pkg: PkgRef, task: T) {
        debug!("Deferring merge of system package {}", pkg.cpv());
        self.wait_queue.push_back((pkg, task));
    }

    /// Packages whose merges are parked.
    pub fn waiting(&self) -> impl Iterator<Item = &PkgRef> {
        self.wait_queue.iter().map(|(pkg, _)| pkg)
    }

    pub fn has_waiting(&self) -> bool {
        !self.wait_queue.is_empty()
    }

    /// Whether a parked merge can be released now.
    pub fn can_drain(&self, jobs: usize, merge_queue_busy: bool) -> bool {
        !self.wait_queue.is_empty() && jobs == 0 && !merge_queue_busy
    }

    /// Releases the oldest parked merge.
    ///
    /// The package stays tracked as scheduled until
    /// [`merge_exited`](Self::merge_exited) is called for it.
    pub fn drain(&mut self) -> Option<(PkgRef, T)> {
        let (pkg, task) = self.wait_queue.pop_front()?;
        self.wait_scheduled.insert(pkg.clone());
        Some((pkg, task))
    }

    /// Whether `pkg` is a released system merge that has not exited yet.
    pub fn is_wait_scheduled(&self, pkg: &PkgRef) -> bool {
        self.wait_scheduled.contains(pkg)
    }

    /// Records the direct runtime dependencies a starting merge leaves open.
    ///
    /// Only direct dependencies are checked; indirect ones are checked when
    /// their own parent merges. Nothing is recorded for other roots.
    pub fn merge_started(
        &mut self,
        pkg: &PkgRef,
        graph: Option<&DepGraph<PkgRef>>,
        completed: &HashSet<PkgRef>,
    ) {
        let Some(graph) = graph else {
            return;
        };
        if pkg.root() != DEFAULT_ROOT {
            return;
        }
        for child in graph.child_nodes(pkg, Some(ignore_non_runtime_or_satisfied)) {
            if child == *pkg || child.operation() != Operation::Merge {
                continue;
            }
            if !completed.contains(&child) {
                debug!(
                    "System merge {} leaves {} unsatisfied",
                    pkg.cpv(),
                    child.cpv()
                );
                self.unsatisfied.insert(child);
            }
        }
    }

    /// A released system merge exited.
    pub fn merge_exited(&mut self, pkg: &PkgRef) {
        self.wait_scheduled.remove(pkg);
    }

    /// A task for `pkg` completed.
    pub fn task_completed(&mut self, pkg: &PkgRef) {
        self.unsatisfied.remove(pkg);
    }

    /// Whether new jobs are held back while `jobs` are running.
    pub fn blocks_new_jobs(&self, jobs: usize) -> bool {
        !self.wait_scheduled.is_empty() || (jobs > 0 && !self.unsatisfied.is_empty())
    }

    pub fn unsatisfied(&self) -> &HashSet<PkgRef> {
        &self.unsatisfied
    }

    /// Drops every parked merge, returning them to the caller.
    pub fn take_waiting(&mut self) -> Vec<(PkgRef, T)> {
        self.wait_queue.drain(..).collect()
    }

    /// Forgets everything at the end of a run.
    pub fn clear(&mut self) {
        self.deep_system_deps.clear();
        self.wait_queue.clear();
        self.wait_scheduled.clear();
        self.unsatisfied.clear();
    }
}

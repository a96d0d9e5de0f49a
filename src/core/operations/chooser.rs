//! Package selection.
//!
//! [`PackageChooser`] owns the queue of packages that have not been started
//! yet and decides which one may start next. With a dependency graph, a
//! package is eligible once nothing it (transitively) depends on is still
//! waiting to be merged ahead of it.

use std::collections::{HashSet, VecDeque};

use tracing::debug;

use crate::graph::DepGraph;
use crate::package::{Operation, PkgRef};

/// What the chooser needs to know about the rest of the scheduler.
#[derive(Debug, Clone, Copy)]
pub struct ChooseContext<'a> {
    /// Packages whose tasks have completed.
    pub completed: &'a HashSet<PkgRef>,
    /// Whether any task is currently running.
    pub work_scheduled: bool,
}

/// Pending package queue plus the selection algorithm.
#[derive(Debug, Default)]
pub struct PackageChooser {
    queue: VecDeque<PkgRef>,
    return_early: bool,
    parallel_nodeps: bool,
}

impl PackageChooser {
    /// Creates an empty chooser.
    ///
    /// `parallel_nodeps` allows several packages in flight when there is no
    /// dependency graph.
    pub fn new(parallel_nodeps: bool) -> Self {
        Self {
            queue: VecDeque::new(),
            return_early: false,
            parallel_nodeps,
        }
    }

    pub fn push(&mut self, pkg: PkgRef) {
        self.queue.push_back(pkg);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Pending packages in queue order.
    pub fn pending(&self) -> impl Iterator<Item = &PkgRef> {
        self.queue.iter()
    }

    /// Withdraws `pkg` from the queue. Returns whether it was queued.
    pub fn remove(&mut self, pkg: &PkgRef) -> bool {
        match self.queue.iter().position(|p| p == pkg) {
            Some(index) => {
                self.queue.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.return_early = false;
    }

    /// True when a previous call found nothing eligible and no task has
    /// completed since.
    pub fn is_stalled(&self) -> bool {
        self.return_early
    }

    /// Called whenever a task completes; selection may succeed again.
    pub fn task_completed(&mut self) {
        self.return_early = false;
    }

    /// Picks the next package to start, removing it from the queue.
    pub fn choose(
        &mut self,
        graph: Option<&mut DepGraph<PkgRef>>,
        ctx: ChooseContext<'_>,
    ) -> Option<PkgRef> {
        if self.return_early {
            return None;
        }

        let Some(graph) = graph else {
            if ctx.work_scheduled && !self.parallel_nodeps {
                self.return_early = true;
                return None;
            }
            return self.queue.pop_front();
        };

        if !ctx.work_scheduled {
            return self.queue.pop_front();
        }

        prune_graph(graph, ctx.completed);

        let chosen = self
            .queue
            .iter()
            .position(|pkg| {
                pkg.operation() == Operation::Uninstall && graph.child_nodes(pkg, None).is_empty()
            })
            .or_else(|| {
                let mut later: HashSet<&PkgRef> = self.queue.iter().collect();
                self.queue.iter().position(|pkg| {
                    later.remove(pkg);
                    !dependent_on_scheduled_merges(graph, pkg, ctx.completed, &later)
                })
            });

        match chosen {
            Some(index) => {
                let pkg = self.queue.remove(index);
                if let Some(pkg) = &pkg {
                    debug!("Chose {} ({} still queued)", pkg.key(), self.queue.len());
                }
                pkg
            }
            None => {
                debug!("No package eligible among {} queued", self.queue.len());
                self.return_early = true;
                None
            }
        }
    }
}

/// Repeatedly removes roots that need no further scheduling.
///
/// A root is removed when it is installed with nothing to do, only there
/// for its dependencies, or already completed.
pub fn prune_graph(graph: &mut DepGraph<PkgRef>, completed: &HashSet<PkgRef>) -> usize {
    graph.prune_roots(|pkg| is_nomerge_installed(pkg) || pkg.onlydeps() || completed.contains(pkg))
}

fn is_nomerge_installed(pkg: &PkgRef) -> bool {
    pkg.installed() && pkg.operation() == Operation::Nomerge
}

/// True when `pkg` still has to wait for a dependency that is neither
/// completed nor queued behind it anyway.
///
/// Children of uninstall nodes are not followed, and an uninstall only
/// counts when it is a direct dependency.
pub fn dependent_on_scheduled_merges(
    graph: &DepGraph<PkgRef>,
    pkg: &PkgRef,
    completed: &HashSet<PkgRef>,
    later: &HashSet<&PkgRef>,
) -> bool {
    let direct: Vec<PkgRef> = graph.child_nodes(pkg, None);
    let mut traversed: HashSet<PkgRef> = HashSet::new();
    traversed.insert(pkg.clone());
    let mut stack = direct.clone();

    while let Some(node) = stack.pop() {
        if !traversed.insert(node.clone()) {
            continue;
        }
        let ignorable = is_nomerge_installed(&node)
            || (node.operation() == Operation::Uninstall && !direct.contains(&node))
            || completed.contains(&node)
            || later.contains(&node);
        if !ignorable {
            return true;
        }
        if node.operation() != Operation::Uninstall {
            stack.extend(graph.child_nodes(&node, None));
        }
    }
    false
}

//! Dependency graph over packages.
//!
//! [`DepGraph`] is a directed graph whose edges point from a parent to the
//! children it depends on. Each edge carries one or more [`Priority`]
//! values saying what kind of dependency it is. The scheduler uses the
//! priorities only to decide which edges have to be honored before a
//! package may start.
//!
//! The free functions at the bottom of this module are the graph analyses
//! the scheduler runs once per pass: build directory collision edges, the
//! deep system runtime closure, and keep-going dependent discovery.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use serde::{Deserialize, Serialize};

use crate::package::{MergeListEntry, Operation, PkgRef};

/// What kind of dependency an edge represents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Priority {
    /// Needed to build the parent.
    pub buildtime: bool,
    /// Needed to run the parent.
    pub runtime: bool,
    /// Needed to run the parent, but may be merged after it.
    pub runtime_post: bool,
    /// Already satisfied by an installed package.
    pub satisfied: bool,
}

impl Priority {
    pub fn buildtime() -> Self {
        Self {
            buildtime: true,
            ..Self::default()
        }
    }

    pub fn runtime() -> Self {
        Self {
            runtime: true,
            ..Self::default()
        }
    }

    pub fn runtime_post() -> Self {
        Self {
            runtime_post: true,
            ..Self::default()
        }
    }

    /// Marks the edge as already satisfied.
    pub fn satisfied(mut self) -> Self {
        self.satisfied = true;
        self
    }

    /// True for any real dependency kind.
    pub fn is_dependency(&self) -> bool {
        self.buildtime || self.runtime || self.runtime_post
    }

    /// True for dependencies that still have to be completed first.
    pub fn is_hard(&self) -> bool {
        self.is_dependency() && !self.satisfied
    }

    /// True for runtime or runtime-post dependencies.
    pub fn is_runtime(&self) -> bool {
        self.runtime || self.runtime_post
    }
}

/// Predicate selecting edge priorities to ignore during traversal.
pub type IgnorePriority = fn(&Priority) -> bool;

/// Ignores everything except runtime and runtime-post edges.
pub fn ignore_non_runtime(priority: &Priority) -> bool {
    !priority.is_runtime()
}

/// Ignores satisfied and non-dependency edges.
pub fn ignore_soft(priority: &Priority) -> bool {
    !priority.is_hard()
}

#[derive(Debug, Clone)]
struct Node<N> {
    children: Vec<N>,
    parents: Vec<N>,
}

impl<N> Default for Node<N> {
    fn default() -> Self {
        Self {
            children: Vec::new(),
            parents: Vec::new(),
        }
    }
}

/// Directed dependency graph with priority annotated edges.
///
/// Node iteration follows insertion order so that traversals are
/// reproducible.
#[derive(Debug, Clone)]
pub struct DepGraph<N: Clone + Eq + Hash> {
    nodes: HashMap<N, Node<N>>,
    order: Vec<N>,
    priorities: HashMap<(N, N), Vec<Priority>>,
}

impl<N: Clone + Eq + Hash> Default for DepGraph<N> {
    fn default() -> Self {
        Self {
            nodes: HashMap::new(),
            order: Vec::new(),
            priorities: HashMap::new(),
        }
    }
}

impl<N: Clone + Eq + Hash> DepGraph<N> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node with no edges. Adding an existing node is a no-op.
    pub fn add_node(&mut self, node: N) {
        if !self.nodes.contains_key(&node) {
            self.order.push(node.clone());
            self.nodes.insert(node, Node::default());
        }
    }

    /// Records that `parent` depends on `child`.
    ///
    /// Both nodes are added when missing. Repeated edges accumulate their
    /// priorities.
    pub fn add(&mut self, child: N, parent: N, priority: Priority) {
        self.add_node(child.clone());
        self.add_node(parent.clone());

        let priorities = self
            .priorities
            .entry((parent.clone(), child.clone()))
            .or_default();
        if priorities.is_empty() {
            if let Some(entry) = self.nodes.get_mut(&parent) {
                entry.children.push(child.clone());
            }
            if let Some(entry) = self.nodes.get_mut(&child) {
                entry.parents.push(parent);
            }
        }
        if !priorities.contains(&priority) {
            priorities.push(priority);
        }
    }

    pub fn contains(&self, node: &N) -> bool {
        self.nodes.contains_key(node)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Iterates nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &N> {
        self.order.iter()
    }

    /// Priorities recorded on the edge from `parent` to `child`.
    pub fn priorities(&self, parent: &N, child: &N) -> &[Priority] {
        self.priorities
            .get(&(parent.clone(), child.clone()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Returns the children of `node`.
    ///
    /// With an `ignore` predicate, a child is kept when at least one of its
    /// edge priorities is not ignored.
    pub fn child_nodes(&self, node: &N, ignore: Option<IgnorePriority>) -> Vec<N> {
        let Some(entry) = self.nodes.get(node) else {
            return Vec::new();
        };
        entry
            .children
            .iter()
            .filter(|child| match ignore {
                None => true,
                Some(ignore) => self.priorities(node, child).iter().any(|p| !ignore(p)),
            })
            .cloned()
            .collect()
    }

    /// Returns the parents of `node`, filtered like [`child_nodes`](Self::child_nodes).
    pub fn parent_nodes(&self, node: &N, ignore: Option<IgnorePriority>) -> Vec<N> {
        let Some(entry) = self.nodes.get(node) else {
            return Vec::new();
        };
        entry
            .parents
            .iter()
            .filter(|parent| match ignore {
                None => true,
                Some(ignore) => self.priorities(parent, node).iter().any(|p| !ignore(p)),
            })
            .cloned()
            .collect()
    }

    /// Nodes nothing depends on.
    pub fn root_nodes(&self) -> Vec<N> {
        self.order
            .iter()
            .filter(|node| {
                self.nodes
                    .get(*node)
                    .is_some_and(|entry| entry.parents.is_empty())
            })
            .cloned()
            .collect()
    }

    /// Removes a node and every edge touching it.
    pub fn remove(&mut self, node: &N) -> bool {
        let Some(entry) = self.nodes.remove(node) else {
            return false;
        };
        for child in &entry.children {
            if let Some(child_entry) = self.nodes.get_mut(child) {
                child_entry.parents.retain(|p| p != node);
            }
            self.priorities.remove(&(node.clone(), child.clone()));
        }
        for parent in &entry.parents {
            if let Some(parent_entry) = self.nodes.get_mut(parent) {
                parent_entry.children.retain(|c| c != node);
            }
            self.priorities.remove(&(parent.clone(), node.clone()));
        }
        self.order.retain(|n| n != node);
        true
    }

    /// Removes every node in `nodes`.
    pub fn difference_update<'a, I>(&mut self, nodes: I)
    where
        I: IntoIterator<Item = &'a N>,
        N: 'a,
    {
        for node in nodes {
            self.remove(node);
        }
    }

    /// Repeatedly removes root nodes matching `prunable` until none are left.
    ///
    /// Returns the number of removed nodes.
    pub fn prune_roots<F>(&mut self, mut prunable: F) -> usize
    where
        F: FnMut(&N) -> bool,
    {
        let mut removed = 0;
        loop {
            let doomed: Vec<N> = self
                .root_nodes()
                .into_iter()
                .filter(|node| prunable(node))
                .collect();
            if doomed.is_empty() {
                return removed;
            }
            removed += doomed.len();
            self.difference_update(&doomed);
        }
    }

    /// Returns the induced subgraph over `keep`, preserving edges and order.
    pub fn subgraph(&self, keep: &HashSet<N>) -> Self {
        let mut graph = Self::new();
        for node in self.order.iter().filter(|n| keep.contains(*n)) {
            graph.add_node(node.clone());
        }
        for node in self.order.iter().filter(|n| keep.contains(*n)) {
            for child in self.child_nodes(node, None) {
                if !keep.contains(&child) {
                    continue;
                }
                for priority in self.priorities(node, &child) {
                    graph.add(child.clone(), node.clone(), *priority);
                }
            }
        }
        graph
    }
}

/// Adds buildtime edges between packages that share a build directory.
///
/// Two non-installed packages with the same cpv (e.g. for different roots)
/// would build in the same directory, so every later occurrence depends on
/// all earlier ones.
pub fn prevent_builddir_collisions(graph: &mut DepGraph<PkgRef>, mergelist: &[MergeListEntry]) {
    let mut seen: HashMap<&str, Vec<&PkgRef>> = HashMap::new();
    for pkg in mergelist.iter().filter_map(MergeListEntry::as_package) {
        if pkg.installed() {
            continue;
        }
        let earlier = seen.entry(pkg.cpv()).or_default();
        for previous in earlier.iter() {
            graph.add((*previous).clone(), pkg.clone(), Priority::buildtime());
        }
        earlier.push(pkg);
    }
}

/// Computes the packages in the deep runtime closure of the system set.
///
/// Seeds with every non-uninstall package matching one of `system_atoms`
/// and follows runtime edges. Uninstall nodes are neither seeds nor
/// traversed.
pub fn find_deep_system_runtime_deps(
    graph: &DepGraph<PkgRef>,
    system_atoms: &[String],
) -> HashSet<PkgRef> {
    let mut deep = HashSet::new();
    let mut stack: Vec<PkgRef> = graph
        .nodes()
        .filter(|pkg| pkg.operation() != Operation::Uninstall)
        .filter(|pkg| system_atoms.iter().any(|atom| pkg.matches_atom(atom)))
        .cloned()
        .collect();

    while let Some(node) = stack.pop() {
        if !deep.insert(node.clone()) {
            continue;
        }
        for child in graph.child_nodes(&node, Some(ignore_non_runtime)) {
            if child.operation() == Operation::Uninstall {
                continue;
            }
            stack.push(child);
        }
    }
    deep
}

/// Collects every package that transitively depends on one of `failed`.
///
/// Only edges that still have to be honored are followed. The failed
/// packages themselves are not part of the result.
pub fn dependents_of<'a, I>(graph: &DepGraph<PkgRef>, failed: I) -> Vec<PkgRef>
where
    I: IntoIterator<Item = &'a PkgRef>,
{
    let roots: Vec<PkgRef> = failed.into_iter().cloned().collect();
    let mut seen: HashSet<PkgRef> = roots.iter().cloned().collect();
    let mut stack = roots;
    let mut dependents = Vec::new();

    while let Some(node) = stack.pop() {
        for parent in graph.parent_nodes(&node, Some(ignore_soft)) {
            if seen.insert(parent.clone()) {
                dependents.push(parent.clone());
                stack.push(parent);
            }
        }
    }
    dependents
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::{Package, PackageType};
    use std::sync::Arc;

    fn pkg(cpv: &str) -> PkgRef {
        Arc::new(Package::builder(cpv).build().unwrap())
    }

    /// # Edge Bookkeeping
    ///
    /// Verifies children, parents and priorities after adding edges.
    ///
    /// ## Test Scenario
    /// - Adds the same edge twice with different priorities
    ///
    /// ## Expected Outcome
    /// - One child and one parent entry, two priorities on the edge
    #[test]
    fn test_edge_bookkeeping() {
        let mut graph = DepGraph::new();
        graph.add("lib", "app", Priority::buildtime());
        graph.add("lib", "app", Priority::runtime());

        assert_eq!(graph.child_nodes(&"app", None), vec!["lib"]);
        assert_eq!(graph.parent_nodes(&"lib", None), vec!["app"]);
        assert_eq!(graph.priorities(&"app", &"lib").len(), 2);
        assert_eq!(graph.root_nodes(), vec!["app"]);
    }

    /// # Ignored Priorities
    ///
    /// Verifies that a child is kept when any of its edge priorities counts.
    ///
    /// ## Test Scenario
    /// - One child reachable only through a satisfied edge
    /// - One child reachable through a satisfied and a hard edge
    ///
    /// ## Expected Outcome
    /// - Only the second child survives ignore_soft
    #[test]
    fn test_ignored_priorities() {
        let mut graph = DepGraph::new();
        graph.add("soft", "app", Priority::runtime().satisfied());
        graph.add("mixed", "app", Priority::runtime().satisfied());
        graph.add("mixed", "app", Priority::buildtime());

        assert_eq!(graph.child_nodes(&"app", Some(ignore_soft)), vec!["mixed"]);
        assert_eq!(graph.child_nodes(&"app", None).len(), 2);
    }

    /// # Node Removal
    ///
    /// Verifies that removing a node detaches all of its edges.
    ///
    /// ## Test Scenario
    /// - Builds a chain a -> b -> c and removes b
    ///
    /// ## Expected Outcome
    /// - a and c have no edges left and both are roots
    #[test]
    fn test_node_removal() {
        let mut graph = DepGraph::new();
        graph.add("b", "a", Priority::buildtime());
        graph.add("c", "b", Priority::buildtime());

        assert!(graph.remove(&"b"));
        assert!(!graph.remove(&"b"));
        assert!(graph.child_nodes(&"a", None).is_empty());
        assert!(graph.parent_nodes(&"c", None).is_empty());
        assert_eq!(graph.root_nodes(), vec!["a", "c"]);
        assert!(graph.priorities(&"a", &"b").is_empty());
    }

    /// # Root Pruning
    ///
    /// Verifies that pruning repeats until no prunable root remains.
    ///
    /// ## Test Scenario
    /// - Chain done1 -> done2 -> todo, where done* are prunable
    ///
    /// ## Expected Outcome
    /// - Both done nodes are removed over two rounds, todo remains
    #[test]
    fn test_root_pruning() {
        let mut graph = DepGraph::new();
        graph.add("done2", "done1", Priority::runtime());
        graph.add("todo", "done2", Priority::runtime());

        let removed = graph.prune_roots(|n| n.starts_with("done"));
        assert_eq!(removed, 2);
        assert_eq!(graph.nodes().copied().collect::<Vec<_>>(), vec!["todo"]);
    }

    /// # Build Directory Collisions
    ///
    /// Verifies that duplicate cpvs are serialized by a buildtime edge.
    ///
    /// ## Test Scenario
    /// - The same cpv merged into two roots plus an installed duplicate
    ///
    /// ## Expected Outcome
    /// - The second build depends on the first; installed is untouched
    #[test]
    fn test_prevent_builddir_collisions() {
        let first = pkg("app-misc/foo-1");
        let second = Arc::new(
            Package::builder("app-misc/foo-1")
                .root("/mnt/target")
                .build()
                .unwrap(),
        );
        let installed = Arc::new(
            Package::builder("app-misc/foo-1")
                .pkg_type(PackageType::Installed)
                .operation(Operation::Nomerge)
                .build()
                .unwrap(),
        );
        let mergelist = vec![
            MergeListEntry::Package(first.clone()),
            MergeListEntry::Package(installed.clone()),
            MergeListEntry::Package(second.clone()),
        ];
        let mut graph = DepGraph::new();
        for entry in mergelist.iter().filter_map(MergeListEntry::as_package) {
            graph.add_node(entry.clone());
        }

        prevent_builddir_collisions(&mut graph, &mergelist);

        assert_eq!(graph.child_nodes(&second, None), vec![first.clone()]);
        assert!(graph.child_nodes(&first, None).is_empty());
        assert!(graph.parent_nodes(&installed, None).is_empty());
    }

    /// # Deep System Runtime Deps
    ///
    /// Verifies that the closure follows runtime edges only.
    ///
    /// ## Test Scenario
    /// - System package bash depends at runtime on readline
    /// - bash depends at buildtime only on bison
    /// - An uninstall node hangs off readline
    ///
    /// ## Expected Outcome
    /// - bash and readline are in the set; bison and the uninstall are not
    #[test]
    fn test_find_deep_system_runtime_deps() {
        let bash = pkg("app-shells/bash-5.2");
        let readline = pkg("sys-libs/readline-8.2");
        let bison = pkg("sys-devel/bison-3.8");
        let old = Arc::new(
            Package::builder("sys-libs/ncurses-5.9")
                .pkg_type(PackageType::Installed)
                .operation(Operation::Uninstall)
                .build()
                .unwrap(),
        );

        let mut graph = DepGraph::new();
        graph.add(readline.clone(), bash.clone(), Priority::runtime());
        graph.add(bison.clone(), bash.clone(), Priority::buildtime());
        graph.add(old.clone(), readline.clone(), Priority::runtime());

        let deep = find_deep_system_runtime_deps(&graph, &["app-shells/bash".to_string()]);
        assert!(deep.contains(&bash));
        assert!(deep.contains(&readline));
        assert!(!deep.contains(&bison));
        assert!(!deep.contains(&old));
    }

    /// # Transitive Dependents
    ///
    /// Verifies the keep-going dependent walk.
    ///
    /// ## Test Scenario
    /// - g depends on f, h depends on g, i depends on f through a satisfied edge
    ///
    /// ## Expected Outcome
    /// - g and h are dependents of f; i is not
    #[test]
    fn test_dependents_of() {
        let f = pkg("a/f-1");
        let g = pkg("a/g-1");
        let h = pkg("a/h-1");
        let i = pkg("a/i-1");
        let mut graph = DepGraph::new();
        graph.add(f.clone(), g.clone(), Priority::buildtime());
        graph.add(g.clone(), h.clone(), Priority::runtime());
        graph.add(f.clone(), i.clone(), Priority::runtime().satisfied());

        let dependents = dependents_of(&graph, [&f]);
        assert_eq!(dependents.len(), 2);
        assert!(dependents.contains(&g));
        assert!(dependents.contains(&h));
        assert!(!dependents.contains(&i));
    }

    /// # Induced Subgraph
    ///
    /// Verifies that a subgraph keeps only edges between kept nodes.
    ///
    /// ## Test Scenario
    /// - Chain a -> b -> c, keep a and c plus an edge a -> c
    ///
    /// ## Expected Outcome
    /// - Only the a -> c edge remains
    #[test]
    fn test_subgraph() {
        let mut graph = DepGraph::new();
        graph.add("b", "a", Priority::buildtime());
        graph.add("c", "b", Priority::buildtime());
        graph.add("c", "a", Priority::runtime());

        let keep: HashSet<&str> = ["a", "c"].into_iter().collect();
        let sub = graph.subgraph(&keep);
        assert_eq!(sub.len(), 2);
        assert_eq!(sub.child_nodes(&"a", None), vec!["c"]);
        assert_eq!(sub.priorities(&"a", &"c"), &[Priority::runtime()]);
    }
}

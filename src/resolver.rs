//! Dependency graph documents and the resolver seam.
//!
//! The scheduler does not compute dependency graphs itself. It asks a
//! [`Resolver`] for a [`GraphConfig`] bundle, both for a fresh run and when a
//! keep-going or `--resume` run needs the graph regenerated from a pruned
//! resume list.
//!
//! [`StaticResolver`] is the concrete resolver shipped with the binary. It
//! reads a precomputed [`GraphDocument`] (JSON) describing packages, edges,
//! blockers, the merge list order, the system set and the favorites.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::state::ResumeEntry;
use crate::error::{GraphError, ResolveError};
use crate::graph::{DepGraph, Priority, prevent_builddir_collisions};
use crate::package::{
    Blocker, DEFAULT_ROOT, DEFAULT_SLOT, MergeListEntry, Operation, Package, PackageCache,
    PackageType, PkgRef,
};

/// Everything the scheduler needs for one pass.
#[derive(Debug, Default)]
pub struct GraphConfig {
    /// The dependency graph over merge list packages.
    pub graph: DepGraph<PkgRef>,
    /// The ordered merge list.
    pub mergelist: Vec<MergeListEntry>,
    /// Interned packages.
    pub cache: PackageCache,
    /// Atoms of the base system set.
    pub system: Vec<String>,
    /// Atoms the user asked for explicitly.
    pub favorites: Vec<String>,
}

impl GraphConfig {
    /// Iterates the packages of the merge list in order, skipping blockers.
    pub fn packages(&self) -> impl Iterator<Item = &PkgRef> {
        self.mergelist.iter().filter_map(MergeListEntry::as_package)
    }
}

/// Produces graph configurations for the scheduler.
pub trait Resolver: Send + Sync {
    /// Builds the graph for a fresh run.
    fn graph_config(&self) -> Result<GraphConfig, ResolveError>;

    /// Rebuilds the graph restricted to the packages named by `entries`.
    ///
    /// Dependencies on packages outside the list are treated as already
    /// merged.
    fn resume(&self, entries: &[ResumeEntry]) -> Result<GraphConfig, ResolveError>;
}

/// A package declaration inside a [`GraphDocument`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageSpec {
    /// Identifier used by edges and the merge list. Defaults to the cpv.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub cpv: String,
    #[serde(rename = "type", default = "default_type")]
    pub pkg_type: PackageType,
    #[serde(default = "default_operation")]
    pub operation: Operation,
    #[serde(default = "default_root")]
    pub root: String,
    #[serde(default = "default_slot")]
    pub slot: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    #[serde(default)]
    pub onlydeps: bool,
    #[serde(default)]
    pub interactive: bool,
    #[serde(default)]
    pub live: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaces: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl PackageSpec {
    fn id(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.cpv)
    }

    fn to_package(&self) -> Result<Package, GraphError> {
        let mut builder = Package::builder(self.cpv.clone())
            .pkg_type(self.pkg_type)
            .operation(self.operation)
            .root(self.root.clone())
            .slot(self.slot.clone())
            .onlydeps(self.onlydeps)
            .interactive(self.interactive)
            .live(self.live);
        if let Some(repo) = &self.repo {
            builder = builder.repo(repo.clone());
        }
        if let Some(replaces) = &self.replaces {
            builder = builder.replaces(replaces.clone());
        }
        for (key, value) in &self.metadata {
            builder = builder.metadata(key.clone(), value.clone());
        }
        builder.build()
    }
}

fn default_type() -> PackageType {
    PackageType::Ebuild
}

fn default_operation() -> Operation {
    Operation::Merge
}

fn default_root() -> String {
    DEFAULT_ROOT.to_string()
}

fn default_slot() -> String {
    DEFAULT_SLOT.to_string()
}

/// A dependency edge: `parent` depends on `child`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub parent: String,
    pub child: String,
    #[serde(default)]
    pub priority: Priority,
}

/// Serialized form of a resolved dependency graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphDocument {
    pub packages: Vec<PackageSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
    #[serde(default)]
    pub blockers: Vec<Blocker>,
    /// Merge list order as package ids. Defaults to declaration order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mergelist: Option<Vec<String>>,
    #[serde(default)]
    pub system: Vec<String>,
    #[serde(default)]
    pub favorites: Vec<String>,
}

impl GraphDocument {
    /// Parses a document from JSON text.
    pub fn from_json(text: &str) -> Result<Self, GraphError> {
        serde_json::from_str(text).map_err(|e| GraphError::Parse {
            message: e.to_string(),
        })
    }

    /// Reads a document from a file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read graph document: {}", path.display()))?;
        Self::from_json(&text)
            .with_context(|| format!("Invalid graph document: {}", path.display()))
    }
}

/// Resolver backed by a precomputed [`GraphDocument`].
#[derive(Debug, Clone)]
pub struct StaticResolver {
    document: GraphDocument,
}

impl StaticResolver {
    pub fn new(document: GraphDocument) -> Self {
        Self { document }
    }

    /// Loads the document at `path`.
    pub fn from_path(path: &Path) -> Result<Self> {
        Ok(Self::new(GraphDocument::load(path)?))
    }

    pub fn document(&self) -> &GraphDocument {
        &self.document
    }

    /// Builds the full graph, then keeps only packages accepted by `keep`.
    fn build<F>(&self, keep: F) -> Result<GraphConfig, GraphError>
    where
        F: Fn(&Package) -> bool,
    {
        let mut cache = PackageCache::new();
        let mut by_id: HashMap<&str, PkgRef> = HashMap::new();
        for spec in &self.document.packages {
            let pkg = cache.intern(spec.to_package()?);
            if by_id.insert(spec.id(), pkg).is_some() {
                return Err(GraphError::DuplicatePackage {
                    id: spec.id().to_string(),
                });
            }
        }

        let lookup = |id: &str, context: &str| {
            by_id
                .get(id)
                .cloned()
                .ok_or_else(|| GraphError::UnknownPackage {
                    id: id.to_string(),
                    context: context.to_string(),
                })
        };

        let order: Vec<PkgRef> = match &self.document.mergelist {
            Some(ids) => ids
                .iter()
                .map(|id| lookup(id, "mergelist"))
                .collect::<Result<_, _>>()?,
            None => self
                .document
                .packages
                .iter()
                .map(|spec| lookup(spec.id(), "packages"))
                .collect::<Result<_, _>>()?,
        };

        for blocker in &self.document.blockers {
            if !blocker.satisfied {
                return Err(GraphError::BlockerConflict {
                    atom: blocker.atom.clone(),
                    blocked: blocker.parent.clone(),
                });
            }
        }

        let kept: HashSet<PkgRef> = order.iter().filter(|p| keep(&***p)).cloned().collect();

        let mut mergelist = Vec::with_capacity(kept.len());
        for pkg in order.iter().filter(|p| kept.contains(*p)) {
            for blocker in self
                .document
                .blockers
                .iter()
                .filter(|b| b.parent == pkg.cpv() && b.root == pkg.root())
            {
                mergelist.push(MergeListEntry::Blocker(blocker.clone()));
            }
            mergelist.push(MergeListEntry::Package(pkg.clone()));
        }

        let mut graph = DepGraph::new();
        for pkg in mergelist.iter().filter_map(MergeListEntry::as_package) {
            graph.add_node(pkg.clone());
        }
        for edge in &self.document.edges {
            let parent = lookup(&edge.parent, "edge")?;
            let child = lookup(&edge.child, "edge")?;
            if kept.contains(&parent) && kept.contains(&child) {
                graph.add(child, parent, edge.priority);
            }
        }
        prevent_builddir_collisions(&mut graph, &mergelist);

        debug!(
            "Built graph with {} nodes from {} declared packages",
            graph.len(),
            self.document.packages.len()
        );

        Ok(GraphConfig {
            graph,
            mergelist,
            cache,
            system: self.document.system.clone(),
            favorites: self.document.favorites.clone(),
        })
    }
}

impl Resolver for StaticResolver {
    fn graph_config(&self) -> Result<GraphConfig, ResolveError> {
        Ok(self.build(|_| true)?)
    }

    fn resume(&self, entries: &[ResumeEntry]) -> Result<GraphConfig, ResolveError> {
        if entries.is_empty() {
            return Err(ResolveError::EmptyResumeList);
        }
        let wanted: HashSet<&ResumeEntry> = entries.iter().collect();
        // Installed packages being replaced stay as long as their replacement does.
        let replaced: HashSet<(&str, &str)> = self
            .document
            .packages
            .iter()
            .filter(|spec| {
                wanted.contains(&ResumeEntry::new(
                    spec.pkg_type,
                    &spec.root,
                    &spec.cpv,
                    spec.operation,
                ))
            })
            .filter_map(|spec| Some((spec.root.as_str(), spec.replaces.as_deref()?)))
            .collect();
        let config = self.build(|pkg| {
            wanted.contains(&ResumeEntry::from(pkg))
                || (pkg.installed()
                    && pkg.operation() == Operation::Uninstall
                    && replaced.contains(&(pkg.root(), pkg.cpv())))
        })?;

        let resolved: HashSet<ResumeEntry> =
            config.packages().map(|pkg| ResumeEntry::from(&**pkg)).collect();
        let missing: Vec<String> = entries
            .iter()
            .filter(|entry| !resolved.contains(*entry))
            .map(ToString::to_string)
            .collect();
        if !missing.is_empty() {
            return Err(ResolveError::UnsatisfiedResumeDep { entries: missing });
        }
        Ok(config)
    }
}

//! Packages, blockers and merge list entries.
//!
//! A [`Package`] is one buildable or installable unit: a specific
//! `category/name-version` (cpv) headed for a specific install root with a
//! specific operation. Packages are immutable once built and are shared as
//! [`PkgRef`] handles. Identity (equality and hashing) is the composite
//! [`PackageKey`], so two handles to equal keys are the same package for the
//! scheduler's purposes.
//!
//! The resolver hands the scheduler an ordered merge list of
//! [`MergeListEntry`] values. Blockers show up in that list for display and
//! resume purposes but are never scheduled.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::GraphError;

/// Root every package installs to unless told otherwise.
pub const DEFAULT_ROOT: &str = "/";

/// Slot assigned to packages that do not declare one.
pub const DEFAULT_SLOT: &str = "0";

static CPV_REGEX: OnceLock<Regex> = OnceLock::new();

fn get_cpv_regex() -> &'static Regex {
    CPV_REGEX.get_or_init(|| {
        Regex::new(
            r"^(?P<cat>[A-Za-z0-9+_][A-Za-z0-9+_.-]*)/(?P<pn>[A-Za-z0-9+_][A-Za-z0-9+_-]*?)-(?P<pv>[0-9]+(?:\.[0-9]+)*[a-z]?(?:_(?:alpha|beta|pre|rc|p)[0-9]*)*(?:-r[0-9]+)?)$",
        )
        .expect("Failed to compile cpv regex")
    })
}

/// Where a package comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageType {
    /// Built from source.
    Ebuild,
    /// Prebuilt binary package that only needs extracting.
    Binary,
    /// Already present in the installed package database.
    Installed,
}

impl PackageType {
    /// Returns the lowercase name used in resume lists and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageType::Ebuild => "ebuild",
            PackageType::Binary => "binary",
            PackageType::Installed => "installed",
        }
    }
}

impl fmt::Display for PackageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the merge list asks to be done with a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Install or upgrade.
    Merge,
    /// Remove an installed package.
    Uninstall,
    /// Nothing to do; the installed package is already correct.
    Nomerge,
}

impl Operation {
    /// Returns the lowercase operation name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Merge => "merge",
            Operation::Uninstall => "uninstall",
            Operation::Nomerge => "nomerge",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Composite identity of a package.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PackageKey {
    /// Package type.
    pub pkg_type: PackageType,
    /// Install root.
    pub root: String,
    /// `category/name-version`.
    pub cpv: String,
    /// Requested operation.
    pub operation: Operation,
    /// Repository the package comes from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
}

impl fmt::Display for PackageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} {}] {}", self.pkg_type, self.operation, self.cpv)?;
        if let Some(repo) = &self.repo {
            write!(f, "::{}", repo)?;
        }
        if self.root != DEFAULT_ROOT {
            write!(f, " to {}", self.root)?;
        }
        Ok(())
    }
}

/// One buildable or installable unit.
#[derive(Debug, Clone)]
pub struct Package {
    cpv: String,
    pkg_type: PackageType,
    operation: Operation,
    root: String,
    slot: String,
    repo: Option<String>,
    onlydeps: bool,
    interactive: bool,
    live: bool,
    replaces: Option<String>,
    metadata: BTreeMap<String, String>,
    split: CpvParts,
}

/// Shared handle to an immutable package.
pub type PkgRef = Arc<Package>;

#[derive(Debug, Clone)]
struct CpvParts {
    category_len: usize,
    cp_len: usize,
}

impl Package {
    /// Starts building a package for `cpv`.
    pub fn builder(cpv: impl Into<String>) -> PackageBuilder {
        PackageBuilder::new(cpv)
    }

    /// Returns the composite identity key.
    pub fn key(&self) -> PackageKey {
        PackageKey {
            pkg_type: self.pkg_type,
            root: self.root.clone(),
            cpv: self.cpv.clone(),
            operation: self.operation,
            repo: self.repo.clone(),
        }
    }

    /// `category/name-version`.
    pub fn cpv(&self) -> &str {
        &self.cpv
    }

    /// `category/name`.
    pub fn cp(&self) -> &str {
        &self.cpv[..self.split.cp_len]
    }

    /// The category part of the cpv.
    pub fn category(&self) -> &str {
        &self.cpv[..self.split.category_len]
    }

    /// `name-version`, used to name build directories.
    pub fn pf(&self) -> &str {
        &self.cpv[self.split.category_len + 1..]
    }

    /// The version part of the cpv.
    pub fn version(&self) -> &str {
        &self.cpv[self.split.cp_len + 1..]
    }

    /// `category/name:slot`.
    pub fn slot_atom(&self) -> String {
        format!("{}:{}", self.cp(), self.slot)
    }

    pub fn pkg_type(&self) -> PackageType {
        self.pkg_type
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn slot(&self) -> &str {
        &self.slot
    }

    pub fn repo(&self) -> Option<&str> {
        self.repo.as_deref()
    }

    /// True for packages taken from the installed package database.
    pub fn installed(&self) -> bool {
        self.pkg_type == PackageType::Installed
    }

    /// True for packages that do not need compiling.
    pub fn built(&self) -> bool {
        matches!(self.pkg_type, PackageType::Binary | PackageType::Installed)
    }

    /// True when the package was only pulled in for its dependencies.
    pub fn onlydeps(&self) -> bool {
        self.onlydeps
    }

    /// True when the package needs a terminal while it builds.
    pub fn interactive(&self) -> bool {
        self.interactive
    }

    /// True for packages built from a live VCS checkout.
    pub fn live(&self) -> bool {
        self.live
    }

    /// The installed cpv in the same slot that merging this package replaces.
    pub fn replaces(&self) -> Option<&str> {
        self.replaces.as_deref()
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Checks whether `atom` selects this package.
    ///
    /// Understands plain `category/name`, slotted `category/name:slot` and
    /// exact `=category/name-version` atoms.
    pub fn matches_atom(&self, atom: &str) -> bool {
        let atom = atom.trim();
        if let Some(exact) = atom.strip_prefix('=') {
            return exact == self.cpv;
        }
        match atom.split_once(':') {
            Some((cp, slot)) => cp == self.cp() && slot == self.slot,
            None => atom == self.cp(),
        }
    }
}

impl PartialEq for Package {
    fn eq(&self, other: &Self) -> bool {
        self.pkg_type == other.pkg_type
            && self.operation == other.operation
            && self.cpv == other.cpv
            && self.root == other.root
            && self.repo == other.repo
    }
}

impl Eq for Package {}

impl Hash for Package {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.pkg_type.hash(state);
        self.operation.hash(state);
        self.cpv.hash(state);
        self.root.hash(state);
        self.repo.hash(state);
    }
}

impl fmt::Display for Package {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cpv)?;
        if let Some(repo) = &self.repo {
            write!(f, "::{}", repo)?;
        }
        if self.root != DEFAULT_ROOT {
            write!(f, " to {}", self.root)?;
        }
        Ok(())
    }
}

/// Builder for [`Package`].
#[derive(Debug)]
pub struct PackageBuilder {
    cpv: String,
    pkg_type: PackageType,
    operation: Operation,
    root: String,
    slot: String,
    repo: Option<String>,
    onlydeps: bool,
    interactive: bool,
    live: bool,
    replaces: Option<String>,
    metadata: BTreeMap<String, String>,
}

impl PackageBuilder {
    /// Creates a builder for a source package merged into `/`.
    pub fn new(cpv: impl Into<String>) -> Self {
        Self {
            cpv: cpv.into(),
            pkg_type: PackageType::Ebuild,
            operation: Operation::Merge,
            root: DEFAULT_ROOT.to_string(),
            slot: DEFAULT_SLOT.to_string(),
            repo: None,
            onlydeps: false,
            interactive: false,
            live: false,
            replaces: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn pkg_type(mut self, pkg_type: PackageType) -> Self {
        self.pkg_type = pkg_type;
        self
    }

    pub fn operation(mut self, operation: Operation) -> Self {
        self.operation = operation;
        self
    }

    pub fn root<S: Into<String>>(mut self, root: S) -> Self {
        self.root = root.into();
        self
    }

    pub fn slot<S: Into<String>>(mut self, slot: S) -> Self {
        self.slot = slot.into();
        self
    }

    pub fn repo<S: Into<String>>(mut self, repo: S) -> Self {
        self.repo = Some(repo.into());
        self
    }

    pub fn onlydeps(mut self, onlydeps: bool) -> Self {
        self.onlydeps = onlydeps;
        self
    }

    pub fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    pub fn live(mut self, live: bool) -> Self {
        self.live = live;
        self
    }

    pub fn replaces<S: Into<String>>(mut self, cpv: S) -> Self {
        self.replaces = Some(cpv.into());
        self
    }

    pub fn metadata<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Validates the cpv and builds the package.
    pub fn build(self) -> Result<Package, GraphError> {
        let captures = get_cpv_regex()
            .captures(&self.cpv)
            .ok_or_else(|| GraphError::InvalidAtom {
                atom: self.cpv.clone(),
                message: "expected category/name-version".to_string(),
            })?;
        let category_len = captures.name("cat").map_or(0, |m| m.end());
        let cp_len = captures.name("pn").map_or(0, |m| m.end());
        if self.root.is_empty() {
            return Err(GraphError::InvalidAtom {
                atom: self.cpv,
                message: "install root must not be empty".to_string(),
            });
        }

        Ok(Package {
            cpv: self.cpv,
            pkg_type: self.pkg_type,
            operation: self.operation,
            root: self.root,
            slot: self.slot,
            repo: self.repo,
            onlydeps: self.onlydeps,
            interactive: self.interactive,
            live: self.live,
            replaces: self.replaces,
            metadata: self.metadata,
            split: CpvParts {
                category_len,
                cp_len,
            },
        })
    }
}

/// A constraint saying two packages must not be installed together.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Blocker {
    /// The blocking atom, e.g. `!app-misc/foo`.
    pub atom: String,
    /// Install root the blocker applies to.
    #[serde(default = "default_root")]
    pub root: String,
    /// The cpv of the package that carries the blocker.
    pub parent: String,
    /// Whether the resolver already arranged for the conflict to go away.
    #[serde(default)]
    pub satisfied: bool,
}

fn default_root() -> String {
    DEFAULT_ROOT.to_string()
}

impl fmt::Display for Blocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (from {})", self.atom, self.parent)
    }
}

/// One entry of the resolver's merge list.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeListEntry {
    /// A package to fetch, build and merge, uninstall, or skip.
    Package(PkgRef),
    /// A blocker kept in the list for reporting only.
    Blocker(Blocker),
}

impl MergeListEntry {
    /// Returns the package if this entry is one.
    pub fn as_package(&self) -> Option<&PkgRef> {
        match self {
            MergeListEntry::Package(pkg) => Some(pkg),
            MergeListEntry::Blocker(_) => None,
        }
    }
}

/// Interning cache so identical package requests share one instance.
#[derive(Debug, Default)]
pub struct PackageCache {
    packages: HashMap<PackageKey, PkgRef>,
}

impl PackageCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached handle for `pkg`, inserting it when new.
    pub fn intern(&mut self, pkg: Package) -> PkgRef {
        self.packages
            .entry(pkg.key())
            .or_insert_with(|| Arc::new(pkg))
            .clone()
    }

    pub fn get(&self, key: &PackageKey) -> Option<&PkgRef> {
        self.packages.get(key)
    }

    /// Finds a package by type, root, cpv and operation, ignoring the repo.
    pub fn find(
        &self,
        pkg_type: PackageType,
        root: &str,
        cpv: &str,
        operation: Operation,
    ) -> Option<&PkgRef> {
        self.packages.values().find(|pkg| {
            pkg.pkg_type == pkg_type
                && pkg.operation == operation
                && pkg.root == root
                && pkg.cpv == cpv
        })
    }

    pub fn remove(&mut self, key: &PackageKey) -> Option<PkgRef> {
        self.packages.remove(key)
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn clear(&mut self) {
        self.packages.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// # Cpv Splitting
    ///
    /// Verifies that category, name and version are derived from the cpv.
    ///
    /// ## Test Scenario
    /// - Builds a package with a revisioned version
    ///
    /// ## Expected Outcome
    /// - cp, category, pf and version slice the cpv correctly
    #[test]
    fn test_cpv_splitting() {
        let pkg = Package::builder("dev-libs/openssl-3.0.13-r1")
            .slot("3")
            .build()
            .unwrap();

        assert_eq!(pkg.cp(), "dev-libs/openssl");
        assert_eq!(pkg.category(), "dev-libs");
        assert_eq!(pkg.pf(), "openssl-3.0.13-r1");
        assert_eq!(pkg.version(), "3.0.13-r1");
        assert_eq!(pkg.slot_atom(), "dev-libs/openssl:3");
    }

    /// # Hyphenated Package Names
    ///
    /// Verifies that names containing hyphens are split at the version.
    ///
    /// ## Test Scenario
    /// - Builds packages whose names contain hyphens and digits
    ///
    /// ## Expected Outcome
    /// - The version is the trailing version-shaped component only
    #[test]
    fn test_hyphenated_names() {
        let pkg = Package::builder("x11-libs/gtk-layer-shell-0.8.2")
            .build()
            .unwrap();
        assert_eq!(pkg.cp(), "x11-libs/gtk-layer-shell");
        assert_eq!(pkg.version(), "0.8.2");

        let pkg = Package::builder("media-libs/libv4l-1.22_p20240101")
            .build()
            .unwrap();
        assert_eq!(pkg.cp(), "media-libs/libv4l");
    }

    /// # Invalid Cpv Rejected
    ///
    /// Verifies that malformed identifiers fail to build.
    ///
    /// ## Test Scenario
    /// - Builds packages without a version or category
    ///
    /// ## Expected Outcome
    /// - An InvalidAtom error is returned
    #[test]
    fn test_invalid_cpv_rejected() {
        for bad in ["openssl-3.0", "dev-libs/openssl", "", "dev-libs/-1.0"] {
            let result = Package::builder(bad).build();
            assert!(
                matches!(result, Err(GraphError::InvalidAtom { .. })),
                "{bad} should be rejected"
            );
        }
    }

    /// # Installed and Built Flags
    ///
    /// Verifies the derived flags for each package type.
    ///
    /// ## Test Scenario
    /// - Builds one package of each type
    ///
    /// ## Expected Outcome
    /// - Only installed packages are installed; binary and installed are built
    #[test]
    fn test_installed_and_built_flags() {
        let ebuild = Package::builder("a/b-1").build().unwrap();
        let binary = Package::builder("a/b-1")
            .pkg_type(PackageType::Binary)
            .build()
            .unwrap();
        let installed = Package::builder("a/b-1")
            .pkg_type(PackageType::Installed)
            .operation(Operation::Uninstall)
            .build()
            .unwrap();

        assert!(!ebuild.installed() && !ebuild.built());
        assert!(!binary.installed() && binary.built());
        assert!(installed.installed() && installed.built());
    }

    /// # Atom Matching
    ///
    /// Verifies plain, slotted and exact atoms.
    ///
    /// ## Test Scenario
    /// - Matches a slotted package against several atoms
    ///
    /// ## Expected Outcome
    /// - Matching atoms return true, others false
    #[test]
    fn test_atom_matching() {
        let pkg = Package::builder("sys-devel/gcc-13.2.1")
            .slot("13")
            .build()
            .unwrap();

        assert!(pkg.matches_atom("sys-devel/gcc"));
        assert!(pkg.matches_atom("sys-devel/gcc:13"));
        assert!(pkg.matches_atom("=sys-devel/gcc-13.2.1"));
        assert!(!pkg.matches_atom("sys-devel/gcc:14"));
        assert!(!pkg.matches_atom("=sys-devel/gcc-13.2.0"));
        assert!(!pkg.matches_atom("sys-devel/clang"));
    }

    /// # Identity By Key
    ///
    /// Verifies that equality ignores non-key attributes.
    ///
    /// ## Test Scenario
    /// - Builds two packages with the same key but different metadata
    /// - Builds a third with a different operation
    ///
    /// ## Expected Outcome
    /// - The first two are equal, the third differs
    #[test]
    fn test_identity_by_key() {
        let a = Package::builder("a/b-1").metadata("USE", "x").build().unwrap();
        let b = Package::builder("a/b-1").metadata("USE", "y").build().unwrap();
        let c = Package::builder("a/b-1")
            .pkg_type(PackageType::Installed)
            .operation(Operation::Nomerge)
            .build()
            .unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.key(), b.key());
    }

    /// # Package Cache Interning
    ///
    /// Verifies that identical requests reuse one instance.
    ///
    /// ## Test Scenario
    /// - Interns the same package twice
    /// - Looks it up with find() ignoring the repo
    ///
    /// ## Expected Outcome
    /// - Both handles point to the same allocation
    #[test]
    fn test_package_cache_interning() {
        let mut cache = PackageCache::new();
        let first = cache.intern(Package::builder("a/b-1").repo("gentoo").build().unwrap());
        let second = cache.intern(Package::builder("a/b-1").repo("gentoo").build().unwrap());

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);

        let found = cache
            .find(PackageType::Ebuild, "/", "a/b-1", Operation::Merge)
            .unwrap();
        assert!(Arc::ptr_eq(found, &first));
    }

    /// # Key Display
    ///
    /// Verifies the human readable key format.
    ///
    /// ## Test Scenario
    /// - Formats a key with a repo and a non-default root
    ///
    /// ## Expected Outcome
    /// - Type, operation, cpv, repo and root all appear
    #[test]
    fn test_key_display() {
        let pkg = Package::builder("a/b-1")
            .repo("gentoo")
            .root("/mnt/target")
            .build()
            .unwrap();
        assert_eq!(
            pkg.key().to_string(),
            "[ebuild merge] a/b-1::gentoo to /mnt/target"
        );
    }
}

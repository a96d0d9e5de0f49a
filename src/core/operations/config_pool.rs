//! Per-task build settings and the pool that hands them out.
//!
//! Every running build or merge mutates its own [`BuildSettings`] (it sets
//! the package, the build directory and the log file). The [`ConfigPool`]
//! keeps a free list per install root so snapshots are reused, and tracks
//! which snapshots are out so that a double return or a return of a foreign
//! snapshot is caught as a scheduling error.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::SchedulingError;
use crate::package::Package;

/// Mutable per-task configuration snapshot.
///
/// Not `Clone`: a snapshot can only be in one task at a time.
#[derive(Debug)]
pub struct BuildSettings {
    id: u64,
    root: String,
    env: BTreeMap<String, String>,
    cpv: Option<String>,
    build_dir: Option<PathBuf>,
    log_file: Option<PathBuf>,
    /// Whether phases run without a terminal.
    pub background: bool,
}

impl BuildSettings {
    /// Unique identifier of this snapshot within its pool.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Environment passed to phase commands.
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn set_env(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.env.insert(key.into(), value.into());
    }

    pub fn cpv(&self) -> Option<&str> {
        self.cpv.as_deref()
    }

    pub fn build_dir(&self) -> Option<&Path> {
        self.build_dir.as_deref()
    }

    pub fn log_file(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }

    /// Points the snapshot at `pkg`, deriving its build directory and log.
    pub fn setcpv(&mut self, pkg: &Package, build_root: &Path) {
        let build_dir = build_root.join(pkg.category()).join(pkg.pf());
        let log_file = build_dir.join("temp").join("build.log");
        self.cpv = Some(pkg.cpv().to_string());
        self.env.insert("PKGMERGE_CPV".to_string(), pkg.cpv().to_string());
        self.env.insert("PKGMERGE_SLOT".to_string(), pkg.slot().to_string());
        self.env.insert(
            "PKGMERGE_BUILD_DIR".to_string(),
            build_dir.to_string_lossy().into_owned(),
        );
        self.env.insert(
            "PKGMERGE_LOG_FILE".to_string(),
            log_file.to_string_lossy().into_owned(),
        );
        self.build_dir = Some(build_dir);
        self.log_file = Some(log_file);
    }

    /// Clears everything `setcpv` and the task changed.
    fn reset(&mut self, base: &BTreeMap<String, String>) {
        self.env = base.clone();
        self.cpv = None;
        self.build_dir = None;
        self.log_file = None;
        self.background = false;
    }
}

/// Free lists of [`BuildSettings`] per install root.
#[derive(Debug)]
pub struct ConfigPool {
    base_env: BTreeMap<String, String>,
    free: HashMap<String, Vec<BuildSettings>>,
    outstanding: HashMap<u64, String>,
    next_id: u64,
}

impl ConfigPool {
    /// Creates a pool whose snapshots start from `base_env`.
    pub fn new(base_env: BTreeMap<String, String>) -> Self {
        Self {
            base_env,
            free: HashMap::new(),
            outstanding: HashMap::new(),
            next_id: 1,
        }
    }

    /// Hands out a snapshot for `root`, reusing a returned one when possible.
    pub fn allocate(&mut self, root: &str) -> BuildSettings {
        let settings = match self.free.get_mut(root).and_then(Vec::pop) {
            Some(settings) => settings,
            None => self.fork(root),
        };
        self.outstanding.insert(settings.id, root.to_string());
        debug!("Allocated config {} for root {}", settings.id, root);
        settings
    }

    /// Takes a snapshot back.
    ///
    /// Fails when the snapshot is not currently handed out by this pool.
    pub fn deallocate(&mut self, mut settings: BuildSettings) -> Result<(), SchedulingError> {
        match self.outstanding.remove(&settings.id) {
            Some(root) if root == settings.root => {
                let mut base = self.base_env.clone();
                base.insert("PKGMERGE_ROOT".to_string(), root.clone());
                settings.reset(&base);
                debug!("Released config {} for root {}", settings.id, root);
                self.free.entry(root).or_default().push(settings);
                Ok(())
            }
            Some(root) => {
                self.outstanding.insert(settings.id, root);
                Err(SchedulingError::UnbalancedConfig {
                    snapshot: settings.id,
                    root: settings.root,
                })
            }
            None => Err(SchedulingError::UnbalancedConfig {
                snapshot: settings.id,
                root: settings.root,
            }),
        }
    }

    /// Number of snapshots currently handed out.
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    fn fork(&mut self, root: &str) -> BuildSettings {
        let id = self.next_id;
        self.next_id += 1;
        let mut env = self.base_env.clone();
        env.insert("PKGMERGE_ROOT".to_string(), root.to_string());
        BuildSettings {
            id,
            root: root.to_string(),
            env,
            cpv: None,
            build_dir: None,
            log_file: None,
            background: false,
        }
    }
}

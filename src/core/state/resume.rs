//! Persistent resume list.
//!
//! Before anything runs, the scheduler records every `merge` entry of the
//! merge list together with the options of the run. Each successful merge
//! removes its entry and commits, so that `pkgmerge resume` picks up exactly
//! the work that has not completed yet.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::file::{SCHEMA_VERSION, read_json, remove_state_file, write_json_atomic};
use crate::package::{Operation, Package, PackageType};

/// Plain identifier of one resume list entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResumeEntry {
    #[serde(rename = "type")]
    pub pkg_type: PackageType,
    pub root: String,
    pub cpv: String,
    pub operation: Operation,
}

impl ResumeEntry {
    pub fn new(
        pkg_type: PackageType,
        root: impl Into<String>,
        cpv: impl Into<String>,
        operation: Operation,
    ) -> Self {
        Self {
            pkg_type,
            root: root.into(),
            cpv: cpv.into(),
            operation,
        }
    }

    /// True when this entry names `pkg`.
    pub fn matches(&self, pkg: &Package) -> bool {
        self.pkg_type == pkg.pkg_type()
            && self.operation == pkg.operation()
            && self.cpv == pkg.cpv()
            && self.root == pkg.root()
    }
}

impl From<&Package> for ResumeEntry {
    fn from(pkg: &Package) -> Self {
        Self::new(pkg.pkg_type(), pkg.root(), pkg.cpv(), pkg.operation())
    }
}

impl fmt::Display for ResumeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} {} {} {}]",
            self.pkg_type, self.root, self.cpv, self.operation
        )
    }
}

/// Options of the interrupted run, restored by `pkgmerge resume`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SavedOptions {
    /// Concurrent job limit; `None` means unlimited.
    pub jobs: Option<usize>,
    pub load_average: Option<f64>,
    pub keep_going: bool,
    pub nodeps: bool,
    pub fetch_only: bool,
    pub buildpkg: bool,
    pub buildpkg_only: bool,
    pub oneshot: bool,
    pub parallel_fetch: bool,
    pub parallel_install: bool,
}

/// The persisted resume record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeState {
    /// Schema version for forward compatibility.
    pub schema_version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Graph document the merge list came from.
    pub graph: PathBuf,
    /// Target root of the run.
    pub target_root: PathBuf,
    /// Pending merges in resolver order.
    pub mergelist: Vec<ResumeEntry>,
    pub options: SavedOptions,
    pub favorites: Vec<String>,
}

impl ResumeState {
    pub fn new(
        graph: impl Into<PathBuf>,
        target_root: impl Into<PathBuf>,
        mergelist: Vec<ResumeEntry>,
        options: SavedOptions,
        favorites: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            schema_version: SCHEMA_VERSION,
            created_at: now,
            updated_at: now,
            graph: graph.into(),
            target_root: target_root.into(),
            mergelist,
            options,
            favorites,
        }
    }

    /// Removes the first entry naming `pkg`. Returns whether one was found.
    pub fn remove_entry(&mut self, pkg: &Package) -> bool {
        match self.mergelist.iter().position(|entry| entry.matches(pkg)) {
            Some(index) => {
                self.mergelist.remove(index);
                self.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.schema_version != SCHEMA_VERSION {
            anyhow::bail!(
                "Unsupported schema version: {} (expected {}). \
                 The resume file may have been created by a different version of pkgmerge.",
                self.schema_version,
                SCHEMA_VERSION
            );
        }
        if self.graph.as_os_str().is_empty() {
            anyhow::bail!("Resume file corrupted: missing required field 'graph'");
        }
        Ok(())
    }
}

/// Key-value store holding the resume record.
///
/// Mutations are staged in memory and become durable on
/// [`commit`](ResumeStore::commit). A staged `None` deletes the record.
pub trait ResumeStore: Send {
    /// The staged record, if any.
    fn get(&self) -> Option<&ResumeState>;

    /// Mutable access to the staged record.
    fn get_mut(&mut self) -> Option<&mut ResumeState>;

    /// Replaces the staged record.
    fn set(&mut self, state: Option<ResumeState>);

    /// Makes the staged record durable.
    fn commit(&mut self) -> Result<()>;
}

/// Resume store backed by an atomically written JSON file.
#[derive(Debug)]
pub struct FileResumeStore {
    path: PathBuf,
    state: Option<ResumeState>,
}

impl FileResumeStore {
    /// Opens the store at `path`, loading and validating an existing record.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = if path.exists() {
            let state: ResumeState = read_json(&path)?;
            state.validate()?;
            Some(state)
        } else {
            None
        };
        Ok(Self { path, state })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ResumeStore for FileResumeStore {
    fn get(&self) -> Option<&ResumeState> {
        self.state.as_ref()
    }

    fn get_mut(&mut self) -> Option<&mut ResumeState> {
        self.state.as_mut()
    }

    fn set(&mut self, state: Option<ResumeState>) {
        self.state = state;
    }

    fn commit(&mut self) -> Result<()> {
        match &mut self.state {
            Some(state) => {
                state.updated_at = Utc::now();
                write_json_atomic(&self.path, state)
            }
            None => remove_state_file(&self.path),
        }
    }
}

/// Committed snapshots of a [`MemoryResumeStore`], oldest first.
pub type CommitLog = Arc<Mutex<Vec<Option<ResumeState>>>>;

/// In-memory resume store that records every commit.
#[derive(Debug, Default)]
pub struct MemoryResumeStore {
    state: Option<ResumeState>,
    commits: CommitLog,
}

impl MemoryResumeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that starts out with `state` already committed.
    pub fn with_state(state: ResumeState) -> Self {
        Self {
            state: Some(state),
            commits: CommitLog::default(),
        }
    }

    /// Shared handle to the commit log, usable after the store moved away.
    pub fn commit_log(&self) -> CommitLog {
        Arc::clone(&self.commits)
    }
}

impl ResumeStore for MemoryResumeStore {
    fn get(&self) -> Option<&ResumeState> {
        self.state.as_ref()
    }

    fn get_mut(&mut self) -> Option<&mut ResumeState> {
        self.state.as_mut()
    }

    fn set(&mut self, state: Option<ResumeState>) {
        self.state = state;
    }

    fn commit(&mut self) -> Result<()> {
        let mut commits = self
            .commits
            .lock()
            .map_err(|_| anyhow::anyhow!("resume commit log poisoned"))?;
        commits.push(self.state.clone());
        Ok(())
    }
}

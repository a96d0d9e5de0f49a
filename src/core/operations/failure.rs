//! Failed package bookkeeping.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::output::FailureInfo;
use crate::package::PkgRef;

/// Stage a package failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    /// Pre-merge checks refused the package.
    Pretend,
    /// Sources or binary package could not be fetched.
    Fetch,
    /// A build or extract phase failed.
    Build,
    /// The merge into the root failed.
    Install,
    /// Only the post-install step failed; the package is merged.
    Postinst,
    /// Removed under keep-going because a dependency failed.
    Dropped,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStage::Pretend => "pretend",
            FailureStage::Fetch => "fetch",
            FailureStage::Build => "build",
            FailureStage::Install => "install",
            FailureStage::Postinst => "postinst",
            FailureStage::Dropped => "dropped",
        }
    }
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A package that failed, with what is needed to diagnose it.
#[derive(Debug, Clone)]
pub struct FailedPkg {
    pub pkg: PkgRef,
    pub stage: FailureStage,
    pub build_dir: Option<PathBuf>,
    pub build_log: Option<PathBuf>,
    pub returncode: i32,
}

impl FailedPkg {
    pub fn new(pkg: PkgRef, stage: FailureStage, returncode: i32) -> Self {
        Self {
            pkg,
            stage,
            build_dir: None,
            build_log: None,
            returncode,
        }
    }

    pub fn with_paths(mut self, build_dir: Option<&Path>, build_log: Option<&Path>) -> Self {
        self.build_dir = build_dir.map(Path::to_path_buf);
        self.build_log = build_log.map(Path::to_path_buf);
        self
    }

    /// Summary entry for the end of run report.
    pub fn info(&self) -> FailureInfo {
        FailureInfo {
            cpv: self.pkg.cpv().to_string(),
            root: self.pkg.root().to_string(),
            action: self.stage.to_string(),
            log_file: locate_failure_log(self),
        }
    }
}

/// Returns the build log of `failed` when it exists and is not empty.
pub fn locate_failure_log(failed: &FailedPkg) -> Option<PathBuf> {
    let log = failed.build_log.as_ref()?;
    match std::fs::metadata(log) {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Some(log.clone()),
        _ => None,
    }
}

/// Failures of the current pass and of the whole run.
#[derive(Debug, Default)]
pub struct FailureTracker {
    failed: Vec<FailedPkg>,
    failed_all: Vec<FailedPkg>,
}

impl FailureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a failure that stops scheduling of dependents.
    pub fn record(&mut self, failed: FailedPkg) {
        self.failed.push(failed);
    }

    /// Records a failure that does not affect scheduling.
    ///
    /// Used for post-install failures and keep-going drops, which only
    /// show up in the final report.
    pub fn record_reported(&mut self, failed: FailedPkg) {
        self.failed_all.push(failed);
    }

    /// Failures of the current pass.
    pub fn pass_failures(&self) -> &[FailedPkg] {
        &self.failed
    }

    pub fn has_pass_failures(&self) -> bool {
        !self.failed.is_empty()
    }

    /// Moves the failures of the current pass into the run-wide list.
    pub fn end_pass(&mut self) {
        self.failed_all.append(&mut self.failed);
    }

    /// Every failure reported so far, including the current pass.
    pub fn all(&self) -> impl Iterator<Item = &FailedPkg> {
        self.failed_all.iter().chain(self.failed.iter())
    }

    pub fn total(&self) -> usize {
        self.failed_all.len() + self.failed.len()
    }
}

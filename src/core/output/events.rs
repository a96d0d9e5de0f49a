//! Progress events emitted by the scheduler.
//!
//! These events represent the different stages and outcomes of a run,
//! designed to be serializable for JSON/NDJSON output and renderable for text output.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::core::state::{ResumeEntry, ResumeState, SavedOptions};

/// Progress events emitted during a run.
///
/// Each variant represents a distinct stage or outcome that should be
/// communicated to the user or consuming system.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// A scheduling pass is starting.
    Start {
        /// Number of packages that will be built or extracted.
        total: usize,
        /// Concurrent job limit, `None` when unlimited.
        #[serde(skip_serializing_if = "Option::is_none")]
        jobs: Option<usize>,
        /// Whether this pass continues an earlier run.
        resuming: bool,
    },

    /// A build, extract or fetch job was started.
    JobStarted {
        cpv: String,
        root: String,
        kind: JobKind,
        /// 1-based position among the packages of this pass.
        index: usize,
        total: usize,
    },

    /// A build or extract job finished successfully.
    BuildCompleted { cpv: String, root: String },

    /// A merge or uninstall started.
    MergeStarted {
        cpv: String,
        root: String,
        /// True for uninstall operations.
        uninstall: bool,
    },

    /// A merge or uninstall finished successfully.
    MergeCompleted {
        cpv: String,
        root: String,
        uninstall: bool,
    },

    /// A package failed.
    PackageFailed {
        cpv: String,
        root: String,
        /// Stage that failed (`fetch`, `build`, `install`, ...).
        action: String,
        returncode: i32,
        #[serde(skip_serializing_if = "Option::is_none")]
        log_file: Option<PathBuf>,
    },

    /// The post-install step failed; the package is still merged.
    PostinstFailed {
        cpv: String,
        root: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        log_file: Option<PathBuf>,
    },

    /// The world favorites file changed.
    WorldUpdated {
        atom: String,
        /// True when recorded, false when removed.
        added: bool,
    },

    /// A package was dropped from the resume list under keep-going.
    KeepGoingDropped {
        cpv: String,
        root: String,
        /// Packages it needed that failed or were dropped.
        requires: Vec<String>,
    },

    /// The merge list is being recalculated after failures.
    Resuming {
        /// Entries left in the resume list.
        remaining: usize,
    },

    /// Periodic job status line.
    JobStatus(JobStatusInfo),

    /// A termination signal was received.
    Signal { signal: i32 },

    /// Build log of the only failed package.
    FailureLog {
        cpv: String,
        log_file: PathBuf,
        contents: String,
    },

    /// A pass finished.
    Complete {
        merged: usize,
        failed: usize,
        total: usize,
    },

    /// Error event for general errors.
    Error {
        /// Error message.
        message: String,
        /// Optional error code.
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

/// What a started job does.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Build from source.
    Build,
    /// Extract a binary package.
    Binary,
    /// Fetch sources only.
    Fetch,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::Build => write!(f, "build"),
            JobKind::Binary => write!(f, "binary"),
            JobKind::Fetch => write!(f, "fetch"),
        }
    }
}

/// Counts shown by the job status line.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobStatusInfo {
    pub completed: usize,
    pub total: usize,
    pub running: usize,
    pub failed: usize,
    /// 1, 5 and 15 minute load averages, when available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_avg: Option<[f64; 3]>,
}

/// Overall result of a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunResult {
    /// Every package merged.
    Success,
    /// At least one package failed.
    Failed,
    /// Stopped by a signal.
    Interrupted,
}

impl std::fmt::Display for RunResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunResult::Success => write!(f, "success"),
            RunResult::Failed => write!(f, "failed"),
            RunResult::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Saved resume list shown by `pkgmerge status`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResumeStatus {
    pub target_root: PathBuf,
    pub graph: PathBuf,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Pending entries in merge order.
    pub entries: Vec<ResumeEntry>,
    pub options: SavedOptions,
}

impl From<&ResumeState> for ResumeStatus {
    fn from(state: &ResumeState) -> Self {
        Self {
            target_root: state.target_root.clone(),
            graph: state.graph.clone(),
            created_at: state.created_at,
            updated_at: state.updated_at,
            entries: state.mergelist.clone(),
            options: state.options.clone(),
        }
    }
}

/// A failed package in the final summary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureInfo {
    pub cpv: String,
    pub root: String,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

/// End of run summary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    pub result: RunResult,
    pub merged: usize,
    pub failed: usize,
    pub exit_code: i32,
    /// Every failure of the run, oldest first.
    pub failures: Vec<FailureInfo>,
    /// Whether the text summary lists the failures.
    #[serde(skip)]
    pub list_failures: bool,
}

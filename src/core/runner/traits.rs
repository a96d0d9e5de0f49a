//! Traits and common types for the scheduler.
//!
//! This module defines the build phases, the executor seam that runs them,
//! and the typed options of a scheduler run.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::task::CancelToken;
use crate::core::operations::{BuildSettings, DEFAULT_JOB_DELAY_MAX, DEFAULT_SIGCONT_DELAY, MaxJobs};
use crate::core::state::SavedOptions;
use crate::package::{DEFAULT_ROOT, Package};

/// Default interval of the periodic load average re-check.
pub const DEFAULT_LOADAVG_LATENCY: Duration = Duration::from_secs(30);

/// Default interval of the status display refresh.
pub const DEFAULT_DISPLAY_LATENCY: Duration = Duration::from_secs(3);

/// Default parent directory of package build directories.
pub const DEFAULT_BUILD_DIR: &str = "/var/tmp/pkgmerge";

/// One step of building, installing or removing a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Pre-merge checks, run once per package before any job starts.
    Pretend,
    /// Download sources or the binary package.
    Fetch,
    /// Prepare the build environment.
    Setup,
    /// Extract sources.
    Unpack,
    /// Build from source.
    Compile,
    /// Install into the image directory.
    Install,
    /// Create a binary package from the image.
    Package,
    /// Extract a binary package into the image directory.
    Extract,
    /// Merge the image into the root.
    Merge,
    /// Run post-install steps.
    Postinst,
    /// Remove an installed package.
    Unmerge,
}

impl Phase {
    pub const ALL: [Phase; 11] = [
        Phase::Pretend,
        Phase::Fetch,
        Phase::Setup,
        Phase::Unpack,
        Phase::Compile,
        Phase::Install,
        Phase::Package,
        Phase::Extract,
        Phase::Merge,
        Phase::Postinst,
        Phase::Unmerge,
    ];

    /// Returns the configuration key name for this phase.
    pub fn config_key(&self) -> &'static str {
        match self {
            Phase::Pretend => "pretend",
            Phase::Fetch => "fetch",
            Phase::Setup => "setup",
            Phase::Unpack => "unpack",
            Phase::Compile => "compile",
            Phase::Install => "install",
            Phase::Package => "package",
            Phase::Extract => "extract",
            Phase::Merge => "merge",
            Phase::Postinst => "postinst",
            Phase::Unmerge => "unmerge",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.config_key())
    }
}

/// Shell commands per phase, from the `[phases]` table.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PhasesConfig {
    #[serde(default, flatten)]
    commands: BTreeMap<String, Vec<String>>,
}

impl PhasesConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the commands of one phase.
    pub fn with(mut self, phase: Phase, commands: Vec<String>) -> Self {
        self.commands.insert(phase.config_key().to_string(), commands);
        self
    }

    /// Returns the commands for a given phase.
    pub fn commands_for(&self, phase: Phase) -> &[String] {
        self.commands
            .get(phase.config_key())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Keys that do not name a phase.
    pub fn unknown_keys(&self) -> Vec<&str> {
        self.commands
            .keys()
            .map(String::as_str)
            .filter(|key| !Phase::ALL.iter().any(|p| p.config_key() == *key))
            .collect()
    }

    /// Merges another config into this one, with other taking precedence
    /// for every phase it configures.
    pub fn merge(mut self, other: Self) -> Self {
        for (phase, commands) in other.commands {
            if !commands.is_empty() {
                self.commands.insert(phase, commands);
            }
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.commands.values().all(Vec::is_empty)
    }
}

/// Result of one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseOutcome {
    pub returncode: i32,
}

impl PhaseOutcome {
    pub const SUCCESS: PhaseOutcome = PhaseOutcome { returncode: 0 };

    pub fn is_success(&self) -> bool {
        self.returncode == 0
    }
}

/// Runs build phases.
///
/// Implementations must return promptly once `cancel` fires, terminating
/// whatever they started.
#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    async fn run_phase(
        &self,
        pkg: &Package,
        phase: Phase,
        settings: &BuildSettings,
        cancel: &mut CancelToken,
    ) -> Result<PhaseOutcome>;
}

/// Options of a scheduler run.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerOptions {
    pub max_jobs: MaxJobs,
    pub max_load: Option<f64>,
    pub keep_going: bool,
    pub nodeps: bool,
    pub fetch_only: bool,
    pub buildpkg: bool,
    pub buildpkg_only: bool,
    pub oneshot: bool,
    pub quiet: bool,
    pub parallel_fetch: bool,
    pub parallel_install: bool,
    pub ebuild_locks: bool,
    pub implicit_system_deps: bool,
    pub job_delay_max: Duration,
    pub sigcont_delay: Duration,
    pub loadavg_latency: Duration,
    pub display_latency: Duration,
    pub build_dir: PathBuf,
    pub target_root: String,
    /// Continuing a previously interrupted run.
    pub resuming: bool,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            max_jobs: MaxJobs::ONE,
            max_load: None,
            keep_going: false,
            nodeps: false,
            fetch_only: false,
            buildpkg: false,
            buildpkg_only: false,
            oneshot: false,
            quiet: false,
            parallel_fetch: false,
            parallel_install: false,
            ebuild_locks: true,
            implicit_system_deps: true,
            job_delay_max: DEFAULT_JOB_DELAY_MAX,
            sigcont_delay: DEFAULT_SIGCONT_DELAY,
            loadavg_latency: DEFAULT_LOADAVG_LATENCY,
            display_latency: DEFAULT_DISPLAY_LATENCY,
            build_dir: PathBuf::from(DEFAULT_BUILD_DIR),
            target_root: DEFAULT_ROOT.to_string(),
            resuming: false,
        }
    }
}

impl SchedulerOptions {
    /// Options recorded in the resume list.
    pub fn saved(&self) -> SavedOptions {
        SavedOptions {
            jobs: self.max_jobs.count(),
            load_average: self.max_load,
            keep_going: self.keep_going,
            nodeps: self.nodeps,
            fetch_only: self.fetch_only,
            buildpkg: self.buildpkg,
            buildpkg_only: self.buildpkg_only,
            oneshot: self.oneshot,
            parallel_fetch: self.parallel_fetch,
            parallel_install: self.parallel_install,
        }
    }
}

//! Scheduling operations.
//!
//! The building blocks the scheduler loop drives. They hold state and make
//! decisions; none of them spawn tasks or touch the event loop.
//!
//! # Modules
//!
//! - [`chooser`] - Pending package queue and next-package selection
//! - [`admission`] - Job limit, load average limit and job start delay
//! - [`system_deps`] - Serialized merges of system runtime dependencies
//! - [`config_pool`] - Per-task build settings snapshots
//! - [`failure`] - Failed package records and failure log lookup
//! - [`world`] - The world favorites set

pub mod admission;
pub mod chooser;
pub mod config_pool;
pub mod failure;
pub mod system_deps;
pub mod world;

// Re-export commonly used types
pub use admission::{
    AdmissionLimits, DEFAULT_JOB_DELAY_MAX, DEFAULT_SIGCONT_DELAY, FixedLoadAverage, JobAdmission,
    LoadAverage, MaxJobs, SystemLoadAverage,
};
pub use chooser::{ChooseContext, PackageChooser, dependent_on_scheduled_merges, prune_graph};
pub use config_pool::{BuildSettings, ConfigPool};
pub use failure::{FailedPkg, FailureStage, FailureTracker, locate_failure_log};
pub use system_deps::SystemDepsGate;
pub use world::{FileWorldSet, MemoryWorldSet, WorldSet};

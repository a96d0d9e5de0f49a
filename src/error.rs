//! Unified error handling for the pkgmerge library.
//!
//! This module provides the error hierarchy using `thiserror` so that callers
//! can tell graph problems, resume failures, configuration mistakes and
//! internal scheduler bugs apart.
//!
//! ## Error Categories
//!
//! - [`GraphError`]: Errors reading or validating a dependency graph document
//! - [`ResolveError`]: Errors recomputing a merge list from a resume list
//! - [`ConfigError`]: Errors from configuration loading and validation
//! - [`SchedulingError`]: Internal invariant violations inside the scheduler
//!
//! Per-package build and merge failures are not errors at this level. They are
//! recorded as [`FailedPkg`](crate::core::operations::FailedPkg) entries and
//! reported at the end of the run.
//!
//! ## Example
//!
//! ```rust,no_run
//! use pkgmerge::error::{PkgmergeError, ResolveError};
//!
//! fn example() -> Result<(), PkgmergeError> {
//!     // Errors are automatically converted via From trait
//!     Err(ResolveError::EmptyResumeList)?;
//!     Ok(())
//! }
//! ```

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the pkgmerge library.
#[derive(Error, Debug)]
pub enum PkgmergeError {
    /// The dependency graph document is invalid.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// A merge list could not be recomputed.
    #[error("Resolve error: {0}")]
    Resolve(#[from] ResolveError),

    /// An error occurred while loading or validating configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The scheduler detected a broken invariant and aborted the run.
    #[error("Internal scheduling error: {0}")]
    Scheduling(#[from] SchedulingError),

    /// A generic error for cases not covered by specific error types.
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Errors found while loading a dependency graph document.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    /// An edge or merge list entry names a package that is not declared.
    #[error("Unknown package '{id}' referenced by {context}")]
    UnknownPackage {
        /// The package identifier that could not be found.
        id: String,
        /// Where the reference appeared (edge, merge list, ...).
        context: String,
    },

    /// Two packages were declared with the same identifier.
    #[error("Package '{id}' is declared more than once")]
    DuplicatePackage {
        /// The duplicated identifier.
        id: String,
    },

    /// A package atom could not be parsed.
    #[error("Invalid package atom '{atom}': {message}")]
    InvalidAtom {
        /// The offending atom.
        atom: String,
        /// Why it was rejected.
        message: String,
    },

    /// The merge list contains a blocker that is not resolved.
    #[error("Package '{blocked}' is blocked by '{atom}'")]
    BlockerConflict {
        /// The blocker atom.
        atom: String,
        /// The package the blocker applies to.
        blocked: String,
    },

    /// The document could not be parsed.
    #[error("Failed to parse graph document: {message}")]
    Parse {
        /// Parse error message.
        message: String,
    },
}

/// Errors that can occur when regenerating a merge list from a resume list.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResolveError {
    /// Entries of the resume list no longer correspond to known packages.
    #[error("Unsatisfied resume dependencies: {}", entries.join(", "))]
    UnsatisfiedResumeDep {
        /// The entries that could not be satisfied.
        entries: Vec<String>,
    },

    /// There is nothing to resume.
    #[error("The resume list is empty")]
    EmptyResumeList,

    /// The underlying graph document is invalid.
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Errors that can occur during configuration loading and validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A required configuration field is missing.
    #[error("{field} is required (use --{field}, {env_var} env var, or config file)")]
    MissingRequired {
        /// Name of the missing field.
        field: String,
        /// Environment variable name for this field.
        env_var: String,
    },

    /// Failed to read the configuration file.
    #[error("Failed to read config file at {path}: {message}")]
    FileReadError {
        /// Path to the config file.
        path: PathBuf,
        /// Error message.
        message: String,
    },

    /// Failed to parse the configuration file.
    #[error("Failed to parse config file at {path}: {message}")]
    ParseError {
        /// Path to the config file.
        path: PathBuf,
        /// Parse error message.
        message: String,
    },

    /// An invalid value was provided for a configuration field.
    #[error("Invalid value for {field}: {message}")]
    InvalidValue {
        /// Name of the field with invalid value.
        field: String,
        /// Description of why the value is invalid.
        message: String,
    },
}

/// Invariant violations detected by the scheduler.
///
/// These abort the whole run. They always indicate a bug rather than a
/// package failure.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchedulingError {
    /// A task exit arrived for a task the scheduler does not know about.
    #[error("Received exit for unknown task {task_id} ({kind})")]
    UnknownTask {
        /// Identifier of the task.
        task_id: u64,
        /// Kind of exit that was received.
        kind: String,
    },

    /// A task reported an exit from a queue it was never started in.
    #[error("Task {task_id} is not running in the {queue} queue")]
    NotRunning {
        /// Identifier of the task.
        task_id: u64,
        /// Queue name.
        queue: String,
    },

    /// A config snapshot was returned to a pool that never handed it out.
    #[error("Config snapshot {snapshot} returned for root '{root}' was not allocated")]
    UnbalancedConfig {
        /// Snapshot identifier.
        snapshot: u64,
        /// Install root of the snapshot.
        root: String,
    },

    /// A task exited without handing back its build settings.
    #[error("Task {task_id} exited without its build settings")]
    MissingSettings {
        /// Identifier of the task.
        task_id: u64,
    },

    /// The event channel closed while the scheduler was still running.
    #[error("Scheduler event channel closed unexpectedly")]
    ChannelClosed,
}

/// Type alias for Results using PkgmergeError.
///
/// Note: This is not re-exported from the crate root to avoid shadowing `anyhow::Result`.
/// Use explicitly as `error::Result<T>` when needed.
pub type PkgmergeResult<T> = std::result::Result<T, PkgmergeError>;

//! Runner module for scheduler runs.
//!
//! This module provides the scheduler loop, the task runtime it drives and
//! the command-line runner that wires it to files on disk.
//!
//! # Architecture
//!
//! - `traits.rs` - Phases, the `PhaseExecutor` trait and scheduler options
//! - `task.rs` - Task ids, scheduler events, exit guards and cancellation
//! - `queue.rs` - Named task queues and their slot limits
//! - `phases.rs` - Prefetch, build and merge task futures
//! - `scheduler.rs` - The scheduler loop
//! - `executor.rs` - Phase executor running configured shell commands
//! - `cli.rs` - CLI runner for the `run`, `resume`, `status` and `discard` commands

pub mod cli;
pub mod executor;
pub mod phases;
pub mod queue;
pub mod scheduler;
pub mod task;
pub mod traits;

pub use cli::{CliRunner, CommandResult};
pub use executor::CommandExecutor;
pub use scheduler::{Scheduler, SchedulerCollaborators, SchedulerHandle};
pub use task::{CancelToken, RETURNCODE_CANCELLED};
pub use traits::{
    DEFAULT_BUILD_DIR, DEFAULT_DISPLAY_LATENCY, DEFAULT_LOADAVG_LATENCY, Phase, PhaseExecutor,
    PhaseOutcome, PhasesConfig, SchedulerOptions,
};

// Re-export OutputFormat from models for convenience
pub use crate::models::OutputFormat;

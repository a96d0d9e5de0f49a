//! Core scheduling engine.
//!
//! This module provides everything below the command line layer:
//!
//! - Resume state persistence and the per-root lock
//! - Exit codes for CLI operations
//! - Scheduling operations (selection, admission, system package gate)
//! - The scheduler loop and the task runtime
//! - Output formatting for different display modes

pub mod operations;
pub mod output;
pub mod runner;
pub mod state;

/// Exit codes for pkgmerge runs.
///
/// A run stopped by a signal exits with 128 plus the signal number, like a
/// shell reports a killed child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// All operations completed successfully.
    Success,

    /// At least one package failed, or an internal error occurred.
    Failure,

    /// No resume list was found for the target root.
    NoResumeState,

    /// Another run holds the lock for the target root.
    Locked,

    /// Terminated by the given signal.
    Signal(i32),
}

impl ExitCode {
    /// Returns the numeric exit code value.
    pub fn code(self) -> u8 {
        match self {
            ExitCode::Success => 0,
            ExitCode::Failure => 1,
            ExitCode::NoResumeState => 4,
            ExitCode::Locked => 7,
            ExitCode::Signal(signal) => u8::try_from(128 + signal.clamp(0, 127)).unwrap_or(u8::MAX),
        }
    }

    /// Returns a human-readable description of the exit code.
    pub fn description(self) -> &'static str {
        match self {
            ExitCode::Success => "All operations completed successfully",
            ExitCode::Failure => "One or more packages failed",
            ExitCode::NoResumeState => "No resume list found for this root",
            ExitCode::Locked => "Another pkgmerge run is in progress",
            ExitCode::Signal(_) => "Terminated by a signal",
        }
    }
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        std::process::ExitCode::from(code.code())
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

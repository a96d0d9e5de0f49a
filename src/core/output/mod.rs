//! Output system for scheduler runs.
//!
//! This module provides structured output events and formatters for different
//! output formats (text, JSON, NDJSON), plus the periodic job status line.

mod events;
mod format;
mod status;

pub use events::{
    FailureInfo, JobKind, JobStatusInfo, ProgressEvent, ResumeStatus, RunResult, RunSummary,
};
pub use format::{OutputFormatter, OutputWriter, format_job_status};
pub use status::JobStatusDisplay;

//! Resume state persistence.
//!
//! This module keeps the resume list of an interrupted run on disk so that
//! `pkgmerge resume` can continue where it stopped.
//!
//! # State File Location
//!
//! State files are stored per target root using a hash of the root path:
//!
//! ```text
//! Default: ~/.local/state/pkgmerge/resume-{hash}.json
//! Override: $PKGMERGE_STATE_DIR/resume-{hash}.json
//! ```
//!
//! Where `{hash}` is the first 16 characters of SHA-256 of the canonical root path.

mod file;
mod resume;

pub use file::{
    LockGuard, SCHEMA_VERSION, STATE_DIR_ENV, compute_root_hash, lock_path_for_root, read_json,
    remove_state_file, resume_path_for_root, state_dir, write_json_atomic,
};
pub use resume::{
    CommitLog, FileResumeStore, MemoryResumeStore, ResumeEntry, ResumeState, ResumeStore,
    SavedOptions,
};

//! State file locations, atomic writes and the run lock.
//!
//! Every target root gets its own resume file and lock file inside the
//! state directory, named after a short hash of the root path:
//!
//! ```text
//! Default: ~/.local/state/pkgmerge/resume-{hash}.json
//! Override: $PKGMERGE_STATE_DIR/resume-{hash}.json
//! ```

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Current schema version for state files.
/// Increment when making breaking changes to the state file format.
pub const SCHEMA_VERSION: u32 = 1;

/// Environment variable to override the state directory.
pub const STATE_DIR_ENV: &str = "PKGMERGE_STATE_DIR";

/// Returns the directory holding resume and lock files.
///
/// Uses `$PKGMERGE_STATE_DIR` when set, otherwise the platform state
/// directory.
pub fn state_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(STATE_DIR_ENV) {
        return Ok(PathBuf::from(dir));
    }

    let state_home = if cfg!(target_os = "macos") {
        dirs::data_local_dir().map(|p| p.join("pkgmerge"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir().map(|p| p.join("pkgmerge").join("state"))
    } else {
        dirs::state_dir().map(|p| p.join("pkgmerge")).or_else(|| {
            dirs::home_dir().map(|p| p.join(".local").join("state").join("pkgmerge"))
        })
    };

    state_home.context("Could not determine state directory")
}

/// Hashes a target root into the 16 hex digit key used in file names.
///
/// Existing roots are canonicalized first so that `/mnt/x` and
/// `/mnt/x/` share one resume file.
pub fn compute_root_hash(target_root: &Path) -> String {
    let canonical = target_root
        .canonicalize()
        .unwrap_or_else(|_| target_root.to_path_buf());

    let path_str = canonical.to_string_lossy();
    let mut hasher = Sha256::new();
    hasher.update(path_str.as_bytes());
    let result = hasher.finalize();

    hex::encode(&result[..8])
}

/// Path of the resume file for `target_root`.
pub fn resume_path_for_root(target_root: &Path) -> Result<PathBuf> {
    let hash = compute_root_hash(target_root);
    Ok(state_dir()?.join(format!("resume-{}.json", hash)))
}

/// Path of the lock file for `target_root`.
pub fn lock_path_for_root(target_root: &Path) -> Result<PathBuf> {
    let hash = compute_root_hash(target_root);
    Ok(state_dir()?.join(format!("resume-{}.lock", hash)))
}

/// Reads and deserializes a JSON file.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read state file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse state file: {}", path.display()))
}

/// Writes `value` as pretty JSON through a synced temp file and a rename.
///
/// A crash at any point leaves either the old or the new content on disk.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create state directory: {}", parent.display()))?;
    }

    let temp_path = path.with_extension("json.tmp");
    let content = serde_json::to_string_pretty(value).context("Failed to serialize state file")?;

    let mut file = fs::File::create(&temp_path)
        .with_context(|| format!("Failed to create temp file: {}", temp_path.display()))?;
    file.write_all(content.as_bytes())
        .with_context(|| format!("Failed to write temp file: {}", temp_path.display()))?;
    file.sync_all()
        .with_context(|| format!("Failed to sync temp file: {}", temp_path.display()))?;

    fs::rename(&temp_path, path)
        .with_context(|| format!("Failed to rename temp file to: {}", path.display()))?;

    Ok(())
}

/// Removes a state file, treating a missing file as success.
pub fn remove_state_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove state file: {}", path.display())),
    }
}

/// Exclusive run lock for one target root.
///
/// The lock file holds the owner's PID. A lock whose owner is no longer
/// alive is considered stale and taken over. The file is removed on drop.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    /// Checks whether a live process holds the lock for `target_root`.
    pub fn is_locked(target_root: &Path) -> Result<bool> {
        let lock_path = lock_path_for_root(target_root)?;

        if !lock_path.exists() {
            return Ok(false);
        }

        if let Ok(content) = fs::read_to_string(&lock_path)
            && let Ok(pid) = content.trim().parse::<u32>()
            && is_process_alive(pid)
        {
            return Ok(true);
        }

        Ok(false)
    }

    /// Acquires the lock, returning `None` when another live process holds it.
    pub fn acquire(target_root: &Path) -> Result<Option<Self>> {
        let lock_path = lock_path_for_root(target_root)?;

        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create lock directory: {}", parent.display())
            })?;
        }

        if lock_path.exists() {
            if let Ok(content) = fs::read_to_string(&lock_path)
                && let Ok(pid) = content.trim().parse::<u32>()
                && is_process_alive(pid)
            {
                return Ok(None);
            }
            let _ = fs::remove_file(&lock_path);
        }

        let pid = std::process::id();
        fs::write(&lock_path, pid.to_string())
            .with_context(|| format!("Failed to create lock file: {}", lock_path.display()))?;

        // Another process may have raced us between the check and the write.
        if let Ok(content) = fs::read_to_string(&lock_path)
            && content.trim() == pid.to_string()
        {
            return Ok(Some(LockGuard { path: lock_path }));
        }

        Ok(None)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(unix)]
fn is_process_alive(pid: u32) -> bool {
    // SAFETY: signal 0 only checks process existence, no signal is actually delivered; pid cast is safe for valid PIDs
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(windows)]
fn is_process_alive(pid: u32) -> bool {
    use std::ptr;
    use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};
    use windows_sys::Win32::System::Threading::{OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION};

    // SAFETY: OpenProcess returns null on failure (process doesn't exist); handle is closed immediately after check
    unsafe {
        let handle: HANDLE = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if handle == ptr::null_mut() {
            false
        } else {
            CloseHandle(handle);
            true
        }
    }
}

#[cfg(not(any(unix, windows)))]
fn is_process_alive(_pid: u32) -> bool {
    true
}

mod hex {
    pub fn encode(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

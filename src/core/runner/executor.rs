//! Phase executor running shell commands.
//!
//! Each phase maps to zero or more commands from the `[phases]` table. They
//! run through `sh -c` with the task's build environment plus
//! `PKGMERGE_PHASE`, and their output is appended to the package build log.
//! A phase without commands succeeds immediately.

use std::path::Path;
use std::process::{ExitStatus, Stdio};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::task::{CancelToken, RETURNCODE_CANCELLED};
use super::traits::{Phase, PhaseExecutor, PhaseOutcome, PhasesConfig};
use crate::core::operations::BuildSettings;
use crate::package::Package;

/// Where command output is echoed besides the log.
#[derive(Debug, Clone, Copy)]
enum Echo {
    None,
    Stdout,
    Stderr,
}

/// Runs configured phase commands as child processes.
#[derive(Debug, Clone, Default)]
pub struct CommandExecutor {
    phases: PhasesConfig,
}

impl CommandExecutor {
    pub fn new(phases: PhasesConfig) -> Self {
        Self { phases }
    }

    async fn run_command(
        &self,
        pkg: &Package,
        phase: Phase,
        command: &str,
        settings: &BuildSettings,
        cancel: &mut CancelToken,
    ) -> Result<PhaseOutcome> {
        if cancel.is_cancelled() {
            return Ok(PhaseOutcome {
                returncode: RETURNCODE_CANCELLED,
            });
        }
        debug!("Running {} phase of {}: {}", phase, pkg.cpv(), command);

        let out_log = open_log(settings.log_file()).await?;
        let err_log = open_log(settings.log_file()).await?;
        let (out_echo, err_echo) = if settings.background {
            (Echo::None, Echo::None)
        } else {
            (Echo::Stdout, Echo::Stderr)
        };

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .envs(settings.env())
            .env("PKGMERGE_PHASE", phase.config_key())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so cancelling reaches everything the command spawned.
        #[cfg(unix)]
        cmd.process_group(0);
        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {} phase for {}", phase, pkg.cpv()))?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let status = tokio::select! {
            status = async {
                let (out, err) = tokio::join!(
                    pump(stdout, out_log, out_echo),
                    pump(stderr, err_log, err_echo)
                );
                if let Err(e) = out.and(err) {
                    warn!("Failed to record output of {}: {}", pkg.cpv(), e);
                }
                child.wait().await
            } => Some(status),
            _ = cancel.cancelled() => None,
        };

        match status {
            Some(status) => {
                let status = status
                    .with_context(|| format!("Failed to wait for {} phase of {}", phase, pkg.cpv()))?;
                Ok(PhaseOutcome {
                    returncode: exit_code(status),
                })
            }
            None => {
                debug!("Killing {} phase of {}", phase, pkg.cpv());
                kill_process_group(&child);
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill {} phase of {}: {}", phase, pkg.cpv(), e);
                }
                Ok(PhaseOutcome {
                    returncode: RETURNCODE_CANCELLED,
                })
            }
        }
    }
}

#[async_trait]
impl PhaseExecutor for CommandExecutor {
    async fn run_phase(
        &self,
        pkg: &Package,
        phase: Phase,
        settings: &BuildSettings,
        cancel: &mut CancelToken,
    ) -> Result<PhaseOutcome> {
        for command in self.phases.commands_for(phase) {
            let outcome = self
                .run_command(pkg, phase, command, settings, cancel)
                .await?;
            if !outcome.is_success() {
                return Ok(outcome);
            }
        }
        Ok(PhaseOutcome::SUCCESS)
    }
}

async fn open_log(path: Option<&Path>) -> Result<Option<File>> {
    let Some(path) = path else {
        return Ok(None);
    };
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create log directory: {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("Failed to open build log: {}", path.display()))?;
    Ok(Some(file))
}

/// Copies command output into the log and the echo target.
///
/// A failed write disables that destination but reading goes on until the
/// pipe closes, so the child never blocks on a full pipe. The first write
/// error is returned at the end.
async fn pump<R>(reader: Option<R>, mut log: Option<File>, mut echo: Echo) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return Ok(());
    };
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    let mut first_error = None;
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            break;
        }
        if let Some(file) = log.as_mut()
            && let Err(e) = file.write_all(&line).await
        {
            log = None;
            first_error.get_or_insert(e);
        }
        let echoed = match echo {
            Echo::None => Ok(()),
            Echo::Stdout => tokio::io::stdout().write_all(&line).await,
            Echo::Stderr => tokio::io::stderr().write_all(&line).await,
        };
        if let Err(e) = echoed {
            echo = Echo::None;
            first_error.get_or_insert(e);
        }
    }
    if let Some(file) = log.as_mut()
        && let Err(e) = file.flush().await
    {
        first_error.get_or_insert(e);
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(unix)]
fn kill_process_group(child: &Child) {
    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    // SAFETY: kill(2) with a negative pid signals the group the child leads; no memory is shared
    unsafe {
        libc::kill(-pid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &Child) {}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(1)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::operations::ConfigPool;
    use crate::core::runner::task::cancel_pair;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tempfile::TempDir;

    fn setup(temp_dir: &TempDir) -> (Package, ConfigPool, BuildSettings) {
        let pkg = Package::builder("app-misc/hello-2.12").build().unwrap();
        let mut pool = ConfigPool::new(BTreeMap::new());
        let mut settings = pool.allocate("/");
        settings.setcpv(&pkg, temp_dir.path());
        settings.background = true;
        (pkg, pool, settings)
    }

    /// # Output Logged
    ///
    /// Verifies that command output and environment reach the build log.
    ///
    /// ## Test Scenario
    /// - A compile command echoing the phase and cpv, then exiting 3
    ///
    /// ## Expected Outcome
    /// - Return code 3, the log holds both lines
    #[tokio::test]
    async fn test_output_logged() {
        let temp_dir = TempDir::new().unwrap();
        let (pkg, _pool, settings) = setup(&temp_dir);
        let executor = CommandExecutor::new(PhasesConfig::new().with(
            Phase::Compile,
            vec![
                "echo \"$PKGMERGE_PHASE $PKGMERGE_CPV\"".to_string(),
                "echo oops >&2; exit 3".to_string(),
                "echo never".to_string(),
            ],
        ));
        let (_handle, mut token) = cancel_pair();

        let outcome = executor
            .run_phase(&pkg, Phase::Compile, &settings, &mut token)
            .await
            .unwrap();

        assert_eq!(outcome.returncode, 3);
        let log = std::fs::read_to_string(settings.log_file().unwrap()).unwrap();
        assert!(log.contains("compile app-misc/hello-2.12"));
        assert!(log.contains("oops"));
        assert!(!log.contains("never"));
    }

    /// # Missing Commands
    ///
    /// Verifies that an unconfigured phase is a successful no-op.
    ///
    /// ## Test Scenario
    /// - Runs the fetch phase with an empty table
    ///
    /// ## Expected Outcome
    /// - Success and no log file created
    #[tokio::test]
    async fn test_missing_commands() {
        let temp_dir = TempDir::new().unwrap();
        let (pkg, _pool, settings) = setup(&temp_dir);
        let executor = CommandExecutor::default();
        let (_handle, mut token) = cancel_pair();

        let outcome = executor
            .run_phase(&pkg, Phase::Fetch, &settings, &mut token)
            .await
            .unwrap();
        assert!(outcome.is_success());
        assert!(!settings.log_file().unwrap().exists());
    }

    /// # Cancellation Kills Child
    ///
    /// Verifies that cancelling a phase terminates the command.
    ///
    /// ## Test Scenario
    /// - A long sleep is cancelled shortly after it starts
    ///
    /// ## Expected Outcome
    /// - The phase returns the cancelled return code quickly
    #[tokio::test]
    async fn test_cancellation_kills_child() {
        let temp_dir = TempDir::new().unwrap();
        let (pkg, _pool, settings) = setup(&temp_dir);
        let executor =
            CommandExecutor::new(PhasesConfig::new().with(Phase::Compile, vec!["sleep 30".into()]));
        let (handle, mut token) = cancel_pair();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            handle.cancel();
        });
        let outcome = tokio::time::timeout(
            Duration::from_secs(10),
            executor.run_phase(&pkg, Phase::Compile, &settings, &mut token),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(outcome.returncode, RETURNCODE_CANCELLED);
    }

    /// # Cancellation Reaches Grandchildren
    ///
    /// Verifies that cancelling kills processes the command spawned.
    ///
    /// ## Test Scenario
    /// - The command backgrounds a sleep, records its pid, then waits
    /// - The phase is cancelled once the pid is written
    ///
    /// ## Expected Outcome
    /// - The background sleep is gone shortly after cancellation
    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_cancellation_kills_process_group() {
        let temp_dir = TempDir::new().unwrap();
        let (pkg, _pool, settings) = setup(&temp_dir);
        let pid_file = temp_dir.path().join("sleeper.pid");
        let executor = CommandExecutor::new(PhasesConfig::new().with(
            Phase::Compile,
            vec![format!("sleep 30 & echo $! > '{}'; wait", pid_file.display())],
        ));
        let (handle, mut token) = cancel_pair();

        let watched = pid_file.clone();
        tokio::spawn(async move {
            while std::fs::read_to_string(&watched).map_or(true, |s| s.trim().is_empty()) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            handle.cancel();
        });
        let outcome = tokio::time::timeout(
            Duration::from_secs(10),
            executor.run_phase(&pkg, Phase::Compile, &settings, &mut token),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(outcome.returncode, RETURNCODE_CANCELLED);

        let pid: u32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
        let stat = format!("/proc/{pid}/stat");
        let mut alive = true;
        for _ in 0..100 {
            alive = std::fs::read_to_string(&stat)
                .map(|s| !s.split_whitespace().nth(2).is_some_and(|state| state == "Z"))
                .unwrap_or(false);
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!alive, "background sleep {pid} survived cancellation");
    }

    /// # Output Drained After Log Failure
    ///
    /// Verifies that a failing log keeps the pipe being read to the end.
    ///
    /// ## Test Scenario
    /// - The log handle is opened read-only so every write fails
    /// - Output much larger than the read buffer is pumped through it
    ///
    /// ## Expected Outcome
    /// - The whole input is consumed and the write error is returned
    #[tokio::test]
    async fn test_pump_drains_after_write_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("build.log");
        std::fs::write(&path, "").unwrap();
        let log = File::open(&path).await.unwrap();
        let data = "a line of build output\n".repeat(4096).into_bytes();
        let mut input: &[u8] = &data;

        let result = pump(Some(&mut input), Some(log), Echo::None).await;

        assert!(result.is_err());
        assert!(input.is_empty());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }
}

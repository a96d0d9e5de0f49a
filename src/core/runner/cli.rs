//! Command-line runner.
//!
//! Wires the file-backed collaborators (graph document, resume list, world
//! file, system load average, phase commands) into a [`Scheduler`] and maps
//! the outcome of each subcommand to an [`ExitCode`].

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::executor::CommandExecutor;
use super::scheduler::{Scheduler, SchedulerCollaborators, SchedulerHandle};
use crate::config::{ConfigLayers, RunConfig};
use crate::core::ExitCode;
use crate::core::operations::{FileWorldSet, SystemLoadAverage};
use crate::core::output::{
    OutputFormatter, OutputWriter, ProgressEvent, ResumeStatus, RunResult, RunSummary,
};
use crate::core::state::{
    FileResumeStore, LockGuard, ResumeState, ResumeStore, remove_state_file, resume_path_for_root,
};
use crate::models::OutputFormat;
use crate::resolver::{GraphConfig, Resolver, StaticResolver};

/// Outcome of one subcommand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub exit_code: ExitCode,
    pub message: Option<String>,
}

impl CommandResult {
    pub fn success() -> Self {
        Self {
            exit_code: ExitCode::Success,
            message: None,
        }
    }

    pub fn success_with_message(message: impl Into<String>) -> Self {
        Self {
            exit_code: ExitCode::Success,
            message: Some(message.into()),
        }
    }

    pub fn error(exit_code: ExitCode, message: impl Into<String>) -> Self {
        Self {
            exit_code,
            message: Some(message.into()),
        }
    }

    /// Maps a finished run to its exit status.
    pub fn from_summary(summary: &RunSummary) -> Self {
        let exit_code = match summary.result {
            RunResult::Success => ExitCode::Success,
            RunResult::Failed => ExitCode::Failure,
            RunResult::Interrupted => ExitCode::Signal(summary.exit_code - 128),
        };
        Self {
            exit_code,
            message: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == ExitCode::Success
    }
}

/// Runs the `run`, `resume`, `status` and `discard` subcommands.
pub struct CliRunner<W: Write = io::Stdout> {
    writer: W,
    format: OutputFormat,
    quiet: bool,
    forward_signals: bool,
}

impl CliRunner<io::Stdout> {
    /// Creates a runner writing to stdout that forwards process signals to
    /// the scheduler.
    pub fn new(format: OutputFormat, quiet: bool) -> Self {
        Self {
            writer: io::stdout(),
            format,
            quiet,
            forward_signals: true,
        }
    }
}

impl<W: Write> CliRunner<W> {
    /// Creates a runner with a custom writer. Signals are not forwarded.
    pub fn with_writer(writer: W, format: OutputFormat, quiet: bool) -> Self {
        Self {
            writer,
            format,
            quiet,
            forward_signals: false,
        }
    }

    /// Starts a fresh run over the graph document at `graph`.
    pub async fn run(&mut self, graph: &Path, layers: &ConfigLayers) -> CommandResult {
        let run = match layers.merged(None).resolve() {
            Ok(run) => run,
            Err(e) => return self.fail(ExitCode::Failure, format!("Invalid configuration: {}", e)),
        };
        let target_root = PathBuf::from(&run.options.target_root);

        let _lock = match LockGuard::acquire(&target_root) {
            Ok(Some(lock)) => lock,
            Ok(None) => return self.locked(&target_root),
            Err(e) => return self.fail(ExitCode::Failure, format!("{:#}", e)),
        };

        let resolver = match StaticResolver::from_path(graph) {
            Ok(resolver) => Arc::new(resolver),
            Err(e) => return self.fail(ExitCode::Failure, format!("{:#}", e)),
        };
        let graph_config = match resolver.graph_config() {
            Ok(config) => config,
            Err(e) => return self.fail(ExitCode::Failure, format!("Unable to resolve graph: {}", e)),
        };

        let resume = match self.open_resume_store(&target_root, true) {
            Ok(store) => store,
            Err(e) => return self.fail(ExitCode::Failure, format!("{:#}", e)),
        };

        let graph_path = absolute(graph);
        self.execute(run, graph_config, resolver, resume, graph_path)
            .await
    }

    /// Continues the saved run of the selected target root.
    ///
    /// Saved options override the file and environment, the command line
    /// overrides them. The graph defaults to the one the run was started with.
    pub async fn resume(&mut self, graph: Option<&Path>, layers: &ConfigLayers) -> CommandResult {
        let target_root = PathBuf::from(layers.target_root());

        let _lock = match LockGuard::acquire(&target_root) {
            Ok(Some(lock)) => lock,
            Ok(None) => return self.locked(&target_root),
            Err(e) => return self.fail(ExitCode::Failure, format!("{:#}", e)),
        };

        let resume = match self.open_resume_store(&target_root, false) {
            Ok(store) => store,
            Err(e) => return self.fail(ExitCode::Failure, format!("{:#}", e)),
        };
        let Some(saved) = resume.get().cloned() else {
            return self.no_resume_list(&target_root);
        };

        let mut run = match layers.merged(Some(&saved.options)).resolve() {
            Ok(run) => run,
            Err(e) => return self.fail(ExitCode::Failure, format!("Invalid configuration: {}", e)),
        };
        run.options.resuming = true;

        let graph_path = graph.map(absolute).unwrap_or_else(|| saved.graph.clone());
        let resolver = match StaticResolver::from_path(&graph_path) {
            Ok(resolver) => Arc::new(resolver),
            Err(e) => return self.fail(ExitCode::Failure, format!("{:#}", e)),
        };
        let mut graph_config = match resolver.resume(&saved.mergelist) {
            Ok(config) => config,
            Err(e) => {
                return self.fail(
                    ExitCode::Failure,
                    format!("Unable to resume the merge list: {}", e),
                );
            }
        };
        graph_config.favorites = saved.favorites.clone();

        info!(
            "Resuming {} entries for {}",
            saved.mergelist.len(),
            target_root.display()
        );
        self.execute(run, graph_config, resolver, resume, graph_path)
            .await
    }

    /// Prints the saved resume list of `target_root`.
    pub fn status(&mut self, target_root: &str) -> CommandResult {
        let target_root = PathBuf::from(target_root);
        let state = match self.load_resume_state(&target_root) {
            Ok(Some(state)) => state,
            Ok(None) => return self.no_resume_list(&target_root),
            Err(e) => return self.fail(ExitCode::Failure, format!("{:#}", e)),
        };

        let mut output = OutputWriter::new(&mut self.writer, self.format, self.quiet);
        let written = output
            .write_resume_status(&ResumeStatus::from(&state))
            .and_then(|()| output.flush());
        if let Err(e) = written {
            eprintln!("Warning: Failed to write status: {}", e);
        }
        CommandResult::success()
    }

    /// Deletes the saved resume list of `target_root`.
    pub fn discard(&mut self, target_root: &str) -> CommandResult {
        let target_root = PathBuf::from(target_root);

        let _lock = match LockGuard::acquire(&target_root) {
            Ok(Some(lock)) => lock,
            Ok(None) => return self.locked(&target_root),
            Err(e) => return self.fail(ExitCode::Failure, format!("{:#}", e)),
        };

        let path = match resume_path_for_root(&target_root) {
            Ok(path) => path,
            Err(e) => return self.fail(ExitCode::Failure, format!("{:#}", e)),
        };
        if !path.exists() {
            return self.no_resume_list(&target_root);
        }
        if let Err(e) = remove_state_file(&path) {
            return self.fail(ExitCode::Failure, format!("{:#}", e));
        }

        info!("Discarded resume list {}", path.display());
        CommandResult::success_with_message(format!(
            "Discarded resume list for {}",
            target_root.display()
        ))
    }

    async fn execute(
        &mut self,
        run: RunConfig,
        graph_config: GraphConfig,
        resolver: Arc<StaticResolver>,
        resume: FileResumeStore,
        graph_path: PathBuf,
    ) -> CommandResult {
        let world = match FileWorldSet::load(&run.world_file) {
            Ok(world) => world,
            Err(e) => return self.fail(ExitCode::Failure, format!("{:#}", e)),
        };

        let format = self.format;
        let forward_signals = self.forward_signals;
        let collaborators = SchedulerCollaborators {
            resolver: resolver as Arc<dyn Resolver>,
            executor: Arc::new(CommandExecutor::new(run.phases)),
            load: Arc::new(SystemLoadAverage),
            resume: Box::new(resume),
            world: Box::new(world),
        };
        let quiet = run.options.quiet;
        let output = OutputWriter::new(&mut self.writer, format, quiet);
        let mut scheduler =
            Scheduler::new(run.options, graph_config, collaborators, graph_path, output);

        let forwarder = if forward_signals {
            match spawn_signal_forwarder(scheduler.handle()) {
                Ok(forwarder) => Some(forwarder),
                Err(e) => {
                    warn!("Unable to install signal handlers: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let result = scheduler.merge().await;
        if let Some(forwarder) = forwarder {
            forwarder.abort();
        }

        let output = scheduler.output_mut();
        match result {
            Ok(summary) => {
                let written = output.write_summary(&summary).and_then(|()| output.flush());
                if let Err(e) = written {
                    eprintln!("Warning: Failed to write summary: {}", e);
                }
                CommandResult::from_summary(&summary)
            }
            Err(e) => {
                let message = e.to_string();
                emit_error(output, &message, ExitCode::Failure);
                CommandResult::error(ExitCode::Failure, message)
            }
        }
    }

    /// Opens the resume store of `target_root`.
    ///
    /// A fresh run replaces an unreadable resume list instead of failing.
    fn open_resume_store(&self, target_root: &Path, fresh: bool) -> anyhow::Result<FileResumeStore> {
        let path = resume_path_for_root(target_root)?;
        match FileResumeStore::open(&path) {
            Ok(store) => Ok(store),
            Err(e) if fresh => {
                warn!("Replacing unreadable resume list {}: {:#}", path.display(), e);
                remove_state_file(&path)?;
                FileResumeStore::open(path)
            }
            Err(e) => Err(e),
        }
    }

    fn load_resume_state(&self, target_root: &Path) -> anyhow::Result<Option<ResumeState>> {
        let store = self.open_resume_store(target_root, false)?;
        Ok(store.get().cloned())
    }

    fn locked(&mut self, target_root: &Path) -> CommandResult {
        self.fail(
            ExitCode::Locked,
            format!(
                "Another pkgmerge instance is running for {}",
                target_root.display()
            ),
        )
    }

    fn no_resume_list(&mut self, target_root: &Path) -> CommandResult {
        self.fail(
            ExitCode::NoResumeState,
            format!("No resume list for {}", target_root.display()),
        )
    }

    /// Reports an error that ended the command before or outside a run.
    fn fail(&mut self, exit_code: ExitCode, message: String) -> CommandResult {
        let mut output = OutputWriter::new(&mut self.writer, self.format, self.quiet);
        emit_error(&mut output, &message, exit_code);
        CommandResult::error(exit_code, message)
    }
}

/// Writes an error event. JSON output is only printed with a summary, so a
/// failed summary carrying the error follows there.
fn emit_error<W: Write>(output: &mut OutputWriter<W>, message: &str, exit_code: ExitCode) {
    let event = ProgressEvent::Error {
        message: message.to_string(),
        code: Some(exit_code.description().to_string()),
    };
    let mut written = output.write_event(&event);
    if written.is_ok() && *output.format() == OutputFormat::Json {
        written = output.write_summary(&RunSummary {
            result: RunResult::Failed,
            merged: 0,
            failed: 0,
            exit_code: i32::from(exit_code.code()),
            failures: Vec::new(),
            list_failures: false,
        });
    }
    if let Err(e) = written.and_then(|()| output.flush()) {
        eprintln!("Warning: Failed to write error: {}", e);
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Forwards SIGINT, SIGTERM and SIGCONT to the scheduler until it is gone.
#[cfg(unix)]
fn spawn_signal_forwarder(handle: SchedulerHandle) -> io::Result<JoinHandle<()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigcont = signal(SignalKind::from_raw(libc::SIGCONT))?;

    Ok(tokio::spawn(async move {
        loop {
            let delivered = tokio::select! {
                Some(()) = sigint.recv() => handle.terminate(libc::SIGINT),
                Some(()) = sigterm.recv() => handle.terminate(libc::SIGTERM),
                Some(()) = sigcont.recv() => handle.sigcont(),
                else => break,
            };
            if !delivered {
                break;
            }
        }
    }))
}

#[cfg(not(unix))]
fn spawn_signal_forwarder(handle: SchedulerHandle) -> io::Result<JoinHandle<()>> {
    Ok(tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.terminate(libc::SIGINT);
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::core::state::{ResumeEntry, SavedOptions, write_json_atomic};
    use crate::package::{Operation, PackageType};
    use crate::parsed_property::ParsedProperty;
    use serial_test::file_serial;
    use std::env;
    use std::fs;
    use tempfile::TempDir;

    const GRAPH: &str = r#"{
        "packages": [
            {"cpv": "dev-libs/a-1"},
            {"cpv": "dev-libs/b-1"},
            {"cpv": "app-misc/c-2"}
        ],
        "edges": [
            {"parent": "app-misc/c-2", "child": "dev-libs/b-1"}
        ],
        "favorites": ["app-misc/c"]
    }"#;

    struct Fixture {
        dir: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            unsafe {
                env::set_var("PKGMERGE_STATE_DIR", dir.path().join("state"));
            }
            fs::write(dir.path().join("graph.json"), GRAPH).unwrap();
            Self { dir }
        }

        fn graph(&self) -> PathBuf {
            self.dir.path().join("graph.json")
        }

        fn world_file(&self) -> PathBuf {
            self.dir.path().join("world")
        }

        fn layers(&self) -> ConfigLayers {
            let world = self.world_file();
            ConfigLayers {
                cli: Config {
                    jobs: Some(ParsedProperty::Cli(2, "--jobs 2".to_string())),
                    world_file: Some(ParsedProperty::Cli(
                        world.clone(),
                        world.display().to_string(),
                    )),
                    build_dir: Some(ParsedProperty::Cli(
                        self.dir.path().join("build"),
                        "build".to_string(),
                    )),
                    ..Config::default()
                },
                ..ConfigLayers::default()
            }
        }

        fn save_resume_list(&self, cpvs: &[&str]) {
            let entries = cpvs
                .iter()
                .map(|cpv| ResumeEntry::new(PackageType::Ebuild, "/", *cpv, Operation::Merge))
                .collect();
            let state = ResumeState::new(
                &self.graph(),
                Path::new("/"),
                entries,
                SavedOptions {
                    keep_going: true,
                    ..SavedOptions::default()
                },
                vec!["app-misc/c".to_string()],
            );
            let path = resume_path_for_root(Path::new("/")).unwrap();
            write_json_atomic(&path, &state).unwrap();
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            unsafe {
                env::remove_var("PKGMERGE_STATE_DIR");
            }
        }
    }

    fn runner(buf: &mut Vec<u8>) -> CliRunner<&mut Vec<u8>> {
        CliRunner::with_writer(buf, OutputFormat::Ndjson, false)
    }

    /// # Fresh Run
    ///
    /// Runs a small graph end to end with no phase commands configured.
    ///
    /// ## Test Scenario
    /// - Three packages, c depends on b, c is a favorite
    ///
    /// ## Expected Outcome
    /// - The run succeeds with three merges
    /// - The favorite lands in the world file and no resume list is left
    #[tokio::test]
    #[file_serial(env_tests)]
    async fn test_run_merges_graph() {
        let fixture = Fixture::new();
        let mut buf = Vec::new();

        let result = runner(&mut buf).run(&fixture.graph(), &fixture.layers()).await;

        assert_eq!(result.exit_code, ExitCode::Success);
        let output = String::from_utf8(buf).unwrap();
        let summary: serde_json::Value =
            serde_json::from_str(output.lines().last().unwrap()).unwrap();
        assert_eq!(summary["result"], "success");
        assert_eq!(summary["merged"], 3);

        let world = fs::read_to_string(fixture.world_file()).unwrap();
        assert_eq!(world.trim(), "app-misc/c");
        assert!(!resume_path_for_root(Path::new("/")).unwrap().exists());
    }

    /// # Missing Graph Document
    ///
    /// Tests a run whose graph file does not exist.
    ///
    /// ## Test Scenario
    /// - Runs with a nonexistent graph path
    ///
    /// ## Expected Outcome
    /// - Exit code 1 and an error event on the output
    #[tokio::test]
    #[file_serial(env_tests)]
    async fn test_run_missing_graph() {
        let fixture = Fixture::new();
        let mut buf = Vec::new();

        let result = runner(&mut buf)
            .run(&fixture.dir.path().join("missing.json"), &fixture.layers())
            .await;

        assert_eq!(result.exit_code, ExitCode::Failure);
        let output = String::from_utf8(buf).unwrap();
        assert!(output.contains("\"event\":\"error\""));
    }

    /// # Resume Saved List
    ///
    /// Tests resuming a partially completed run.
    ///
    /// ## Test Scenario
    /// - A saved resume list holding only b and c
    ///
    /// ## Expected Outcome
    /// - Only the two remaining packages are merged
    /// - The resume list is gone afterwards
    #[tokio::test]
    #[file_serial(env_tests)]
    async fn test_resume_saved_list() {
        let fixture = Fixture::new();
        fixture.save_resume_list(&["dev-libs/b-1", "app-misc/c-2"]);
        let mut buf = Vec::new();

        let result = runner(&mut buf).resume(None, &fixture.layers()).await;

        assert_eq!(result.exit_code, ExitCode::Success);
        let output = String::from_utf8(buf).unwrap();
        assert!(output.contains("\"resuming\":true"));
        assert!(!output.contains("dev-libs/a-1"));
        let summary: serde_json::Value =
            serde_json::from_str(output.lines().last().unwrap()).unwrap();
        assert_eq!(summary["merged"], 2);
        assert!(!resume_path_for_root(Path::new("/")).unwrap().exists());
    }

    /// # Resume Without Saved List
    ///
    /// Tests resume, status and discard when nothing was saved.
    ///
    /// ## Test Scenario
    /// - An empty state directory
    ///
    /// ## Expected Outcome
    /// - Every command exits with the no-resume-state code
    #[tokio::test]
    #[file_serial(env_tests)]
    async fn test_no_resume_list() {
        let fixture = Fixture::new();
        let mut buf = Vec::new();
        let mut runner = runner(&mut buf);

        let resumed = runner.resume(None, &fixture.layers()).await;
        assert_eq!(resumed.exit_code, ExitCode::NoResumeState);
        assert_eq!(runner.status("/").exit_code, ExitCode::NoResumeState);
        assert_eq!(runner.discard("/").exit_code, ExitCode::NoResumeState);
    }

    /// # Status And Discard
    ///
    /// Tests printing and then deleting a saved resume list.
    ///
    /// ## Test Scenario
    /// - Saves a two-entry list, runs status in text mode, then discard
    ///
    /// ## Expected Outcome
    /// - Status lists the entries and the keep-going option
    /// - Discard removes the file
    #[test]
    #[file_serial(env_tests)]
    fn test_status_and_discard() {
        let fixture = Fixture::new();
        fixture.save_resume_list(&["dev-libs/b-1", "app-misc/c-2"]);
        let mut buf = Vec::new();
        let mut runner = CliRunner::with_writer(&mut buf, OutputFormat::Text, false);

        assert!(runner.status("/").is_success());
        let discarded = runner.discard("/");
        assert!(discarded.is_success());
        assert_eq!(
            discarded.message.as_deref(),
            Some("Discarded resume list for /")
        );

        let output = String::from_utf8(buf).unwrap();
        assert!(output.contains("Resume list for / (2 entries)"));
        assert!(output.contains("  Options: --keep-going"));
        assert!(output.contains("[ebuild / app-misc/c-2 merge]"));
        assert!(!resume_path_for_root(Path::new("/")).unwrap().exists());
    }

    /// # Locked Root
    ///
    /// Tests that a second instance on the same root is refused.
    ///
    /// ## Test Scenario
    /// - Holds the lock for `/`, then starts a run
    ///
    /// ## Expected Outcome
    /// - Exit code 7 without touching the graph
    #[tokio::test]
    #[file_serial(env_tests)]
    async fn test_locked_root() {
        let fixture = Fixture::new();
        let _lock = LockGuard::acquire(Path::new("/")).unwrap().unwrap();
        let mut buf = Vec::new();

        let result = runner(&mut buf).run(&fixture.graph(), &fixture.layers()).await;

        assert_eq!(result.exit_code, ExitCode::Locked);
    }

    /// # Exit Codes From Summaries
    ///
    /// Verifies the mapping of run results to exit codes.
    ///
    /// ## Test Scenario
    /// - Failed and interrupted summaries
    ///
    /// ## Expected Outcome
    /// - Failure maps to 1, SIGINT to the signal code
    #[test]
    fn test_exit_code_from_summary() {
        let summary = |result, exit_code| RunSummary {
            result,
            merged: 0,
            failed: 0,
            exit_code,
            failures: Vec::new(),
            list_failures: false,
        };

        assert_eq!(
            CommandResult::from_summary(&summary(RunResult::Failed, 1)).exit_code,
            ExitCode::Failure
        );
        assert_eq!(
            CommandResult::from_summary(&summary(RunResult::Interrupted, 130)).exit_code,
            ExitCode::Signal(2)
        );
    }
}

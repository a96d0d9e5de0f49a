//! Command line model.
//!
//! Argument structs are plain clap derives. Turning them into configuration
//! layers happens here as well, so the rest of the crate only sees
//! [`Config`] values tagged as [`ParsedProperty::Cli`].

use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};

use crate::config::Config;
use crate::parsed_property::ParsedProperty;

/// Output format of progress events and summaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON summary at the end.
    Json,
    /// Newline-delimited JSON (one event per line).
    Ndjson,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Ndjson => write!(f, "ndjson"),
        }
    }
}

/// Scheduling options shared by `run` and `resume`.
///
/// Every option is optional so that unset flags fall through to the resume
/// list, the environment, the config file and the defaults.
#[derive(ClapArgs, Clone, Default, Debug)]
pub struct SchedulingArgs {
    /// Concurrent build jobs; without a value, unlimited
    #[arg(
        short,
        long,
        num_args = 0..=1,
        default_missing_value = "0",
        help_heading = "Scheduling"
    )]
    pub jobs: Option<usize>,

    /// Do not start new jobs while the load average is at or above this
    #[arg(short, long, value_name = "LOAD", help_heading = "Scheduling")]
    pub load_average: Option<f64>,

    /// Continue with unrelated packages after a failure
    #[arg(long, help_heading = "Scheduling")]
    pub keep_going: bool,

    /// Ignore dependencies and merge in list order
    #[arg(short = 'O', long, help_heading = "Scheduling")]
    pub nodeps: bool,

    /// Fetch files only; build and merge nothing
    #[arg(short, long, help_heading = "Scheduling")]
    pub fetch_only: bool,

    /// Create binary packages while merging
    #[arg(short, long, help_heading = "Scheduling")]
    pub buildpkg: bool,

    /// Create binary packages without merging
    #[arg(short = 'B', long, help_heading = "Scheduling")]
    pub buildpkg_only: bool,

    /// Do not record merged packages in the world file
    #[arg(short = '1', long, help_heading = "Scheduling")]
    pub oneshot: bool,

    /// Fetch upcoming packages in the background
    #[arg(long, help_heading = "Scheduling")]
    pub parallel_fetch: bool,

    /// Run merges concurrently up to the job limit
    #[arg(long, help_heading = "Scheduling")]
    pub parallel_install: bool,

    /// Do not serialize the setup phase in its own queue
    #[arg(long, help_heading = "Scheduling")]
    pub no_ebuild_locks: bool,

    /// Do not merge system packages ahead of their build time users
    #[arg(long, help_heading = "Scheduling")]
    pub no_implicit_system_deps: bool,

    /// Parent directory of package build directories
    #[arg(long, help_heading = "Paths")]
    pub build_dir: Option<PathBuf>,

    /// World favorites file
    #[arg(long, help_heading = "Paths")]
    pub world_file: Option<PathBuf>,
}

fn cli_flag(set: bool, flag: &str) -> Option<ParsedProperty<bool>> {
    set.then(|| ParsedProperty::Cli(true, flag.to_string()))
}

impl SchedulingArgs {
    /// The options given on the command line as a config layer.
    pub fn to_config(&self) -> Config {
        Config {
            jobs: self
                .jobs
                .map(|v| ParsedProperty::Cli(v, format!("--jobs {}", v))),
            load_average: self
                .load_average
                .map(|v| ParsedProperty::Cli(v, format!("--load-average {}", v))),
            keep_going: cli_flag(self.keep_going, "--keep-going"),
            nodeps: cli_flag(self.nodeps, "--nodeps"),
            fetch_only: cli_flag(self.fetch_only, "--fetch-only"),
            buildpkg: cli_flag(self.buildpkg, "--buildpkg"),
            buildpkg_only: cli_flag(self.buildpkg_only, "--buildpkg-only"),
            oneshot: cli_flag(self.oneshot, "--oneshot"),
            parallel_fetch: cli_flag(self.parallel_fetch, "--parallel-fetch"),
            parallel_install: cli_flag(self.parallel_install, "--parallel-install"),
            ebuild_locks: self
                .no_ebuild_locks
                .then(|| ParsedProperty::Cli(false, "--no-ebuild-locks".to_string())),
            implicit_system_deps: self
                .no_implicit_system_deps
                .then(|| ParsedProperty::Cli(false, "--no-implicit-system-deps".to_string())),
            build_dir: self.build_dir.as_ref().map(|v| {
                ParsedProperty::Cli(v.clone(), format!("--build-dir {}", v.display()))
            }),
            world_file: self.world_file.as_ref().map(|v| {
                ParsedProperty::Cli(v.clone(), format!("--world-file {}", v.display()))
            }),
            ..Config::default()
        }
    }
}

/// Arguments for `pkgmerge run`.
#[derive(ClapArgs, Clone, Debug)]
pub struct RunArgs {
    /// Dependency graph document produced by the resolver
    #[arg(short, long, value_name = "FILE")]
    pub graph: PathBuf,

    /// Root to merge into
    #[arg(long, value_name = "DIR", help_heading = "Paths")]
    pub root: Option<String>,

    #[command(flatten)]
    pub scheduling: SchedulingArgs,
}

/// Arguments for `pkgmerge resume`.
#[derive(ClapArgs, Clone, Debug)]
pub struct ResumeArgs {
    /// Graph document to resolve the saved list against; defaults to the
    /// document of the interrupted run
    #[arg(short, long, value_name = "FILE")]
    pub graph: Option<PathBuf>,

    /// Root of the interrupted run
    #[arg(long, value_name = "DIR", help_heading = "Paths")]
    pub root: Option<String>,

    #[command(flatten)]
    pub scheduling: SchedulingArgs,
}

/// Arguments for `pkgmerge status` and `pkgmerge discard`.
#[derive(ClapArgs, Clone, Debug, Default)]
pub struct RootArgs {
    /// Root of the saved run
    #[arg(long, value_name = "DIR")]
    pub root: Option<String>,
}

/// Available commands
#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Build and merge the packages of a graph document
    #[command(
        long_about = "Build and merge every package in the merge list of a graph document.\n\n\
            Packages are built in dependency order, up to --jobs at a time. The pending\n\
            part of the merge list is saved before anything runs, so an interrupted run\n\
            can be continued with `pkgmerge resume`.",
        after_help = "EXAMPLES:\n    \
            # Four parallel jobs, keep going after failures\n    \
            pkgmerge run --graph graph.json -j4 --keep-going\n\n    \
            # Only fetch sources\n    \
            pkgmerge run --graph graph.json --fetch-only"
    )]
    Run(RunArgs),

    /// Continue an interrupted run
    #[command(
        after_help = "EXAMPLES:\n    \
            # Continue with the saved options\n    \
            pkgmerge resume\n\n    \
            # Continue with more jobs\n    \
            pkgmerge resume -j8"
    )]
    Resume(ResumeArgs),

    /// Show the saved resume list
    Status(RootArgs),

    /// Delete the saved resume list
    Discard(RootArgs),
}

impl Commands {
    /// Target root named on the command line, if any.
    pub fn root(&self) -> Option<&str> {
        match self {
            Commands::Run(args) => args.root.as_deref(),
            Commands::Resume(args) => args.root.as_deref(),
            Commands::Status(args) | Commands::Discard(args) => args.root.as_deref(),
        }
    }
}

#[derive(Parser, Clone, Debug)]
#[command(
    name = "pkgmerge",
    author,
    version = crate::BUILD_VERSION,
    about = "Parallel build and merge scheduler for package installs",
    long_about = "Schedules the builds, binary package extractions and merges of a resolved\n\
        dependency graph, running independent jobs in parallel.\n\n\
        Configuration can be provided via CLI arguments, environment variables (PKGMERGE_*),\n\
        or a config file (~/.config/pkgmerge/config.toml).",
    after_help = "EXAMPLES:\n    \
        pkgmerge run --graph graph.json -j4\n    \
        pkgmerge status\n    \
        pkgmerge resume --keep-going\n    \
        pkgmerge --create-config"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Create a sample configuration file at ~/.config/pkgmerge/config.toml
    #[arg(long)]
    pub create_config: bool,

    /// Output format
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text, help_heading = "Output Options")]
    pub output: OutputFormat,

    /// Only show failures and the final summary
    #[arg(short, long, global = true, help_heading = "Output Options")]
    pub quiet: bool,

    /// Config file to use instead of the XDG location
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); logging is off by default
    #[arg(long, global = true, help_heading = "Logging")]
    pub log_level: Option<String>,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true, help_heading = "Logging")]
    pub log_file: Option<PathBuf>,

    /// Log format (text, json)
    #[arg(long, global = true, help_heading = "Logging")]
    pub log_format: Option<String>,
}

impl Args {
    /// Options of the global flags that are also config keys.
    pub fn global_config(&self) -> Config {
        Config {
            quiet: cli_flag(self.quiet, "--quiet"),
            target_root: self
                .command
                .as_ref()
                .and_then(Commands::root)
                .map(|root| ParsedProperty::Cli(root.to_string(), format!("--root {}", root))),
            ..Config::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    /// # CLI Definition
    ///
    /// Verifies that the clap definition is consistent.
    ///
    /// ## Test Scenario
    /// - Runs clap's debug assertions on the command
    ///
    /// ## Expected Outcome
    /// - No conflicting flags or malformed attributes
    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    /// # Run Arguments
    ///
    /// Verifies parsing of a typical run invocation.
    ///
    /// ## Test Scenario
    /// - Parses `run` with short flags, a bare `--jobs` and global flags after
    ///   the subcommand
    ///
    /// ## Expected Outcome
    /// - A bare `--jobs` means unlimited (0)
    /// - Flags become CLI-sourced config values
    #[test]
    fn test_run_arguments() {
        let args = Args::try_parse_from([
            "pkgmerge",
            "run",
            "--graph",
            "graph.json",
            "--keep-going",
            "-1",
            "--root",
            "/mnt/gentoo",
            "--output",
            "ndjson",
            "--jobs",
        ])
        .unwrap();

        assert_eq!(args.output, OutputFormat::Ndjson);
        let Some(Commands::Run(run)) = &args.command else {
            panic!("expected run command");
        };
        assert_eq!(run.graph, PathBuf::from("graph.json"));
        assert_eq!(run.scheduling.jobs, Some(0));

        let config = run.scheduling.to_config();
        assert_eq!(config.keep_going.as_ref().map(|p| p.source_name()), Some("cli"));
        assert_eq!(config.oneshot.as_deref(), Some(&true));
        assert_eq!(config.nodeps, None);

        let global = args.global_config();
        assert_eq!(global.target_root.as_deref().map(String::as_str), Some("/mnt/gentoo"));
        assert_eq!(global.quiet, None);
    }

    /// # Disabling Defaults
    ///
    /// Verifies the negative flags for options that default to on.
    ///
    /// ## Test Scenario
    /// - Parses `resume` with `--no-ebuild-locks` and `-j3`
    ///
    /// ## Expected Outcome
    /// - ebuild_locks is an explicit CLI false, jobs is 3
    #[test]
    fn test_disabling_defaults() {
        let args =
            Args::try_parse_from(["pkgmerge", "resume", "--no-ebuild-locks", "-j3"]).unwrap();
        let Some(Commands::Resume(resume)) = &args.command else {
            panic!("expected resume command");
        };
        assert!(resume.graph.is_none());

        let config = resume.scheduling.to_config();
        assert_eq!(config.ebuild_locks.as_deref(), Some(&false));
        assert_eq!(config.jobs.as_deref(), Some(&3));
        assert_eq!(config.implicit_system_deps, None);
    }

    /// # Missing Graph
    ///
    /// Verifies that `run` requires a graph document.
    ///
    /// ## Test Scenario
    /// - Parses `run` without `--graph`
    ///
    /// ## Expected Outcome
    /// - Parsing fails
    #[test]
    fn test_missing_graph() {
        assert!(Args::try_parse_from(["pkgmerge", "run", "-j2"]).is_err());
    }
}

//! Configuration management for pkgmerge.
//!
//! This module handles loading configuration from multiple sources:
//! - TOML configuration files following XDG Base Directory specification
//! - Environment variables (`PKGMERGE_*`)
//! - Options saved with an interrupted run's resume list
//!
//! Every value remembers where it came from as a [`ParsedProperty`].
//! Precedence is CLI > resume > environment > file > defaults.
//!
//! ## Example
//!
//! ```rust,no_run
//! use pkgmerge::Config;
//!
//! let file_config = Config::load_from_file(None).unwrap();
//! let env_config = Config::load_from_env();
//!
//! // Environment takes precedence over the file
//! let run = file_config.merge(env_config).resolve().unwrap();
//! println!("jobs: {}", run.options.max_jobs);
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::core::operations::{DEFAULT_JOB_DELAY_MAX, DEFAULT_SIGCONT_DELAY, MaxJobs};
use crate::core::runner::{
    DEFAULT_BUILD_DIR, DEFAULT_DISPLAY_LATENCY, DEFAULT_LOADAVG_LATENCY, PhasesConfig,
    SchedulerOptions,
};
use crate::core::state::SavedOptions;
use crate::error::ConfigError;
use crate::package::DEFAULT_ROOT;
use crate::parsed_property::ParsedProperty;

/// Location of the world file below the target root.
pub const WORLD_FILE_RELATIVE: &str = "var/lib/pkgmerge/world";

/// Temporary struct for deserializing TOML configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    jobs: Option<usize>,
    load_average: Option<f64>,
    keep_going: Option<bool>,
    nodeps: Option<bool>,
    fetch_only: Option<bool>,
    buildpkg: Option<bool>,
    buildpkg_only: Option<bool>,
    oneshot: Option<bool>,
    quiet: Option<bool>,
    parallel_fetch: Option<bool>,
    parallel_install: Option<bool>,
    ebuild_locks: Option<bool>,
    implicit_system_deps: Option<bool>,
    job_delay_max: Option<f64>,
    sigcont_delay: Option<f64>,
    loadavg_latency: Option<f64>,
    display_latency: Option<f64>,
    build_dir: Option<String>,
    world_file: Option<String>,
    target_root: Option<String>,
    phases: Option<PhasesConfig>,
}

/// Run configuration assembled from CLI arguments, resume state, environment
/// variables, config file, and defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    /// Concurrent build jobs; 0 means unlimited.
    pub jobs: Option<ParsedProperty<usize>>,
    /// Load average above which no new job starts.
    pub load_average: Option<ParsedProperty<f64>>,
    pub keep_going: Option<ParsedProperty<bool>>,
    pub nodeps: Option<ParsedProperty<bool>>,
    pub fetch_only: Option<ParsedProperty<bool>>,
    pub buildpkg: Option<ParsedProperty<bool>>,
    pub buildpkg_only: Option<ParsedProperty<bool>>,
    pub oneshot: Option<ParsedProperty<bool>>,
    pub quiet: Option<ParsedProperty<bool>>,
    pub parallel_fetch: Option<ParsedProperty<bool>>,
    pub parallel_install: Option<ParsedProperty<bool>>,
    pub ebuild_locks: Option<ParsedProperty<bool>>,
    pub implicit_system_deps: Option<ParsedProperty<bool>>,
    pub job_delay_max: Option<ParsedProperty<Duration>>,
    pub sigcont_delay: Option<ParsedProperty<Duration>>,
    pub loadavg_latency: Option<ParsedProperty<Duration>>,
    pub display_latency: Option<ParsedProperty<Duration>>,
    /// Parent directory of the per-package build directories.
    pub build_dir: Option<ParsedProperty<PathBuf>>,
    /// World file; defaults to a path below the target root.
    pub world_file: Option<ParsedProperty<PathBuf>>,
    pub target_root: Option<ParsedProperty<String>>,
    /// Phase commands; only configurable in the file.
    pub phases: Option<ParsedProperty<PhasesConfig>>,
}

/// Fully resolved settings of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub options: SchedulerOptions,
    pub world_file: PathBuf,
    pub phases: PhasesConfig,
}

/// The configuration layers of one invocation, kept apart so saved resume
/// options can be slotted in between the environment and the command line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigLayers {
    pub file: Config,
    pub env: Config,
    pub cli: Config,
}

impl ConfigLayers {
    /// Loads the file and environment layers around the given CLI layer.
    pub fn load(config_path: Option<&Path>, cli: Config) -> Result<Self> {
        Ok(Self {
            file: Config::load_from_file(config_path)?,
            env: Config::load_from_env(),
            cli,
        })
    }

    /// Merges the layers, with `saved` options taking precedence over
    /// everything but the command line.
    pub fn merged(&self, saved: Option<&SavedOptions>) -> Config {
        let base = self.file.clone().merge(self.env.clone());
        let base = match saved {
            Some(saved) => base.merge(Config::from_saved(saved)),
            None => base,
        };
        base.merge(self.cli.clone())
    }

    /// The target root these layers select.
    pub fn target_root(&self) -> String {
        self.merged(None)
            .target_root
            .map(|p| p.value().clone())
            .unwrap_or_else(|| DEFAULT_ROOT.to_string())
    }
}

fn file_prop<T: ToString>(value: T, path: &Path) -> ParsedProperty<T> {
    let original = value.to_string();
    ParsedProperty::File(value, path.to_path_buf(), original)
}

fn file_secs(secs: f64, path: &Path) -> Result<ParsedProperty<Duration>> {
    let value = seconds(secs).with_context(|| {
        format!("Invalid duration {} in config file: {}", secs, path.display())
    })?;
    Ok(ParsedProperty::File(value, path.to_path_buf(), secs.to_string()))
}

/// Converts a number of seconds into a duration.
pub fn seconds(secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs).map_err(|e| anyhow::anyhow!("{}: {}", secs, e))
}

/// Parses a boolean the way shells usually spell one.
pub fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parsed<T>(name: &str, parse: impl Fn(&str) -> Option<T>) -> Option<ParsedProperty<T>> {
    let raw = env_string(name)?;
    match parse(&raw) {
        Some(value) => Some(ParsedProperty::Env(value, raw)),
        None => {
            warn!("Ignoring invalid value of {}: {}", name, raw);
            None
        }
    }
}

fn env_bool(name: &str) -> Option<ParsedProperty<bool>> {
    env_parsed(name, parse_bool)
}

fn env_secs(name: &str) -> Option<ParsedProperty<Duration>> {
    env_parsed(name, |s| s.parse::<f64>().ok().and_then(|v| seconds(v).ok()))
}

fn resumed<T: ToString>(value: T) -> ParsedProperty<T> {
    let original = value.to_string();
    ParsedProperty::Resume(value, original)
}

impl Config {
    /// Built-in defaults, each marked as [`ParsedProperty::Default`].
    pub fn defaults() -> Self {
        Self {
            jobs: Some(ParsedProperty::Default(1)),
            load_average: None,
            keep_going: Some(ParsedProperty::Default(false)),
            nodeps: Some(ParsedProperty::Default(false)),
            fetch_only: Some(ParsedProperty::Default(false)),
            buildpkg: Some(ParsedProperty::Default(false)),
            buildpkg_only: Some(ParsedProperty::Default(false)),
            oneshot: Some(ParsedProperty::Default(false)),
            quiet: Some(ParsedProperty::Default(false)),
            parallel_fetch: Some(ParsedProperty::Default(false)),
            parallel_install: Some(ParsedProperty::Default(false)),
            ebuild_locks: Some(ParsedProperty::Default(true)),
            implicit_system_deps: Some(ParsedProperty::Default(true)),
            job_delay_max: Some(ParsedProperty::Default(DEFAULT_JOB_DELAY_MAX)),
            sigcont_delay: Some(ParsedProperty::Default(DEFAULT_SIGCONT_DELAY)),
            loadavg_latency: Some(ParsedProperty::Default(DEFAULT_LOADAVG_LATENCY)),
            display_latency: Some(ParsedProperty::Default(DEFAULT_DISPLAY_LATENCY)),
            build_dir: Some(ParsedProperty::Default(PathBuf::from(DEFAULT_BUILD_DIR))),
            world_file: None,
            target_root: Some(ParsedProperty::Default(DEFAULT_ROOT.to_string())),
            phases: Some(ParsedProperty::Default(PhasesConfig::default())),
        }
    }

    /// Load configuration from a file.
    ///
    /// With `path` unset the XDG location is used and a missing file yields
    /// an empty config. An explicitly given file must exist.
    #[must_use = "this returns the loaded configuration which should be used"]
    pub fn load_from_file(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigError::FileReadError {
                        path: path.to_path_buf(),
                        message: "file does not exist".to_string(),
                    }
                    .into());
                }
                path.to_path_buf()
            }
            None => {
                let path = Self::get_config_path()?;
                if !path.exists() {
                    debug!("No config file at {}", path.display());
                    return Ok(Self::default());
                }
                path
            }
        };

        let config_content =
            fs::read_to_string(&config_path).map_err(|e| ConfigError::FileReadError {
                path: config_path.clone(),
                message: e.to_string(),
            })?;
        Self::parse_file(&config_content, &config_path)
    }

    fn parse_file(content: &str, config_path: &Path) -> Result<Self> {
        let file: ConfigFile = toml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: config_path.to_path_buf(),
            message: e.to_string(),
        })?;
        let p = config_path;

        Ok(Self {
            jobs: file.jobs.map(|v| file_prop(v, p)),
            load_average: file.load_average.map(|v| file_prop(v, p)),
            keep_going: file.keep_going.map(|v| file_prop(v, p)),
            nodeps: file.nodeps.map(|v| file_prop(v, p)),
            fetch_only: file.fetch_only.map(|v| file_prop(v, p)),
            buildpkg: file.buildpkg.map(|v| file_prop(v, p)),
            buildpkg_only: file.buildpkg_only.map(|v| file_prop(v, p)),
            oneshot: file.oneshot.map(|v| file_prop(v, p)),
            quiet: file.quiet.map(|v| file_prop(v, p)),
            parallel_fetch: file.parallel_fetch.map(|v| file_prop(v, p)),
            parallel_install: file.parallel_install.map(|v| file_prop(v, p)),
            ebuild_locks: file.ebuild_locks.map(|v| file_prop(v, p)),
            implicit_system_deps: file.implicit_system_deps.map(|v| file_prop(v, p)),
            job_delay_max: file.job_delay_max.map(|v| file_secs(v, p)).transpose()?,
            sigcont_delay: file.sigcont_delay.map(|v| file_secs(v, p)).transpose()?,
            loadavg_latency: file.loadavg_latency.map(|v| file_secs(v, p)).transpose()?,
            display_latency: file.display_latency.map(|v| file_secs(v, p)).transpose()?,
            build_dir: file
                .build_dir
                .map(|v| ParsedProperty::File(PathBuf::from(&v), p.to_path_buf(), v)),
            world_file: file
                .world_file
                .map(|v| ParsedProperty::File(PathBuf::from(&v), p.to_path_buf(), v)),
            target_root: file.target_root.map(|v| file_prop(v, p)),
            phases: file.phases.map(|v| {
                let original = format!("{:?}", v);
                ParsedProperty::File(v, p.to_path_buf(), original)
            }),
        })
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Self {
        Self {
            jobs: env_parsed("PKGMERGE_JOBS", |s| s.parse().ok()),
            load_average: env_parsed("PKGMERGE_LOAD_AVERAGE", |s| s.parse().ok()),
            keep_going: env_bool("PKGMERGE_KEEP_GOING"),
            nodeps: env_bool("PKGMERGE_NODEPS"),
            fetch_only: env_bool("PKGMERGE_FETCH_ONLY"),
            buildpkg: env_bool("PKGMERGE_BUILDPKG"),
            buildpkg_only: env_bool("PKGMERGE_BUILDPKG_ONLY"),
            oneshot: env_bool("PKGMERGE_ONESHOT"),
            quiet: env_bool("PKGMERGE_QUIET"),
            parallel_fetch: env_bool("PKGMERGE_PARALLEL_FETCH"),
            parallel_install: env_bool("PKGMERGE_PARALLEL_INSTALL"),
            ebuild_locks: env_bool("PKGMERGE_EBUILD_LOCKS"),
            implicit_system_deps: env_bool("PKGMERGE_IMPLICIT_SYSTEM_DEPS"),
            job_delay_max: env_secs("PKGMERGE_JOB_DELAY_MAX"),
            sigcont_delay: env_secs("PKGMERGE_SIGCONT_DELAY"),
            loadavg_latency: env_secs("PKGMERGE_LOADAVG_LATENCY"),
            display_latency: env_secs("PKGMERGE_DISPLAY_LATENCY"),
            // PKGMERGE_BUILD_DIR is the per-package directory handed to phases.
            build_dir: env_string("PKGMERGE_TMPDIR")
                .map(|v| ParsedProperty::Env(PathBuf::from(&v), v)),
            world_file: env_string("PKGMERGE_WORLD_FILE")
                .map(|v| ParsedProperty::Env(PathBuf::from(&v), v)),
            target_root: env_string("PKGMERGE_TARGET_ROOT")
                .map(|v| ParsedProperty::Env(v.clone(), v)),
            phases: None,
        }
    }

    /// Options restored from a saved resume list.
    pub fn from_saved(saved: &SavedOptions) -> Self {
        Self {
            jobs: Some(resumed(saved.jobs.unwrap_or(0))),
            load_average: saved.load_average.map(resumed),
            keep_going: Some(resumed(saved.keep_going)),
            nodeps: Some(resumed(saved.nodeps)),
            fetch_only: Some(resumed(saved.fetch_only)),
            buildpkg: Some(resumed(saved.buildpkg)),
            buildpkg_only: Some(resumed(saved.buildpkg_only)),
            oneshot: Some(resumed(saved.oneshot)),
            parallel_fetch: Some(resumed(saved.parallel_fetch)),
            parallel_install: Some(resumed(saved.parallel_install)),
            ..Self::default()
        }
    }

    /// Get the XDG config directory path for pkgmerge
    fn get_config_path() -> Result<PathBuf> {
        // Use XDG_CONFIG_HOME if set, otherwise ~/.config
        let config_dir = match std::env::var("XDG_CONFIG_HOME") {
            Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => dirs::home_dir()
                .context("Could not determine home directory")?
                .join(".config"),
        };
        Ok(config_dir.join("pkgmerge").join("config.toml"))
    }

    /// Merge this config with another, preferring values from other when they exist
    pub fn merge(self, other: Self) -> Self {
        Self {
            jobs: other.jobs.or(self.jobs),
            load_average: other.load_average.or(self.load_average),
            keep_going: other.keep_going.or(self.keep_going),
            nodeps: other.nodeps.or(self.nodeps),
            fetch_only: other.fetch_only.or(self.fetch_only),
            buildpkg: other.buildpkg.or(self.buildpkg),
            buildpkg_only: other.buildpkg_only.or(self.buildpkg_only),
            oneshot: other.oneshot.or(self.oneshot),
            quiet: other.quiet.or(self.quiet),
            parallel_fetch: other.parallel_fetch.or(self.parallel_fetch),
            parallel_install: other.parallel_install.or(self.parallel_install),
            ebuild_locks: other.ebuild_locks.or(self.ebuild_locks),
            implicit_system_deps: other.implicit_system_deps.or(self.implicit_system_deps),
            job_delay_max: other.job_delay_max.or(self.job_delay_max),
            sigcont_delay: other.sigcont_delay.or(self.sigcont_delay),
            loadavg_latency: other.loadavg_latency.or(self.loadavg_latency),
            display_latency: other.display_latency.or(self.display_latency),
            build_dir: other.build_dir.or(self.build_dir),
            world_file: other.world_file.or(self.world_file),
            target_root: other.target_root.or(self.target_root),
            phases: match (self.phases, other.phases) {
                (Some(base), Some(over)) => {
                    let source = over.clone();
                    let merged = base.value().clone().merge(over.value().clone());
                    Some(match source {
                        ParsedProperty::File(_, path, original) => {
                            ParsedProperty::File(merged, path, original)
                        }
                        _ => ParsedProperty::Default(merged),
                    })
                }
                (base, over) => over.or(base),
            },
        }
    }

    /// Validates the merged values and produces the typed run settings.
    ///
    /// Missing values fall back to the built-in defaults.
    pub fn resolve(self) -> Result<RunConfig, ConfigError> {
        let config = Self::defaults().merge(self);
        let flag = |p: Option<ParsedProperty<bool>>| p.map(|p| *p).unwrap_or(false);

        let load_average = config.load_average.map(|p| *p);
        if let Some(load) = load_average
            && !(load.is_finite() && load > 0.0)
        {
            return Err(invalid("load_average", format!("{} is not a positive number", load)));
        }

        let loadavg_latency = config
            .loadavg_latency
            .map(|p| *p)
            .unwrap_or(DEFAULT_LOADAVG_LATENCY);
        let display_latency = config
            .display_latency
            .map(|p| *p)
            .unwrap_or(DEFAULT_DISPLAY_LATENCY);
        if loadavg_latency.is_zero() {
            return Err(invalid("loadavg_latency", "must be greater than zero"));
        }
        if display_latency.is_zero() {
            return Err(invalid("display_latency", "must be greater than zero"));
        }

        let target_root = config
            .target_root
            .map(|p| p.value().clone())
            .unwrap_or_else(|| DEFAULT_ROOT.to_string());
        if !Path::new(&target_root).is_absolute() {
            return Err(invalid("target_root", format!("'{}' is not absolute", target_root)));
        }

        let phases = config.phases.map(|p| p.value().clone()).unwrap_or_default();
        let unknown = phases.unknown_keys();
        if !unknown.is_empty() {
            return Err(invalid("phases", format!("unknown phase(s): {}", unknown.join(", "))));
        }

        let world_file = config
            .world_file
            .map(|p| p.value().clone())
            .unwrap_or_else(|| Path::new(&target_root).join(WORLD_FILE_RELATIVE));

        let options = SchedulerOptions {
            max_jobs: MaxJobs::from_count(config.jobs.map(|p| *p)),
            max_load: load_average,
            keep_going: flag(config.keep_going),
            nodeps: flag(config.nodeps),
            fetch_only: flag(config.fetch_only),
            buildpkg: flag(config.buildpkg),
            buildpkg_only: flag(config.buildpkg_only),
            oneshot: flag(config.oneshot),
            quiet: flag(config.quiet),
            parallel_fetch: flag(config.parallel_fetch),
            parallel_install: flag(config.parallel_install),
            ebuild_locks: config.ebuild_locks.map(|p| *p).unwrap_or(true),
            implicit_system_deps: config.implicit_system_deps.map(|p| *p).unwrap_or(true),
            job_delay_max: config
                .job_delay_max
                .map(|p| *p)
                .unwrap_or(DEFAULT_JOB_DELAY_MAX),
            sigcont_delay: config
                .sigcont_delay
                .map(|p| *p)
                .unwrap_or(DEFAULT_SIGCONT_DELAY),
            loadavg_latency,
            display_latency,
            build_dir: config
                .build_dir
                .map(|p| p.value().clone())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_BUILD_DIR)),
            target_root,
            resuming: false,
        };

        Ok(RunConfig {
            options,
            world_file,
            phases,
        })
    }

    /// Create a sample config file for user reference
    #[must_use = "this operation can fail and the result should be checked"]
    pub fn create_sample_config() -> Result<PathBuf> {
        let config_path = Self::get_config_path()?;

        // Don't overwrite existing config
        if config_path.exists() {
            return Ok(config_path);
        }
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(&config_path, SAMPLE_CONFIG).with_context(|| {
            format!(
                "Failed to write sample config to: {}",
                config_path.display()
            )
        })?;

        Ok(config_path)
    }
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.into(),
    }
}

const SAMPLE_CONFIG: &str = r#"# pkgmerge configuration file
# Location: $XDG_CONFIG_HOME/pkgmerge/config.toml (usually ~/.config/pkgmerge/config.toml)
# Every key can also be set with a PKGMERGE_<KEY> environment variable.

# Concurrent build jobs, 0 for unlimited (defaults to 1)
jobs = 1

# Do not start new jobs while the 1-minute load average is at or above this
# load_average = 4.0

# Keep building unrelated packages after a failure
keep_going = false

# Build binary packages alongside installing (buildpkg) or instead of it (buildpkg_only)
buildpkg = false
buildpkg_only = false

# Fetch sources of upcoming packages in the background
parallel_fetch = true

# Run merges concurrently, up to the job limit
parallel_install = false

# Serialize the setup phase in its own queue when merges run in parallel
ebuild_locks = true

# Merge system packages before anything that may use them at build time
implicit_system_deps = true

# Delays in seconds
job_delay_max = 5.0
sigcont_delay = 5.0
loadavg_latency = 30.0
display_latency = 3.0

# Where package build directories are created (env: PKGMERGE_TMPDIR)
build_dir = "/var/tmp/pkgmerge"

# Root packages are merged into
target_root = "/"

# world_file = "/var/lib/pkgmerge/world"

# Shell commands per phase. Each runs through `sh -c` with PKGMERGE_CPV,
# PKGMERGE_ROOT, PKGMERGE_PHASE, PKGMERGE_SLOT, PKGMERGE_BUILD_DIR and
# PKGMERGE_LOG_FILE set. Phases without commands succeed immediately.
[phases]
# pretend = ["check-disk-space \"$PKGMERGE_CPV\""]
# fetch = ["fetch-sources \"$PKGMERGE_CPV\""]
# compile = ["make -C \"$PKGMERGE_BUILD_DIR/work\""]
# install = ["make -C \"$PKGMERGE_BUILD_DIR/work\" DESTDIR=\"$PKGMERGE_BUILD_DIR/image\" install"]
# merge = ["cp -a \"$PKGMERGE_BUILD_DIR/image/.\" \"$PKGMERGE_ROOT\""]
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::file_serial;
    use std::env;
    use tempfile::TempDir;

    const ENV_VARS: [&str; 5] = [
        "PKGMERGE_JOBS",
        "PKGMERGE_KEEP_GOING",
        "PKGMERGE_LOAD_AVERAGE",
        "PKGMERGE_DISPLAY_LATENCY",
        "PKGMERGE_TMPDIR",
    ];

    fn clear_env() {
        for var in ENV_VARS {
            unsafe {
                env::remove_var(var);
            }
        }
    }

    /// # Resolve Defaults
    ///
    /// Tests that an empty config resolves to the built-in defaults.
    ///
    /// ## Test Scenario
    /// - Resolves `Config::default()`
    ///
    /// ## Expected Outcome
    /// - One job, no load limit, ebuild locks and system deps enabled
    /// - The world file lives below the default root
    #[test]
    fn test_resolve_defaults() {
        let run = Config::default().resolve().unwrap();

        assert_eq!(run.options, SchedulerOptions::default());
        assert_eq!(run.world_file, PathBuf::from("/var/lib/pkgmerge/world"));
        assert!(run.phases.is_empty());
    }

    /// # Load Config from Environment Variables
    ///
    /// Tests loading configuration from `PKGMERGE_*` variables.
    ///
    /// ## Test Scenario
    /// - Sets jobs, keep-going, load average and build dir variables
    /// - Sets one variable to garbage
    ///
    /// ## Expected Outcome
    /// - Valid values are parsed and marked as coming from the environment
    /// - The invalid value is ignored
    #[test]
    #[file_serial(env_tests)]
    fn test_load_from_env() {
        clear_env();
        unsafe {
            env::set_var("PKGMERGE_JOBS", "4");
            env::set_var("PKGMERGE_KEEP_GOING", "yes");
            env::set_var("PKGMERGE_LOAD_AVERAGE", "lots");
            env::set_var("PKGMERGE_TMPDIR", "/tmp/builds");
        }

        let config = Config::load_from_env();
        clear_env();

        assert_eq!(config.jobs, Some(ParsedProperty::Env(4, "4".to_string())));
        assert_eq!(
            config.keep_going,
            Some(ParsedProperty::Env(true, "yes".to_string()))
        );
        assert_eq!(config.load_average, None);
        assert_eq!(
            config.build_dir.as_deref(),
            Some(&PathBuf::from("/tmp/builds"))
        );
        assert_eq!(config.nodeps, None);
    }

    /// # Load Config from File
    ///
    /// Tests parsing a TOML config with a phases table.
    ///
    /// ## Test Scenario
    /// - Writes a config file with scalar keys and phase commands
    ///
    /// ## Expected Outcome
    /// - Values carry the file path as their source
    /// - Durations are parsed from seconds
    #[test]
    fn test_load_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
jobs = 0
load_average = 3.5
parallel_fetch = true
display_latency = 0.5
target_root = "/mnt/gentoo"

[phases]
compile = ["make"]
"#,
        )
        .unwrap();

        let config = Config::load_from_file(Some(&path)).unwrap();

        assert!(matches!(config.jobs, Some(ParsedProperty::File(0, ref p, _)) if *p == path));
        assert_eq!(config.load_average.as_deref(), Some(&3.5));
        assert_eq!(
            config.display_latency.as_deref(),
            Some(&Duration::from_millis(500))
        );

        let run = config.resolve().unwrap();
        assert_eq!(run.options.max_jobs, MaxJobs::Unlimited);
        assert!(run.options.parallel_fetch);
        assert_eq!(run.world_file, PathBuf::from("/mnt/gentoo/var/lib/pkgmerge/world"));
        assert_eq!(run.phases.commands_for(crate::core::runner::Phase::Compile), ["make"]);
    }

    /// # Invalid Config File
    ///
    /// Tests the errors reported for bad config files.
    ///
    /// ## Test Scenario
    /// - A file with a misspelled key
    /// - An explicit path that does not exist
    ///
    /// ## Expected Outcome
    /// - Both fail with a config error naming the file
    #[test]
    fn test_invalid_config_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "jbos = 4\n").unwrap();

        let err = Config::load_from_file(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("config.toml"));

        let missing = temp_dir.path().join("missing.toml");
        let err = Config::load_from_file(Some(&missing)).unwrap_err();
        assert!(err.to_string().contains("missing.toml"));
    }

    /// # Precedence
    ///
    /// Tests that CLI beats resume, resume beats env, env beats file.
    ///
    /// ## Test Scenario
    /// - Builds one config per layer, each setting jobs
    /// - Merges them in precedence order
    ///
    /// ## Expected Outcome
    /// - Each value comes from the highest layer that sets it
    #[test]
    fn test_precedence() {
        let path = PathBuf::from("/etc/pkgmerge.toml");
        let file = Config {
            jobs: Some(file_prop(2, &path)),
            oneshot: Some(file_prop(true, &path)),
            keep_going: Some(file_prop(true, &path)),
            ..Config::default()
        };
        let env = Config {
            jobs: Some(ParsedProperty::Env(3, "3".to_string())),
            ..Config::default()
        };
        let resume = Config::from_saved(&SavedOptions {
            jobs: Some(4),
            ..SavedOptions::default()
        });
        let cli = Config {
            keep_going: Some(ParsedProperty::Cli(true, "--keep-going".to_string())),
            ..Config::default()
        };

        let merged = file.merge(env).merge(resume).merge(cli);

        assert_eq!(merged.jobs.as_ref().map(|p| p.source_name()), Some("resume"));
        assert_eq!(merged.jobs.as_deref(), Some(&4));
        assert_eq!(merged.keep_going.as_ref().map(|p| p.source_name()), Some("cli"));
        // Saved options cover oneshot, so the file value is overridden.
        assert_eq!(merged.oneshot.as_deref(), Some(&false));
    }

    /// # Config Layers
    ///
    /// Tests merging the layers of one invocation with and without saved options.
    ///
    /// ## Test Scenario
    /// - File sets jobs and the root, saved options set jobs, CLI sets keep-going
    ///
    /// ## Expected Outcome
    /// - Saved jobs win over the file only when passed in
    /// - The target root is taken from the file layer
    #[test]
    fn test_config_layers() {
        let path = PathBuf::from("/etc/pkgmerge.toml");
        let layers = ConfigLayers {
            file: Config {
                jobs: Some(file_prop(2, &path)),
                target_root: Some(file_prop("/mnt/gentoo".to_string(), &path)),
                ..Config::default()
            },
            env: Config::default(),
            cli: Config {
                keep_going: Some(ParsedProperty::Cli(true, "--keep-going".to_string())),
                ..Config::default()
            },
        };
        let saved = SavedOptions {
            jobs: Some(6),
            ..SavedOptions::default()
        };

        assert_eq!(layers.merged(None).jobs.as_deref(), Some(&2));
        let resumed = layers.merged(Some(&saved));
        assert_eq!(resumed.jobs.as_deref(), Some(&6));
        assert_eq!(resumed.keep_going.as_deref(), Some(&true));
        assert_eq!(layers.target_root(), "/mnt/gentoo");
        assert_eq!(ConfigLayers::default().target_root(), DEFAULT_ROOT);
    }

    /// # Validation
    ///
    /// Tests that invalid values are rejected on resolve.
    ///
    /// ## Test Scenario
    /// - A negative load average, a zero display latency, a relative root,
    ///   a misspelled phase
    ///
    /// ## Expected Outcome
    /// - Each fails with InvalidValue naming the field
    #[test]
    fn test_validation() {
        let cases = [
            (
                Config {
                    load_average: Some(ParsedProperty::Cli(-1.0, "-1".to_string())),
                    ..Config::default()
                },
                "load_average",
            ),
            (
                Config {
                    display_latency: Some(ParsedProperty::Default(Duration::ZERO)),
                    ..Config::default()
                },
                "display_latency",
            ),
            (
                Config {
                    target_root: Some(ParsedProperty::Default("relative".to_string())),
                    ..Config::default()
                },
                "target_root",
            ),
            (
                Config {
                    phases: Some(ParsedProperty::Default(
                        toml::from_str("compiel = [\"make\"]").unwrap(),
                    )),
                    ..Config::default()
                },
                "phases",
            ),
        ];

        for (config, field) in cases {
            match config.resolve() {
                Err(ConfigError::InvalidValue { field: f, .. }) => assert_eq!(f, field),
                other => panic!("expected invalid {field}, got {other:?}"),
            }
        }
    }

    /// # Phases Merge Across Layers
    ///
    /// Tests that the phases table merges per phase instead of replacing.
    ///
    /// ## Test Scenario
    /// - Defaults carry an empty table, the file sets two phases
    ///
    /// ## Expected Outcome
    /// - Both phases survive resolve
    #[test]
    fn test_phases_merge_across_layers() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        let config = Config::parse_file(
            "[phases]\nfetch = [\"true\"]\nmerge = [\"true\"]\n",
            &path,
        )
        .unwrap();

        let run = config.resolve().unwrap();
        assert_eq!(run.phases.commands_for(crate::core::runner::Phase::Fetch).len(), 1);
        assert_eq!(run.phases.commands_for(crate::core::runner::Phase::Merge).len(), 1);
    }

    /// # Create Sample Config
    ///
    /// Tests that the sample config is written once and parses.
    ///
    /// ## Test Scenario
    /// - Points XDG_CONFIG_HOME at a temp dir and creates the sample twice
    ///
    /// ## Expected Outcome
    /// - The file lands in pkgmerge/config.toml and is valid config
    /// - The second call leaves a modified file alone
    #[test]
    #[file_serial(env_tests)]
    fn test_create_sample_config() {
        let temp_dir = TempDir::new().unwrap();
        let original_xdg = env::var("XDG_CONFIG_HOME").ok();
        unsafe {
            env::set_var("XDG_CONFIG_HOME", temp_dir.path());
        }

        let first = Config::create_sample_config();
        if let Ok(path) = &first {
            fs::write(path, format!("quiet = true\n{}", SAMPLE_CONFIG)).unwrap();
        }
        let second = Config::create_sample_config();

        match original_xdg {
            Some(val) => unsafe {
                env::set_var("XDG_CONFIG_HOME", val);
            },
            None => unsafe {
                env::remove_var("XDG_CONFIG_HOME");
            },
        }

        let path = first.unwrap();
        assert_eq!(path, temp_dir.path().join("pkgmerge").join("config.toml"));
        assert_eq!(second.unwrap(), path);
        let config = Config::load_from_file(Some(&path)).unwrap();
        assert_eq!(config.quiet.as_deref(), Some(&true));
        assert_eq!(config.jobs.as_deref(), Some(&1));
    }
}

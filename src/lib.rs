//! # pkgmerge
//!
//! A parallel build and merge scheduler for package installs. Given a
//! resolved dependency graph and its merge list, pkgmerge runs the fetch,
//! build and merge phases of every package, as many at a time as the job
//! and load limits allow, while keeping merges ordered by dependencies.
//!
//! This library provides:
//!
//! - The dependency graph and the package model
//! - A resolver over precomputed graph documents
//! - The scheduler loop with job admission, keep-going and resume support
//! - Layered configuration (CLI, resume list, environment, file, defaults)
//! - Structured output and logging
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::path::Path;
//!
//! use pkgmerge::config::ConfigLayers;
//! use pkgmerge::core::runner::{CliRunner, OutputFormat};
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let layers = ConfigLayers::load(None, pkgmerge::Config::default())?;
//! let mut runner = CliRunner::new(OutputFormat::Text, false);
//! let result = runner.run(Path::new("graph.json"), &layers).await;
//! println!("{}", result.exit_code);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod graph;
pub mod logging;
pub mod models;
pub mod package;
pub mod parsed_property;
pub mod resolver;

// Re-export commonly used types for convenience
pub use config::Config;
pub use error::{PkgmergeError, PkgmergeResult};
pub use models::Args;

/// Core result type used throughout the library
pub type Result<T> = anyhow::Result<T>;

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version string shown by `--version`, with the commit it was built from.
pub const BUILD_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_HASH"), ")");

//! Output formatters for different output modes.
//!
//! This module provides formatters for text, JSON, and NDJSON output modes,
//! each implementing the `OutputFormatter` trait for consistent behavior.

use super::events::{JobKind, JobStatusInfo, ProgressEvent, ResumeStatus, RunResult, RunSummary};
use crate::models::OutputFormat;
use std::io::{self, Write};

/// Trait for formatting and writing output events.
pub trait OutputFormatter {
    /// Writes a progress event to the output.
    fn write_event(&mut self, event: &ProgressEvent) -> io::Result<()>;

    /// Writes the end of run summary.
    fn write_summary(&mut self, summary: &RunSummary) -> io::Result<()>;

    /// Writes a saved resume list.
    fn write_resume_status(&mut self, status: &ResumeStatus) -> io::Result<()>;

    /// Flushes any buffered output.
    fn flush(&mut self) -> io::Result<()>;
}

/// Writer that formats output according to the specified format.
pub struct OutputWriter<W: Write> {
    writer: W,
    format: OutputFormat,
    quiet: bool,
    events: Vec<ProgressEvent>,
}

impl<W: Write> OutputWriter<W> {
    /// Creates a new OutputWriter with the specified format.
    pub fn new(writer: W, format: OutputFormat, quiet: bool) -> Self {
        Self {
            writer,
            format,
            quiet,
            events: Vec::new(),
        }
    }

    /// Returns the output format.
    pub fn format(&self) -> &OutputFormat {
        &self.format
    }

    /// Returns whether quiet mode is enabled.
    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    fn writeln(&mut self, text: &str) -> io::Result<()> {
        writeln!(self.writer, "{}", text)
    }

    /// Events still shown in quiet text mode.
    fn shown_when_quiet(event: &ProgressEvent) -> bool {
        matches!(
            event,
            ProgressEvent::PackageFailed { .. }
                | ProgressEvent::PostinstFailed { .. }
                | ProgressEvent::KeepGoingDropped { .. }
                | ProgressEvent::FailureLog { .. }
                | ProgressEvent::Signal { .. }
                | ProgressEvent::Error { .. }
        )
    }
}

/// Renders the status line, e.g.
/// `Jobs: 2 of 5 complete, 1 running, 1 failed    Load avg: 1.20, 0.90, 0.50`.
pub fn format_job_status(status: &JobStatusInfo) -> String {
    let mut line = format!(
        "Jobs: {} of {} complete, {} running",
        status.completed, status.total, status.running
    );
    if status.failed > 0 {
        line.push_str(&format!(", {} failed", status.failed));
    }
    if let Some([one, five, fifteen]) = status.load_avg {
        line.push_str(&format!(
            "    Load avg: {:.2}, {:.2}, {:.2}",
            one, five, fifteen
        ));
    }
    line
}

impl<W: Write> OutputFormatter for OutputWriter<W> {
    fn write_event(&mut self, event: &ProgressEvent) -> io::Result<()> {
        match self.format {
            OutputFormat::Text => {
                if !self.quiet || Self::shown_when_quiet(event) {
                    self.write_text_event(event)?;
                }
            }
            OutputFormat::Json => {
                // Buffer events for final summary
                self.events.push(event.clone());
            }
            OutputFormat::Ndjson => {
                let json = serde_json::to_string(event).map_err(io::Error::other)?;
                self.writeln(&json)?;
            }
        }
        Ok(())
    }

    fn write_summary(&mut self, summary: &RunSummary) -> io::Result<()> {
        match self.format {
            OutputFormat::Text => {
                if summary.list_failures && !summary.failures.is_empty() {
                    self.write_failure_list(summary)?;
                }
                if !self.quiet {
                    let result_line = match summary.result {
                        RunResult::Success => "SUCCESS",
                        RunResult::Failed => "FAILED",
                        RunResult::Interrupted => "INTERRUPTED",
                    };
                    self.writeln(&format!(
                        "{}: {} merged, {} failed",
                        result_line, summary.merged, summary.failed
                    ))?;
                }
            }
            OutputFormat::Json => {
                let output = serde_json::json!({
                    "summary": summary,
                    "events": self.events
                });
                let json = serde_json::to_string_pretty(&output).map_err(io::Error::other)?;
                self.writeln(&json)?;
            }
            OutputFormat::Ndjson => {
                let json = serde_json::to_string(summary).map_err(io::Error::other)?;
                self.writeln(&json)?;
            }
        }
        Ok(())
    }

    fn write_resume_status(&mut self, status: &ResumeStatus) -> io::Result<()> {
        match self.format {
            OutputFormat::Text => {
                self.writeln(&format!(
                    "Resume list for {} ({} entries)",
                    status.target_root.display(),
                    status.entries.len()
                ))?;
                self.writeln(&format!("  Graph:   {}", status.graph.display()))?;
                self.writeln(&format!(
                    "  Updated: {}",
                    status.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
                ))?;
                if status.options.keep_going {
                    self.writeln("  Options: --keep-going")?;
                }
                for entry in &status.entries {
                    self.writeln(&format!("  {}", entry))?;
                }
            }
            OutputFormat::Json => {
                let json = serde_json::to_string_pretty(status).map_err(io::Error::other)?;
                self.writeln(&json)?;
            }
            OutputFormat::Ndjson => {
                let json = serde_json::to_string(status).map_err(io::Error::other)?;
                self.writeln(&json)?;
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl<W: Write> OutputWriter<W> {
    /// Writes a text-formatted event.
    fn write_text_event(&mut self, event: &ProgressEvent) -> io::Result<()> {
        match event {
            ProgressEvent::Start {
                total,
                jobs,
                resuming,
            } => {
                let jobs = jobs.map_or("unlimited".to_string(), |j| j.to_string());
                let verb = if *resuming { "Resuming" } else { "Starting" };
                self.writeln(&format!(
                    ">>> {} {} packages ({} jobs)",
                    verb, total, jobs
                ))?;
            }
            ProgressEvent::JobStarted {
                cpv,
                root,
                kind,
                index,
                total,
            } => {
                let verb = match kind {
                    JobKind::Build => "Emerging",
                    JobKind::Binary => "Emerging binary",
                    JobKind::Fetch => "Fetching",
                };
                self.writeln(&format!(
                    ">>> {} ({} of {}) {}{}",
                    verb,
                    index,
                    total,
                    cpv,
                    root_suffix(root)
                ))?;
            }
            ProgressEvent::BuildCompleted { cpv, root } => {
                self.writeln(&format!(">>> Completed build of {}{}", cpv, root_suffix(root)))?;
            }
            ProgressEvent::MergeStarted {
                cpv,
                root,
                uninstall,
            } => {
                let verb = if *uninstall { "Uninstalling" } else { "Installing" };
                self.writeln(&format!(">>> {} {}{}", verb, cpv, root_suffix(root)))?;
            }
            ProgressEvent::MergeCompleted {
                cpv,
                root,
                uninstall,
            } => {
                let verb = if *uninstall { "Uninstalled" } else { "Installed" };
                self.writeln(&format!(" ✓ {} {}{}", verb, cpv, root_suffix(root)))?;
            }
            ProgressEvent::PackageFailed {
                cpv,
                root,
                action,
                returncode,
                log_file,
            } => {
                self.writeln(&format!(
                    " ✗ {}{} failed during {} (exit code {})",
                    cpv,
                    root_suffix(root),
                    action,
                    returncode
                ))?;
                if let Some(log) = log_file {
                    self.writeln(&format!("   Log file: '{}'", log.display()))?;
                }
            }
            ProgressEvent::PostinstFailed { cpv, root, log_file } => {
                self.writeln(&format!(
                    " ⚠ post-install of {}{} failed",
                    cpv,
                    root_suffix(root)
                ))?;
                if let Some(log) = log_file {
                    self.writeln(&format!("   Log file: '{}'", log.display()))?;
                }
            }
            ProgressEvent::WorldUpdated { atom, added } => {
                if *added {
                    self.writeln(&format!(
                        ">>> Recording {} in \"world\" favorites file...",
                        atom
                    ))?;
                } else {
                    self.writeln(&format!(
                        ">>> Removing {} from \"world\" favorites file...",
                        atom
                    ))?;
                }
            }
            ProgressEvent::KeepGoingDropped {
                cpv,
                root,
                requires,
            } => {
                self.writeln(&format!(
                    "pkgmerge --keep-going: {} dropped because it requires {}{}",
                    cpv,
                    requires.join(", "),
                    if root == "/" {
                        String::new()
                    } else {
                        format!(" for {}", root)
                    }
                ))?;
            }
            ProgressEvent::Resuming { remaining } => {
                self.writeln(&format!(
                    ">>> Recalculating merge list, {} entries remain",
                    remaining
                ))?;
            }
            ProgressEvent::JobStatus(status) => {
                self.writeln(&format_job_status(status))?;
            }
            ProgressEvent::Signal { signal } => {
                self.writeln(&format!("Exiting on signal {}", signal))?;
            }
            ProgressEvent::FailureLog {
                cpv,
                log_file,
                contents,
            } => {
                self.writeln(&format!(
                    ">>> Build log of {} ('{}'):",
                    cpv,
                    log_file.display()
                ))?;
                for line in contents.lines() {
                    self.writeln(line)?;
                }
            }
            ProgressEvent::Complete {
                merged,
                failed,
                total,
            } => {
                self.writeln(&format!(
                    "Complete: {} of {} merged, {} failed",
                    merged, total, failed
                ))?;
            }
            ProgressEvent::Error { message, code } => {
                let code_str = code
                    .as_ref()
                    .map(|c| format!(" [{}]", c))
                    .unwrap_or_default();
                self.writeln(&format!("Error{}: {}", code_str, message))?;
            }
        }
        Ok(())
    }

    fn write_failure_list(&mut self, summary: &RunSummary) -> io::Result<()> {
        let count = summary.failures.len();
        if count == 1 {
            self.writeln("The following package has failed to build or install:")?;
        } else {
            self.writeln(&format!(
                "The following {} packages have failed to build or install:",
                count
            ))?;
        }
        self.writeln("")?;
        for failure in &summary.failures {
            match &failure.log_file {
                Some(log) => {
                    self.writeln(&format!(
                        " * {}{}, Log file:",
                        failure.cpv,
                        root_suffix(&failure.root)
                    ))?;
                    self.writeln(&format!(" *   '{}'", log.display()))?;
                }
                None => {
                    self.writeln(&format!(" * {}{}", failure.cpv, root_suffix(&failure.root)))?;
                }
            }
        }
        self.writeln("")
    }
}

fn root_suffix(root: &str) -> String {
    if root == "/" {
        String::new()
    } else {
        format!(" to {}", root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::output::events::FailureInfo;
    use insta::assert_snapshot;
    use std::path::PathBuf;

    fn failure(cpv: &str, log: Option<&str>) -> FailureInfo {
        FailureInfo {
            cpv: cpv.to_string(),
            root: "/".to_string(),
            action: "build".to_string(),
            log_file: log.map(PathBuf::from),
        }
    }

    /// # Text Job Lifecycle
    ///
    /// Verifies the text rendering of a job from start to merge.
    ///
    /// ## Test Scenario
    /// - Writes start, job started, build completed, merge events
    ///
    /// ## Expected Outcome
    /// - Lines match the pkgmerge progress format
    #[test]
    fn test_text_job_lifecycle() {
        let mut buffer = Vec::new();
        let mut writer = OutputWriter::new(&mut buffer, OutputFormat::Text, false);

        let events = [
            ProgressEvent::Start {
                total: 2,
                jobs: Some(2),
                resuming: false,
            },
            ProgressEvent::JobStarted {
                cpv: "dev-libs/a-1".to_string(),
                root: "/".to_string(),
                kind: JobKind::Build,
                index: 1,
                total: 2,
            },
            ProgressEvent::JobStarted {
                cpv: "dev-libs/b-2".to_string(),
                root: "/mnt/target".to_string(),
                kind: JobKind::Binary,
                index: 2,
                total: 2,
            },
            ProgressEvent::BuildCompleted {
                cpv: "dev-libs/a-1".to_string(),
                root: "/".to_string(),
            },
            ProgressEvent::MergeStarted {
                cpv: "dev-libs/a-1".to_string(),
                root: "/".to_string(),
                uninstall: false,
            },
            ProgressEvent::MergeCompleted {
                cpv: "dev-libs/a-1".to_string(),
                root: "/".to_string(),
                uninstall: false,
            },
        ];
        for event in &events {
            writer.write_event(event).unwrap();
        }

        let output = String::from_utf8(buffer).unwrap();
        assert_snapshot!(output, @r"
        >>> Starting 2 packages (2 jobs)
        >>> Emerging (1 of 2) dev-libs/a-1
        >>> Emerging binary (2 of 2) dev-libs/b-2 to /mnt/target
        >>> Completed build of dev-libs/a-1
        >>> Installing dev-libs/a-1
         ✓ Installed dev-libs/a-1
        ");
    }

    /// # Failure List Rendering
    ///
    /// Verifies the end of run failure list.
    ///
    /// ## Test Scenario
    /// - Writes a summary with two failures, one without a log
    ///
    /// ## Expected Outcome
    /// - Plural heading, one entry per failure, log path quoted
    #[test]
    fn test_failure_list_rendering() {
        let mut buffer = Vec::new();
        let mut writer = OutputWriter::new(&mut buffer, OutputFormat::Text, true);

        let summary = RunSummary {
            result: RunResult::Failed,
            merged: 3,
            failed: 2,
            exit_code: 1,
            failures: vec![
                failure("dev-libs/f-1", Some("/var/tmp/pkgmerge/dev-libs/f-1/build.log")),
                failure("dev-libs/g-1", None),
            ],
            list_failures: true,
        };
        writer.write_summary(&summary).unwrap();

        let output = String::from_utf8(buffer).unwrap();
        assert_snapshot!(output, @r"
        The following 2 packages have failed to build or install:

         * dev-libs/f-1, Log file:
         *   '/var/tmp/pkgmerge/dev-libs/f-1/build.log'
         * dev-libs/g-1
        ");
    }

    /// # Single Failure Heading
    ///
    /// Verifies the singular heading.
    ///
    /// ## Test Scenario
    /// - Writes a summary with one listed failure
    ///
    /// ## Expected Outcome
    /// - "The following package has failed" is used
    #[test]
    fn test_single_failure_heading() {
        let mut buffer = Vec::new();
        let mut writer = OutputWriter::new(&mut buffer, OutputFormat::Text, false);
        let summary = RunSummary {
            result: RunResult::Failed,
            merged: 0,
            failed: 1,
            exit_code: 1,
            failures: vec![failure("dev-libs/f-1", None)],
            list_failures: true,
        };
        writer.write_summary(&summary).unwrap();

        let output = String::from_utf8(buffer).unwrap();
        assert!(output.starts_with("The following package has failed to build or install:"));
        assert!(output.contains("FAILED: 0 merged, 1 failed"));
    }

    /// # Unlisted Failures
    ///
    /// Verifies that the list is skipped when not requested.
    ///
    /// ## Test Scenario
    /// - Writes a summary with a failure but list_failures unset
    ///
    /// ## Expected Outcome
    /// - Only the result line is printed
    #[test]
    fn test_unlisted_failures() {
        let mut buffer = Vec::new();
        let mut writer = OutputWriter::new(&mut buffer, OutputFormat::Text, false);
        let summary = RunSummary {
            result: RunResult::Failed,
            merged: 0,
            failed: 1,
            exit_code: 1,
            failures: vec![failure("dev-libs/f-1", None)],
            list_failures: false,
        };
        writer.write_summary(&summary).unwrap();

        let output = String::from_utf8(buffer).unwrap();
        assert_eq!(output, "FAILED: 0 merged, 1 failed\n");
    }

    /// # Keep-Going Drop Message
    ///
    /// Verifies the dropped package notice with and without a root.
    ///
    /// ## Test Scenario
    /// - Writes two KeepGoingDropped events in quiet mode
    ///
    /// ## Expected Outcome
    /// - Both are shown; only the second names its root
    #[test]
    fn test_keep_going_drop_message() {
        let mut buffer = Vec::new();
        let mut writer = OutputWriter::new(&mut buffer, OutputFormat::Text, true);
        writer
            .write_event(&ProgressEvent::KeepGoingDropped {
                cpv: "a/g-1".to_string(),
                root: "/".to_string(),
                requires: vec!["=a/f-1".to_string()],
            })
            .unwrap();
        writer
            .write_event(&ProgressEvent::KeepGoingDropped {
                cpv: "a/h-1".to_string(),
                root: "/mnt".to_string(),
                requires: vec!["=a/f-1".to_string(), "=a/g-1".to_string()],
            })
            .unwrap();

        let output = String::from_utf8(buffer).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(
            lines[0],
            "pkgmerge --keep-going: a/g-1 dropped because it requires =a/f-1"
        );
        assert_eq!(
            lines[1],
            "pkgmerge --keep-going: a/h-1 dropped because it requires =a/f-1, =a/g-1 for /mnt"
        );
    }

    /// # Quiet Mode Suppresses Progress
    ///
    /// Verifies quiet mode only shows failures and errors.
    ///
    /// ## Test Scenario
    /// - Writes a merge event and a failure event in quiet mode
    ///
    /// ## Expected Outcome
    /// - Only the failure is printed
    #[test]
    fn test_quiet_mode_suppresses_progress() {
        let mut buffer = Vec::new();
        let mut writer = OutputWriter::new(&mut buffer, OutputFormat::Text, true);
        writer
            .write_event(&ProgressEvent::MergeCompleted {
                cpv: "a/b-1".to_string(),
                root: "/".to_string(),
                uninstall: false,
            })
            .unwrap();
        writer
            .write_event(&ProgressEvent::PackageFailed {
                cpv: "a/c-1".to_string(),
                root: "/".to_string(),
                action: "install".to_string(),
                returncode: 2,
                log_file: None,
            })
            .unwrap();

        let output = String::from_utf8(buffer).unwrap();
        assert!(!output.contains("a/b-1"));
        assert!(output.contains("a/c-1 failed during install (exit code 2)"));
    }

    /// # NDJSON Output Events
    ///
    /// Verifies NDJSON formatter writes one JSON per line.
    ///
    /// ## Test Scenario
    /// - Writes two events and a summary
    ///
    /// ## Expected Outcome
    /// - Three lines; the events parse back as ProgressEvent
    #[test]
    fn test_ndjson_output_events() {
        let mut buffer = Vec::new();
        let mut writer = OutputWriter::new(&mut buffer, OutputFormat::Ndjson, false);
        writer
            .write_event(&ProgressEvent::Resuming { remaining: 3 })
            .unwrap();
        writer
            .write_event(&ProgressEvent::Signal { signal: 2 })
            .unwrap();
        writer
            .write_summary(&RunSummary {
                result: RunResult::Interrupted,
                merged: 0,
                failed: 0,
                exit_code: 130,
                failures: Vec::new(),
                list_failures: false,
            })
            .unwrap();

        let output = String::from_utf8(buffer).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(serde_json::from_str::<ProgressEvent>(lines[0]).is_ok());
        assert!(serde_json::from_str::<ProgressEvent>(lines[1]).is_ok());
        assert!(lines[2].contains("\"exit_code\":130"));
    }

    /// # JSON Output Buffering
    ///
    /// Verifies JSON formatter buffers events for final summary.
    ///
    /// ## Test Scenario
    /// - Writes an event, then the summary
    ///
    /// ## Expected Outcome
    /// - Nothing is written before the summary; then both keys appear
    #[test]
    fn test_json_output_buffering() {
        let mut buffer = Vec::new();
        {
            let mut writer = OutputWriter::new(&mut buffer, OutputFormat::Json, false);
            writer
                .write_event(&ProgressEvent::Complete {
                    merged: 1,
                    failed: 0,
                    total: 1,
                })
                .unwrap();
            writer
                .write_summary(&RunSummary {
                    result: RunResult::Success,
                    merged: 1,
                    failed: 0,
                    exit_code: 0,
                    failures: Vec::new(),
                    list_failures: false,
                })
                .unwrap();
        }

        let output = String::from_utf8(buffer).unwrap();
        let value: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value["summary"]["result"], "success");
        assert_eq!(value["events"][0]["event"], "complete");
    }

    /// # Resume Status Rendering
    ///
    /// Verifies the text rendering of a saved resume list.
    ///
    /// ## Test Scenario
    /// - Renders a two-entry list saved with keep-going
    ///
    /// ## Expected Outcome
    /// - Header, options and one line per entry in merge order
    #[test]
    fn test_resume_status_rendering() {
        use crate::core::state::{ResumeEntry, SavedOptions};
        use crate::package::{Operation, PackageType};
        use chrono::TimeZone;

        let when = chrono::Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 0).unwrap();
        let status = ResumeStatus {
            target_root: PathBuf::from("/"),
            graph: PathBuf::from("/tmp/graph.json"),
            created_at: when,
            updated_at: when,
            entries: vec![
                ResumeEntry::new(PackageType::Ebuild, "/", "dev-libs/a-1", Operation::Merge),
                ResumeEntry::new(PackageType::Binary, "/", "app-misc/b-2", Operation::Merge),
            ],
            options: SavedOptions {
                keep_going: true,
                ..SavedOptions::default()
            },
        };

        let mut buffer = Vec::new();
        let mut writer = OutputWriter::new(&mut buffer, OutputFormat::Text, false);
        writer.write_resume_status(&status).unwrap();

        let output = String::from_utf8(buffer).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines[0], "Resume list for / (2 entries)");
        assert_eq!(lines[1], "  Graph:   /tmp/graph.json");
        assert_eq!(lines[2], "  Updated: 2026-03-01 12:30:00 UTC");
        assert_eq!(lines[3], "  Options: --keep-going");
        assert_eq!(lines[4], format!("  {}", status.entries[0]));
        assert_eq!(lines.len(), 6);
    }

    /// # Job Status Line
    ///
    /// Verifies the status line with and without failures and load.
    ///
    /// ## Test Scenario
    /// - Formats two status infos
    ///
    /// ## Expected Outcome
    /// - Failed count and load average only appear when present
    #[test]
    fn test_job_status_line() {
        let plain = JobStatusInfo {
            completed: 1,
            total: 5,
            running: 2,
            failed: 0,
            load_avg: None,
        };
        assert_eq!(format_job_status(&plain), "Jobs: 1 of 5 complete, 2 running");

        let loaded = JobStatusInfo {
            failed: 1,
            load_avg: Some([1.5, 0.75, 0.25]),
            ..plain
        };
        assert_eq!(
            format_job_status(&loaded),
            "Jobs: 1 of 5 complete, 2 running, 1 failed    Load avg: 1.50, 0.75, 0.25"
        );
    }
}

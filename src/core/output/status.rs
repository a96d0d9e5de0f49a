//! Job status line bookkeeping.

use super::events::{JobStatusInfo, ProgressEvent};

/// Counters behind the periodic "Jobs: ..." status line.
///
/// [`refresh`](JobStatusDisplay::refresh) only yields an event when the
/// rendered line would differ from the last one, so periodic ticks do not
/// flood the output.
#[derive(Debug, Default, Clone)]
pub struct JobStatusDisplay {
    /// Packages to build or extract in this pass.
    pub maxval: usize,
    /// Packages started so far in this pass.
    pub curval: usize,
    /// Completed merges.
    pub merges: usize,
    /// Running jobs and merges.
    pub running: usize,
    /// Failed packages.
    pub failed: usize,
    last: Option<JobStatusInfo>,
}

impl JobStatusDisplay {
    pub fn new(maxval: usize) -> Self {
        Self {
            maxval,
            ..Self::default()
        }
    }

    /// Resets the per-pass counters for a new pass over `maxval` packages.
    ///
    /// Merge and failure counts carry over between keep-going passes.
    pub fn reset(&mut self, maxval: usize) {
        self.maxval = maxval;
        self.curval = 0;
        self.running = 0;
        self.last = None;
    }

    pub fn info(&self, load_avg: Option<[f64; 3]>) -> JobStatusInfo {
        JobStatusInfo {
            completed: self.merges,
            total: self.maxval,
            running: self.running,
            failed: self.failed,
            load_avg,
        }
    }

    /// Returns a status event when something changed since the last one.
    ///
    /// Load averages are compared at two decimals, the precision they are
    /// displayed with.
    pub fn refresh(&mut self, load_avg: Option<[f64; 3]>) -> Option<ProgressEvent> {
        let rounded = load_avg.map(|avg| avg.map(|v| (v * 100.0).round() / 100.0));
        let info = self.info(rounded);
        if self.last.as_ref() == Some(&info) {
            return None;
        }
        self.last = Some(info.clone());
        Some(ProgressEvent::JobStatus(info))
    }
}

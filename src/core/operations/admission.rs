//! Job admission control.
//!
//! Decides whether another build job may start, based on the job limit and
//! the system load average, and computes the delay between job starts.

use std::fmt;
use std::io;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

/// Default upper bound of the delay between job starts.
pub const DEFAULT_JOB_DELAY_MAX: Duration = Duration::from_secs(5);

/// Default grace period after the process is continued from a stop.
pub const DEFAULT_SIGCONT_DELAY: Duration = Duration::from_secs(5);

/// Concurrency limit of a queue or of the build jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaxJobs {
    Unlimited,
    Limited(NonZeroUsize),
}

impl MaxJobs {
    pub const ONE: MaxJobs = MaxJobs::Limited(NonZeroUsize::MIN);

    /// Builds a limit from a count; `None` or zero means unlimited.
    pub fn from_count(count: Option<usize>) -> Self {
        match count.and_then(NonZeroUsize::new) {
            Some(n) => MaxJobs::Limited(n),
            None => MaxJobs::Unlimited,
        }
    }

    /// True when `running` more tasks would still be within the limit.
    pub fn allows(&self, running: usize) -> bool {
        match self {
            MaxJobs::Unlimited => true,
            MaxJobs::Limited(max) => running < max.get(),
        }
    }

    /// True for an unlimited or a greater-than-one limit.
    pub fn is_parallel(&self) -> bool {
        match self {
            MaxJobs::Unlimited => true,
            MaxJobs::Limited(max) => max.get() > 1,
        }
    }

    /// The limit as a count, `None` when unlimited.
    pub fn count(&self) -> Option<usize> {
        match self {
            MaxJobs::Unlimited => None,
            MaxJobs::Limited(max) => Some(max.get()),
        }
    }
}

impl Default for MaxJobs {
    fn default() -> Self {
        MaxJobs::ONE
    }
}

impl fmt::Display for MaxJobs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaxJobs::Unlimited => f.write_str("unlimited"),
            MaxJobs::Limited(max) => write!(f, "{}", max),
        }
    }
}

/// Source of the 1, 5 and 15 minute system load averages.
pub trait LoadAverage: Send + Sync {
    fn current_load(&self) -> io::Result<[f64; 3]>;
}

/// Load averages reported by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLoadAverage;

#[cfg(unix)]
impl LoadAverage for SystemLoadAverage {
    fn current_load(&self) -> io::Result<[f64; 3]> {
        let mut loads = [0.0f64; 3];
        // SAFETY: getloadavg writes at most `nelem` doubles into the buffer,
        // which holds exactly three.
        let n = unsafe { libc::getloadavg(loads.as_mut_ptr(), 3) };
        if n < 3 {
            return Err(io::Error::other("load average unavailable"));
        }
        Ok(loads)
    }
}

#[cfg(not(unix))]
impl LoadAverage for SystemLoadAverage {
    fn current_load(&self) -> io::Result<[f64; 3]> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "load average is not available on this platform",
        ))
    }
}

/// Admission settings.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionLimits {
    pub max_jobs: MaxJobs,
    /// Load average above which no further jobs start.
    pub max_load: Option<f64>,
    pub job_delay_max: Duration,
    pub sigcont_delay: Duration,
}

impl Default for AdmissionLimits {
    fn default() -> Self {
        Self {
            max_jobs: MaxJobs::ONE,
            max_load: None,
            job_delay_max: DEFAULT_JOB_DELAY_MAX,
            sigcont_delay: DEFAULT_SIGCONT_DELAY,
        }
    }
}

/// Decides when new build jobs may start.
pub struct JobAdmission {
    limits: AdmissionLimits,
    load: Arc<dyn LoadAverage>,
    previous_job_start: Option<Instant>,
    sigcont_time: Option<Instant>,
}

impl fmt::Debug for JobAdmission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobAdmission")
            .field("limits", &self.limits)
            .field("previous_job_start", &self.previous_job_start)
            .field("sigcont_time", &self.sigcont_time)
            .finish_non_exhaustive()
    }
}

impl JobAdmission {
    pub fn new(limits: AdmissionLimits, load: Arc<dyn LoadAverage>) -> Self {
        Self {
            limits,
            load,
            previous_job_start: None,
            sigcont_time: None,
        }
    }

    pub fn limits(&self) -> &AdmissionLimits {
        &self.limits
    }

    /// Current load averages, `None` when unavailable.
    pub fn load_avg(&self) -> Option<[f64; 3]> {
        self.load.current_load().ok()
    }

    /// Whether another job may start while `jobs` are running.
    pub fn can_start_job(&self, jobs: usize, terminated: bool) -> bool {
        if terminated || !self.limits.max_jobs.allows(jobs) {
            return false;
        }
        if let Some(max_load) = self.limits.max_load
            && self.limits.max_jobs.is_parallel()
            && jobs >= 1
        {
            match self.load.current_load() {
                Ok([load1, _, _]) if load1 < max_load => {}
                Ok([load1, _, _]) => {
                    debug!("Load average {:.2} >= {:.2}, not starting a job", load1, max_load);
                    return false;
                }
                Err(_) => return false,
            }
        }
        true
    }

    /// Returns the deadline before which no job should start, if any.
    ///
    /// The SIGCONT grace period takes precedence over the load based delay,
    /// since load figures are stale right after a stop/continue cycle.
    pub fn should_delay(&mut self, jobs: usize, now: Instant) -> Option<Instant> {
        let max_load = self.limits.max_load?;
        if jobs == 0 {
            return None;
        }

        if let Some(sigcont) = self.sigcont_time {
            let elapsed = now.saturating_duration_since(sigcont);
            if elapsed < self.limits.sigcont_delay {
                return Some(sigcont + self.limits.sigcont_delay);
            }
            self.sigcont_time = None;
        }

        let [load1, _, _] = self.load.current_load().ok()?;
        let ratio = load1 / max_load;
        let ratio = if ratio.is_finite() { ratio.clamp(0.0, 1.0) } else { 1.0 };
        let delay = self.limits.job_delay_max.mul_f64(ratio);

        let previous = self.previous_job_start?;
        let elapsed = now.saturating_duration_since(previous);
        if elapsed < delay {
            debug!("Delaying next job by {:?}", delay - elapsed);
            return Some(previous + delay);
        }
        None
    }

    /// Records that a job started at `now`.
    pub fn job_started(&mut self, now: Instant) {
        self.previous_job_start = Some(now);
    }

    /// Records that the process was continued at `now`.
    pub fn continued(&mut self, now: Instant) {
        self.sigcont_time = Some(now);
    }
}

/// Load average source returning a settable value.
#[derive(Debug, Default)]
pub struct FixedLoadAverage {
    load: std::sync::Mutex<Option<[f64; 3]>>,
}

impl FixedLoadAverage {
    pub fn new(load: Option<[f64; 3]>) -> Self {
        Self {
            load: std::sync::Mutex::new(load),
        }
    }

    pub fn set(&self, load: Option<[f64; 3]>) {
        if let Ok(mut guard) = self.load.lock() {
            *guard = load;
        }
    }
}

impl LoadAverage for FixedLoadAverage {
    fn current_load(&self) -> io::Result<[f64; 3]> {
        self.load
            .lock()
            .ok()
            .and_then(|guard| *guard)
            .ok_or_else(|| io::Error::other("load average unavailable"))
    }
}

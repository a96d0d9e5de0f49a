//! The scheduler loop.
//!
//! [`Scheduler::merge`] drives one run: it saves the resume list, then runs
//! passes over the merge list until everything merged, a failure stops the
//! run, or a signal arrives. Within a pass a single loop owns every piece of
//! mutable state. It waits for the next [`SchedulerEvent`] or timer, handles
//! it, then re-runs admission and selection until nothing changes before it
//! waits again.
//!
//! With keep-going, a pass that ended with failures is followed by another
//! one over the resume list minus the failed packages and everything that
//! depends on them.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval, sleep_until};
use tracing::{debug, error, info, warn};

use super::phases::{
    self, BuildTask, MergeTask, PhaseContext, PhasePlan, PrefetchTask, QueuedTask,
};
use super::queue::{QueueName, TaskQueues};
use super::task::{
    CancelHandle, CancelToken, EventSender, ExitGuard, PrefetchWatch, SchedulerEvent, SlotPermit,
    TaskExit, TaskId, TaskIdGen, cancel_pair, prefetch_pair,
};
use super::traits::{PhaseExecutor, SchedulerOptions};
use crate::core::ExitCode;
use crate::core::operations::{
    AdmissionLimits, BuildSettings, ChooseContext, ConfigPool, FailedPkg, FailureStage,
    FailureTracker, JobAdmission, LoadAverage, MaxJobs, PackageChooser, SystemDepsGate, WorldSet,
    locate_failure_log,
};
use crate::core::output::{
    FailureInfo, JobKind, JobStatusDisplay, OutputFormatter, OutputWriter, ProgressEvent,
    RunResult, RunSummary,
};
use crate::core::state::{ResumeEntry, ResumeState, ResumeStore};
use crate::error::{PkgmergeResult, SchedulingError};
use crate::graph::{DepGraph, dependents_of, find_deep_system_runtime_deps, ignore_soft};
use crate::package::{MergeListEntry, Operation, PackageCache, PackageType, PkgRef};
use crate::resolver::{GraphConfig, Resolver};

/// External collaborators of a scheduler run.
pub struct SchedulerCollaborators {
    /// Rebuilds the graph from the resume list under keep-going.
    pub resolver: Arc<dyn Resolver>,
    pub executor: Arc<dyn PhaseExecutor>,
    pub load: Arc<dyn LoadAverage>,
    pub resume: Box<dyn ResumeStore>,
    pub world: Box<dyn WorldSet>,
}

/// Posts signals to a running scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    events: EventSender,
}

impl SchedulerHandle {
    /// Requests termination after SIGINT or SIGTERM.
    ///
    /// Returns false once the scheduler is gone.
    pub fn terminate(&self, signal: i32) -> bool {
        self.events.send(SchedulerEvent::Terminate { signal }).is_ok()
    }

    /// Reports a SIGCONT.
    pub fn sigcont(&self) -> bool {
        self.events.send(SchedulerEvent::Continued).is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskKind {
    Prefetch,
    Build,
    Merge,
}

impl TaskKind {
    fn queue(self) -> QueueName {
        match self {
            TaskKind::Prefetch => QueueName::Fetch,
            TaskKind::Build => QueueName::Jobs,
            TaskKind::Merge => QueueName::Merge,
        }
    }
}

#[derive(Debug)]
struct TaskInfo {
    pkg: PkgRef,
    kind: TaskKind,
    cancel: CancelHandle,
}

/// Build/merge scheduler over one merge list.
pub struct Scheduler<W: Write> {
    opts: SchedulerOptions,
    background: bool,
    max_jobs: MaxJobs,
    graph_path: PathBuf,
    resolver: Arc<dyn Resolver>,
    resume: Box<dyn ResumeStore>,
    world: Box<dyn WorldSet>,
    output: OutputWriter<W>,
    phase_ctx: PhaseContext,

    graph: Option<DepGraph<PkgRef>>,
    mergelist: Vec<MergeListEntry>,
    cache: PackageCache,
    favorites: Vec<String>,

    chooser: PackageChooser,
    completed: HashSet<PkgRef>,
    gate: SystemDepsGate<(TaskId, MergeTask)>,
    prefetchers: HashMap<PkgRef, (TaskId, PrefetchWatch)>,
    queues: TaskQueues<QueuedTask>,
    tasks: HashMap<TaskId, TaskInfo>,
    admission: JobAdmission,
    pool: ConfigPool,
    failures: FailureTracker,
    status: JobStatusDisplay,
    ids: TaskIdGen,
    events_tx: EventSender,
    events_rx: mpsc::UnboundedReceiver<SchedulerEvent>,

    jobs: usize,
    merged: usize,
    job_delay: Option<Instant>,
    terminated: Option<i32>,
    aborted: bool,
    resuming: bool,
}

impl<W: Write> Scheduler<W> {
    /// Creates a scheduler for `graph_config`.
    ///
    /// `graph_path` is recorded in the resume list so a later `resume` can
    /// find the graph again.
    pub fn new(
        opts: SchedulerOptions,
        graph_config: GraphConfig,
        collaborators: SchedulerCollaborators,
        graph_path: impl Into<PathBuf>,
        output: OutputWriter<W>,
    ) -> Self {
        let interactive = graph_config.packages().any(|pkg| pkg.interactive());
        let background =
            (opts.max_jobs.is_parallel() || opts.quiet) && !opts.fetch_only && !interactive;
        let max_jobs = if background { opts.max_jobs } else { MaxJobs::ONE };
        if interactive && opts.max_jobs.is_parallel() {
            info!("Interactive packages in the merge list, running one job at a time");
        }
        let merge_jobs = if opts.parallel_install {
            max_jobs
        } else {
            MaxJobs::ONE
        };
        let setup_queue = if opts.ebuild_locks && merge_jobs.is_parallel() {
            QueueName::EbuildLocks
        } else {
            QueueName::Merge
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let phase_ctx = PhaseContext {
            executor: collaborators.executor,
            events: events_tx.clone(),
            plan: PhasePlan {
                fetch_only: opts.fetch_only,
                buildpkg: opts.buildpkg,
                buildpkg_only: opts.buildpkg_only,
                setup_queue: Some(setup_queue),
            },
        };
        let admission = JobAdmission::new(
            AdmissionLimits {
                max_jobs,
                max_load: opts.max_load,
                job_delay_max: opts.job_delay_max,
                sigcont_delay: opts.sigcont_delay,
            },
            collaborators.load,
        );

        let mut scheduler = Self {
            background,
            max_jobs,
            graph_path: graph_path.into(),
            resolver: collaborators.resolver,
            resume: collaborators.resume,
            world: collaborators.world,
            output,
            phase_ctx,
            graph: None,
            mergelist: Vec::new(),
            cache: PackageCache::new(),
            favorites: Vec::new(),
            chooser: PackageChooser::new(opts.nodeps && max_jobs.is_parallel()),
            completed: HashSet::new(),
            gate: SystemDepsGate::default(),
            prefetchers: HashMap::new(),
            queues: TaskQueues::new(max_jobs, merge_jobs),
            tasks: HashMap::new(),
            admission,
            pool: ConfigPool::new(Default::default()),
            failures: FailureTracker::new(),
            status: JobStatusDisplay::new(0),
            ids: TaskIdGen::default(),
            events_tx,
            events_rx,
            jobs: 0,
            merged: 0,
            job_delay: None,
            terminated: None,
            aborted: false,
            resuming: opts.resuming,
            opts,
        };
        scheduler.install_graph(graph_config);
        scheduler
    }

    /// Handle for posting signals to this scheduler.
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            events: self.events_tx.clone(),
        }
    }

    /// Whether phases run without a terminal.
    pub fn is_background(&self) -> bool {
        self.background
    }

    /// Effective job limit after background mode was decided.
    pub fn max_jobs(&self) -> MaxJobs {
        self.max_jobs
    }

    /// Build settings currently handed out to tasks.
    pub fn outstanding_configs(&self) -> usize {
        self.pool.outstanding()
    }

    pub fn output_mut(&mut self) -> &mut OutputWriter<W> {
        &mut self.output
    }

    /// Runs the whole merge list.
    ///
    /// Package failures end up in the summary. An `Err` means the run was
    /// aborted by an internal error or the resume list could not be saved.
    pub async fn merge(&mut self) -> PkgmergeResult<RunSummary> {
        self.save_resume_list()?;

        loop {
            if !self.run_pass().await? {
                break;
            }
            if self.terminated.is_some()
                || !self.failures.has_pass_failures()
                || self.opts.fetch_only
                || !self.opts.keep_going
            {
                break;
            }
            if !self.recalc_resume_list()? {
                break;
            }
        }

        self.failures.end_pass();
        self.gate.clear();
        Ok(self.summary())
    }

    /// Runs one pass over the merge list.
    ///
    /// Returns `false` when the pre-merge checks stopped the run before any
    /// job started.
    async fn run_pass(&mut self) -> PkgmergeResult<bool> {
        self.add_prefetchers();
        if !self.opts.fetch_only && !self.run_pretend().await? {
            self.cancel_all()?;
            self.drain().await?;
            return Ok(false);
        }
        self.add_packages();
        let total = self.status.maxval;
        info!(
            "Starting pass over {} packages with {} jobs",
            total, self.max_jobs
        );
        self.emit(ProgressEvent::Start {
            total,
            jobs: self.max_jobs.count(),
            resuming: self.resuming,
        });

        if let Err(e) = self.main_loop().await {
            error!("Aborting run: {}", e);
            self.aborted = true;
            if let Err(cleanup) = self.cancel_all() {
                warn!("Cleanup after abort failed: {}", cleanup);
            }
            if let Err(cleanup) = self.drain().await {
                warn!("Cleanup after abort failed: {}", cleanup);
            }
            return Err(e);
        }
        self.finish_pass().await?;

        self.emit(ProgressEvent::Complete {
            merged: self.merged,
            failed: self.failures.total(),
            total,
        });
        Ok(true)
    }

    /// Runs the pretend phase of every package to merge, one at a time.
    ///
    /// Prefetchers keep running meanwhile. Every package is checked even
    /// after a failure so all refusals get reported. Returns `false` when
    /// a check failed or the run was terminated.
    async fn run_pretend(&mut self) -> PkgmergeResult<bool> {
        let pkgs: Vec<PkgRef> = self
            .mergelist
            .iter()
            .filter_map(|entry| match entry {
                MergeListEntry::Package(pkg)
                    if pkg.operation() == Operation::Merge && !pkg.installed() =>
                {
                    Some(pkg.clone())
                }
                _ => None,
            })
            .collect();

        let mut passed = true;
        for pkg in pkgs {
            if self.stopping() {
                break;
            }
            self.start_queued()?;
            debug!("Running pre-merge checks for {}", pkg.cpv());
            let mut settings = self.pool.allocate(pkg.root());
            settings.setcpv(&pkg, &self.opts.build_dir);
            settings.background = self.background;

            let (cancel, token) = cancel_pair();
            let check = phases::run_pretend(self.phase_ctx.clone(), pkg.clone(), settings, token);
            tokio::pin!(check);
            let (returncode, settings) = loop {
                tokio::select! {
                    result = &mut check => break result,
                    event = self.events_rx.recv() => {
                        let event = event.ok_or(SchedulingError::ChannelClosed)?;
                        self.handle_event(event)?;
                        if self.stopping() {
                            cancel.cancel();
                        } else {
                            self.start_queued()?;
                        }
                    }
                }
            };

            if returncode != 0 && !self.stopping() {
                self.record_failure(&pkg, FailureStage::Pretend, returncode, &settings);
                passed = false;
            }
            self.release(settings)?;
        }
        Ok(passed && !self.stopping())
    }

    async fn main_loop(&mut self) -> PkgmergeResult<()> {
        let mut display = interval(self.opts.display_latency);
        display.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let limits = self.admission.limits();
        let mut loadavg = (limits.max_load.is_some() && limits.max_jobs.is_parallel()).then(|| {
            let mut tick = interval(self.opts.loadavg_latency);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tick
        });

        self.schedule()?;
        while self.keep_scheduling() || self.is_work_scheduled() {
            let delay = self.job_delay;
            tokio::select! {
                event = self.events_rx.recv() => {
                    let event = event.ok_or(SchedulingError::ChannelClosed)?;
                    self.handle_event(event)?;
                }
                _ = sleep_until(delay.unwrap_or_else(Instant::now)), if delay.is_some() => {
                    self.job_delay = None;
                }
                _ = maybe_tick(loadavg.as_mut()) => {}
                _ = display.tick() => {
                    self.refresh_status();
                }
            }
            self.schedule()?;
        }
        self.refresh_status();
        Ok(())
    }

    /// Starts work until a fixed point is reached.
    fn schedule(&mut self) -> PkgmergeResult<()> {
        loop {
            let mut changed = false;

            if self.gate.can_drain(self.jobs, !self.queues.merge.is_empty())
                && let Some((pkg, (id, task))) = self.gate.drain()
            {
                debug!("Releasing deferred merge of {}", pkg.cpv());
                self.queues.merge.add(id, QueuedTask::Merge(task));
                changed = true;
            }

            changed |= self.schedule_jobs();

            if self.failures.has_pass_failures()
                && !self.opts.fetch_only
                && !self.is_work_scheduled()
                && !self.queues.fetch.is_empty()
            {
                self.cancel_prefetchers()?;
            }

            changed |= self.start_queued()?;

            if !changed {
                return Ok(());
            }
        }
    }

    fn keep_scheduling(&self) -> bool {
        self.terminated.is_none()
            && !self.aborted
            && !self.chooser.is_empty()
            && !(self.failures.has_pass_failures() && !self.opts.fetch_only)
    }

    /// Whether anything other than a prefetcher is queued or running.
    fn is_work_scheduled(&self) -> bool {
        self.tasks.values().any(|info| info.kind != TaskKind::Prefetch)
            || !self.queues.jobs.is_empty()
            || !self.queues.merge.is_empty()
            || self.gate.has_waiting()
    }

    fn stopping(&self) -> bool {
        self.terminated.is_some() || self.aborted
    }

    /// Chooses packages and creates their tasks while admission allows.
    fn schedule_jobs(&mut self) -> bool {
        let mut changed = false;
        loop {
            if !self.keep_scheduling()
                || self.chooser.is_stalled()
                || self.gate.blocks_new_jobs(self.jobs)
                || !self.admission.can_start_job(self.jobs, self.stopping())
            {
                break;
            }
            if let Some(deadline) = self.admission.should_delay(self.jobs, Instant::now()) {
                debug!("Delaying next job for load average");
                self.job_delay = Some(deadline);
                break;
            }

            let ctx = ChooseContext {
                completed: &self.completed,
                work_scheduled: self.is_work_scheduled(),
            };
            let Some(pkg) = self.chooser.choose(self.graph.as_mut(), ctx) else {
                break;
            };
            changed = true;
            self.create_task(pkg);
        }
        changed
    }

    fn create_task(&mut self, pkg: PkgRef) {
        let id = self.ids.next();
        let mut settings = self.pool.allocate(pkg.root());
        settings.setcpv(&pkg, &self.opts.build_dir);
        settings.background = self.background;

        if pkg.installed() {
            debug!("Queueing {} {} ahead of other merges", pkg.operation(), pkg.cpv());
            self.queues
                .merge
                .add_front(id, QueuedTask::Merge(MergeTask { pkg, settings }));
            return;
        }

        self.status.curval += 1;
        self.jobs += 1;
        self.status.running = self.jobs;
        self.admission.job_started(Instant::now());
        let prefetch = self.take_prefetcher(&pkg);
        let task = BuildTask {
            pkg,
            settings,
            prefetch,
            index: self.status.curval,
            total: self.status.maxval,
        };
        self.queues.jobs.add(id, QueuedTask::Build(task));
    }

    /// Removes the prefetcher of `pkg` from the map.
    ///
    /// A prefetcher that has not started yet is withdrawn; the build fetches
    /// itself. A started one is handed to the build to wait on.
    fn take_prefetcher(&mut self, pkg: &PkgRef) -> Option<PrefetchWatch> {
        let (prefetch_id, watch) = self.prefetchers.remove(pkg)?;
        if self
            .queues
            .fetch
            .remove(|id, _| id == prefetch_id)
            .is_some()
        {
            debug!("Withdrew pending prefetcher of {}", pkg.cpv());
            return None;
        }
        Some(watch)
    }

    fn cancel_prefetchers(&mut self) -> PkgmergeResult<()> {
        debug!("Cancelling prefetchers, nothing else is left to do");
        for (_, task) in self.queues.fetch.clear() {
            self.drop_task(task)?;
        }
        for info in self.tasks.values() {
            if info.kind == TaskKind::Prefetch {
                info.cancel.cancel();
            }
        }
        self.prefetchers.clear();
        Ok(())
    }

    fn start_queued(&mut self) -> PkgmergeResult<bool> {
        let mut started = Vec::new();
        for queue in self.queues.iter_mut() {
            let name = queue.name();
            started.extend(
                queue
                    .schedule()
                    .into_iter()
                    .map(|(id, task)| (name, id, task)),
            );
        }
        let changed = !started.is_empty();
        for (queue, id, task) in started {
            self.start_task(queue, id, task);
        }
        Ok(changed)
    }

    fn start_task(&mut self, queue: QueueName, id: TaskId, task: QueuedTask) {
        match task {
            QueuedTask::Slot(reply) => {
                // A requester that gave up drops the permit, which frees the slot again.
                let _ = reply.send(SlotPermit::new(queue, id, self.events_tx.clone()));
            }
            QueuedTask::Prefetch(PrefetchTask { pkg, reporter }) => {
                debug!("Prefetching {}", pkg.cpv());
                let mut settings = self.pool.allocate(pkg.root());
                settings.setcpv(&pkg, &self.opts.build_dir);
                settings.background = true;
                let (guard, cancel) = self.track(id, &pkg, TaskKind::Prefetch, settings);
                tokio::spawn(phases::run_prefetch(
                    self.phase_ctx.clone(),
                    pkg,
                    reporter,
                    guard,
                    cancel,
                ));
            }
            QueuedTask::Build(BuildTask {
                pkg,
                settings,
                prefetch,
                index,
                total,
            }) => {
                let kind = if self.opts.fetch_only {
                    JobKind::Fetch
                } else if pkg.built() {
                    JobKind::Binary
                } else {
                    JobKind::Build
                };
                info!("Starting {} of {} ({} of {})", kind, pkg.cpv(), index, total);
                self.emit(ProgressEvent::JobStarted {
                    cpv: pkg.cpv().to_string(),
                    root: pkg.root().to_string(),
                    kind,
                    index,
                    total,
                });
                let (guard, cancel) = self.track(id, &pkg, TaskKind::Build, settings);
                tokio::spawn(phases::run_build(
                    self.phase_ctx.clone(),
                    pkg,
                    prefetch,
                    guard,
                    cancel,
                ));
            }
            QueuedTask::Merge(MergeTask { pkg, settings }) => {
                if self.gate.is_wait_scheduled(&pkg) {
                    self.gate
                        .merge_started(&pkg, self.graph.as_ref(), &self.completed);
                }
                if !self.phase_ctx.plan.merge_is_noop(&pkg) {
                    info!("Starting {} of {}", pkg.operation(), pkg.cpv());
                    self.emit(ProgressEvent::MergeStarted {
                        cpv: pkg.cpv().to_string(),
                        root: pkg.root().to_string(),
                        uninstall: pkg.operation() == Operation::Uninstall,
                    });
                }
                let (guard, cancel) = self.track(id, &pkg, TaskKind::Merge, settings);
                tokio::spawn(phases::run_merge(self.phase_ctx.clone(), pkg, guard, cancel));
            }
        }
    }

    fn track(
        &mut self,
        id: TaskId,
        pkg: &PkgRef,
        kind: TaskKind,
        settings: BuildSettings,
    ) -> (ExitGuard, CancelToken) {
        let (cancel, token) = cancel_pair();
        self.tasks.insert(
            id,
            TaskInfo {
                pkg: pkg.clone(),
                kind,
                cancel,
            },
        );
        (ExitGuard::new(id, self.events_tx.clone(), settings), token)
    }

    fn handle_event(&mut self, event: SchedulerEvent) -> PkgmergeResult<()> {
        match event {
            SchedulerEvent::TaskExited { id, exit } => self.task_exited(id, exit),
            SchedulerEvent::SlotRequested { queue, reply } => {
                if self.stopping() {
                    drop(reply);
                } else {
                    let id = self.ids.next();
                    self.queues.get_mut(queue).add(id, QueuedTask::Slot(reply));
                }
                Ok(())
            }
            SchedulerEvent::SlotReleased { queue, id } => {
                self.queues.get_mut(queue).finish(id)?;
                Ok(())
            }
            SchedulerEvent::Terminate { signal } => self.terminate(signal),
            SchedulerEvent::Continued => {
                debug!("Continued after stop, holding back new jobs");
                self.admission.continued(Instant::now());
                Ok(())
            }
        }
    }

    fn task_exited(&mut self, id: TaskId, exit: TaskExit) -> PkgmergeResult<()> {
        let Some(info) = self.tasks.remove(&id) else {
            return Err(SchedulingError::UnknownTask {
                task_id: id.get(),
                kind: format!("exit {}", exit.returncode),
            }
            .into());
        };
        self.queues.get_mut(info.kind.queue()).finish(id)?;
        self.chooser.task_completed();

        let Some(settings) = exit.settings else {
            return Err(SchedulingError::MissingSettings { task_id: id.get() }.into());
        };
        let outcome = ExitOutcome {
            returncode: exit.returncode,
            stage: exit.stage,
            postinst_failed: exit.postinst_failed,
        };
        match info.kind {
            TaskKind::Prefetch => {
                debug!(
                    "Prefetcher of {} exited with {}",
                    info.pkg.cpv(),
                    outcome.returncode
                );
                self.release(settings)
            }
            TaskKind::Build => self.build_exit(info.pkg, outcome, settings),
            TaskKind::Merge => self.merge_exit(info.pkg, outcome, settings),
        }
    }

    fn build_exit(
        &mut self,
        pkg: PkgRef,
        outcome: ExitOutcome,
        settings: BuildSettings,
    ) -> PkgmergeResult<()> {
        self.jobs = self.jobs.saturating_sub(1);
        self.status.running = self.jobs;

        if outcome.returncode != 0 {
            self.record_failure(&pkg, outcome.stage, outcome.returncode, &settings);
            return self.release(settings);
        }
        if self.stopping() {
            debug!("Not merging {} after termination", pkg.cpv());
            return self.release(settings);
        }

        info!("Finished building {}", pkg.cpv());
        self.emit(ProgressEvent::BuildCompleted {
            cpv: pkg.cpv().to_string(),
            root: pkg.root().to_string(),
        });
        let id = self.ids.next();
        let task = MergeTask {
            pkg: pkg.clone(),
            settings,
        };
        if !self.opts.buildpkg_only && self.gate.is_system_dep(&pkg) {
            self.gate.defer(pkg, (id, task));
        } else {
            self.queues.merge.add(id, QueuedTask::Merge(task));
        }
        Ok(())
    }

    fn merge_exit(
        &mut self,
        pkg: PkgRef,
        outcome: ExitOutcome,
        settings: BuildSettings,
    ) -> PkgmergeResult<()> {
        if self.gate.is_wait_scheduled(&pkg) {
            self.gate.merge_exited(&pkg);
        }
        if outcome.returncode != 0 {
            self.record_failure(&pkg, FailureStage::Install, outcome.returncode, &settings);
            self.complete_replaced(&pkg);
            return self.release(settings);
        }

        if outcome.postinst_failed {
            let failed = FailedPkg::new(pkg.clone(), FailureStage::Postinst, 1)
                .with_paths(settings.build_dir(), settings.log_file());
            warn!("Post-install of {} failed", pkg.cpv());
            self.emit(ProgressEvent::PostinstFailed {
                cpv: pkg.cpv().to_string(),
                root: pkg.root().to_string(),
                log_file: locate_failure_log(&failed),
            });
            self.failures.record_reported(failed);
        }

        self.task_complete(&pkg);
        self.complete_replaced(&pkg);

        if !self.phase_ctx.plan.merge_is_noop(&pkg) {
            info!("Finished {} of {}", pkg.operation(), pkg.cpv());
            self.merged += 1;
            self.status.merges += 1;
            self.emit(ProgressEvent::MergeCompleted {
                cpv: pkg.cpv().to_string(),
                root: pkg.root().to_string(),
                uninstall: pkg.operation() == Operation::Uninstall,
            });
            self.update_world(&pkg);
        }

        if !pkg.installed() {
            if let Some(state) = self.resume.get_mut() {
                state.remove_entry(&pkg);
                if state.mergelist.is_empty() {
                    self.resume.set(None);
                }
            }
            self.resume.commit()?;
        }

        self.release(settings)
    }

    fn task_complete(&mut self, pkg: &PkgRef) {
        self.completed.insert(pkg.clone());
        self.gate.task_completed(pkg);
        self.chooser.task_completed();
    }

    /// Marks the installed package replaced by `pkg` as done.
    fn complete_replaced(&mut self, pkg: &PkgRef) {
        let Some(replaced_cpv) = pkg.replaces() else {
            return;
        };
        let Some(replaced) = self
            .cache
            .find(
                PackageType::Installed,
                pkg.root(),
                replaced_cpv,
                Operation::Uninstall,
            )
            .cloned()
        else {
            return;
        };
        if self.graph.as_ref().is_none_or(|graph| graph.contains(&replaced)) {
            if self.chooser.remove(&replaced) {
                debug!("{} replaced {}, dropping its uninstall", pkg.cpv(), replaced_cpv);
            }
            self.task_complete(&replaced);
        }
    }

    fn update_world(&mut self, pkg: &PkgRef) {
        if self.opts.buildpkg_only
            || self.opts.fetch_only
            || self.opts.oneshot
            || pkg.root() != self.opts.target_root
            || !self.favorites.iter().any(|atom| pkg.matches_atom(atom))
        {
            return;
        }

        let atom = pkg.cp();
        let result = match pkg.operation() {
            Operation::Merge => self.world.add(atom).map(|changed| (changed, true)),
            Operation::Uninstall if self.cp_still_merged(pkg) => return,
            Operation::Uninstall => self.world.remove(atom).map(|changed| (changed, false)),
            Operation::Nomerge => return,
        };
        match result {
            Ok((true, added)) => {
                info!(
                    "{} {} the world set",
                    atom,
                    if added { "added to" } else { "removed from" }
                );
                self.emit(ProgressEvent::WorldUpdated {
                    atom: atom.to_string(),
                    added,
                });
            }
            Ok((false, _)) => {}
            Err(e) => warn!("Unable to update the world set for {}: {:#}", atom, e),
        }
    }

    /// Whether another version of `pkg` was or will be merged in this run.
    fn cp_still_merged(&self, pkg: &PkgRef) -> bool {
        let same = |other: &PkgRef| {
            other.operation() == Operation::Merge
                && other.root() == pkg.root()
                && other.cp() == pkg.cp()
        };
        self.completed.iter().any(same)
            || self.chooser.pending().any(same)
            || self.tasks.values().any(|info| same(&info.pkg))
            || self.gate.waiting().any(same)
            || self.queues.merge.pending().any(|task| match task {
                QueuedTask::Merge(merge) => same(&merge.pkg),
                _ => false,
            })
            || self.queues.jobs.pending().any(|task| match task {
                QueuedTask::Build(build) => same(&build.pkg),
                _ => false,
            })
    }

    fn record_failure(
        &mut self,
        pkg: &PkgRef,
        stage: FailureStage,
        returncode: i32,
        settings: &BuildSettings,
    ) {
        let failed = FailedPkg::new(pkg.clone(), stage, returncode)
            .with_paths(settings.build_dir(), settings.log_file());
        if !self.stopping() {
            warn!(
                "Failed to {} {} (exit code {})",
                stage,
                pkg.cpv(),
                returncode
            );
            self.emit(ProgressEvent::PackageFailed {
                cpv: pkg.cpv().to_string(),
                root: pkg.root().to_string(),
                action: stage.to_string(),
                returncode,
                log_file: locate_failure_log(&failed),
            });
            self.status.failed += 1;
        }
        self.failures.record(failed);
    }

    fn release(&mut self, settings: BuildSettings) -> PkgmergeResult<()> {
        self.pool.deallocate(settings)?;
        Ok(())
    }

    /// Releases whatever a task dropped from a queue was holding.
    fn drop_task(&mut self, task: QueuedTask) -> PkgmergeResult<()> {
        match task {
            QueuedTask::Slot(_) | QueuedTask::Prefetch(_) => Ok(()),
            QueuedTask::Build(build) => {
                self.jobs = self.jobs.saturating_sub(1);
                self.status.running = self.jobs;
                self.release(build.settings)
            }
            QueuedTask::Merge(merge) => self.release(merge.settings),
        }
    }

    fn terminate(&mut self, signal: i32) -> PkgmergeResult<()> {
        if self.terminated.is_some() {
            debug!("Ignoring repeated signal {}", signal);
            return Ok(());
        }
        warn!("Received signal {}, terminating", signal);
        self.terminated = Some(signal);
        self.emit(ProgressEvent::Signal { signal });
        self.cancel_all()
    }

    /// Cancels running tasks and drops everything not started yet.
    fn cancel_all(&mut self) -> PkgmergeResult<()> {
        for info in self.tasks.values() {
            info.cancel.cancel();
        }
        let mut dropped = Vec::new();
        for queue in self.queues.iter_mut() {
            dropped.extend(queue.clear());
        }
        for (_, task) in dropped {
            self.drop_task(task)?;
        }
        for (_, (_, task)) in self.gate.take_waiting() {
            self.release(task.settings)?;
        }
        self.chooser.clear();
        self.prefetchers.clear();
        Ok(())
    }

    /// Ends a pass: stops prefetchers and waits for everything to exit.
    async fn finish_pass(&mut self) -> PkgmergeResult<()> {
        if !self.queues.fetch.is_empty() {
            self.cancel_prefetchers()?;
        }
        self.drain().await
    }

    /// Handles events until no task is running.
    async fn drain(&mut self) -> PkgmergeResult<()> {
        loop {
            let busy = !self.tasks.is_empty()
                || self.queues.iter_mut().any(|queue| queue.running_len() > 0);
            if !busy {
                return Ok(());
            }
            let event = self
                .events_rx
                .recv()
                .await
                .ok_or(SchedulingError::ChannelClosed)?;
            self.handle_event(event)?;
            // Exits may leave work queued, e.g. a merge after a finished build.
            if !self.stopping() {
                self.start_queued()?;
            }
        }
    }

    fn add_prefetchers(&mut self) {
        if !self.opts.parallel_fetch || self.opts.fetch_only {
            return;
        }
        for entry in &self.mergelist {
            let MergeListEntry::Package(pkg) = entry else {
                continue;
            };
            if pkg.installed() || pkg.operation() == Operation::Uninstall {
                continue;
            }
            let id = self.ids.next();
            let (reporter, watch) = prefetch_pair();
            self.queues.fetch.add(
                id,
                QueuedTask::Prefetch(PrefetchTask {
                    pkg: pkg.clone(),
                    reporter,
                }),
            );
            self.prefetchers.insert(pkg.clone(), (id, watch));
        }
    }

    fn add_packages(&mut self) {
        let mut maxval = 0;
        for entry in &self.mergelist {
            match entry {
                MergeListEntry::Package(pkg) => {
                    if pkg.operation() == Operation::Merge {
                        maxval += 1;
                    }
                    self.chooser.push(pkg.clone());
                }
                MergeListEntry::Blocker(blocker) => {
                    debug!("Blocker {} is handled by the resolver", blocker);
                }
            }
        }
        self.status.reset(maxval);
    }

    /// Takes over the graph of a fresh pass.
    fn install_graph(&mut self, config: GraphConfig) {
        let GraphConfig {
            graph,
            mergelist,
            cache,
            system,
            favorites,
        } = config;
        self.graph = (!self.opts.nodeps).then_some(graph);
        let deep = match &self.graph {
            Some(graph) if self.opts.implicit_system_deps => {
                find_deep_system_runtime_deps(graph, &system)
            }
            _ => HashSet::new(),
        };
        debug!("{} packages are deep system dependencies", deep.len());
        self.gate = SystemDepsGate::new(deep);
        self.mergelist = mergelist;
        self.cache = cache;
        self.favorites = favorites;
        self.chooser.clear();
        self.completed.clear();
        self.prefetchers.clear();
    }

    /// Saves every merge of the merge list as the resume list.
    fn save_resume_list(&mut self) -> PkgmergeResult<()> {
        let entries: Vec<ResumeEntry> = self
            .mergelist
            .iter()
            .filter_map(MergeListEntry::as_package)
            .filter(|pkg| pkg.operation() == Operation::Merge)
            .map(|pkg| ResumeEntry::from(&**pkg))
            .collect();
        let state = (!entries.is_empty()).then(|| {
            ResumeState::new(
                &self.graph_path,
                &self.opts.target_root,
                entries,
                self.opts.saved(),
                self.favorites.clone(),
            )
        });
        self.resume.set(state);
        self.resume.commit()?;
        Ok(())
    }

    /// Drops failed packages and their dependents from the resume list and
    /// rebuilds the graph from what remains.
    ///
    /// Returns whether another pass should run.
    fn recalc_resume_list(&mut self) -> PkgmergeResult<bool> {
        let failed: Vec<PkgRef> = self
            .failures
            .pass_failures()
            .iter()
            .map(|failed| failed.pkg.clone())
            .collect();
        let dependents = match &self.graph {
            Some(graph) => dependents_of(graph, failed.iter()),
            None => Vec::new(),
        };

        let (dropped, remaining) = match self.resume.get_mut() {
            Some(state) => {
                for pkg in &failed {
                    state.remove_entry(pkg);
                }
                let dropped: Vec<PkgRef> = dependents
                    .into_iter()
                    .filter(|pkg| state.remove_entry(pkg))
                    .collect();
                (dropped, state.mergelist.clone())
            }
            None => (Vec::new(), Vec::new()),
        };

        self.failures.end_pass();
        let unusable: HashSet<&PkgRef> = failed.iter().chain(dropped.iter()).collect();
        for pkg in &dropped {
            let requires: Vec<String> = self
                .graph
                .as_ref()
                .map(|graph| graph.child_nodes(pkg, Some(ignore_soft)))
                .unwrap_or_default()
                .iter()
                .filter(|child| unusable.contains(child))
                .map(|child| child.cpv().to_string())
                .collect();
            warn!(
                "Dropping {} because it requires {}",
                pkg.cpv(),
                requires.join(", ")
            );
            self.emit(ProgressEvent::KeepGoingDropped {
                cpv: pkg.cpv().to_string(),
                root: pkg.root().to_string(),
                requires,
            });
            self.failures
                .record_reported(FailedPkg::new(pkg.clone(), FailureStage::Dropped, 1));
        }

        if remaining.is_empty() {
            self.resume.set(None);
            self.resume.commit()?;
            return Ok(false);
        }
        self.resume.commit()?;

        info!("Recalculating merge list, {} entries left", remaining.len());
        self.emit(ProgressEvent::Resuming {
            remaining: remaining.len(),
        });
        match self.resolver.resume(&remaining) {
            Ok(config) => {
                self.install_graph(config);
                self.save_resume_list()?;
                self.resuming = true;
                Ok(true)
            }
            Err(e) => {
                warn!("Unable to recalculate the merge list: {}", e);
                self.emit(ProgressEvent::Error {
                    message: format!("Unable to recalculate the merge list: {}", e),
                    code: None,
                });
                Ok(false)
            }
        }
    }

    fn summary(&mut self) -> RunSummary {
        let failures: Vec<FailureInfo> = self.failures.all().map(FailedPkg::info).collect();
        let failed = failures.len();

        if self.background && failed == 1 && self.terminated.is_none() {
            self.dump_failure_log();
        }

        let (result, exit_code) = match self.terminated {
            Some(signal) => (RunResult::Interrupted, ExitCode::Signal(signal)),
            None if failed > 0 => (RunResult::Failed, ExitCode::Failure),
            None => (RunResult::Success, ExitCode::Success),
        };
        RunSummary {
            result,
            merged: self.merged,
            failed,
            exit_code: i32::from(exit_code.code()),
            failures,
            list_failures: failed > 1 || (failed > 0 && self.opts.keep_going),
        }
    }

    fn dump_failure_log(&mut self) {
        let Some(failed) = self.failures.all().next() else {
            return;
        };
        let Some(log_file) = locate_failure_log(failed) else {
            return;
        };
        let cpv = failed.pkg.cpv().to_string();
        match std::fs::read_to_string(&log_file) {
            Ok(contents) => self.emit(ProgressEvent::FailureLog {
                cpv,
                log_file,
                contents,
            }),
            Err(e) => warn!("Unable to read {}: {}", log_file.display(), e),
        }
    }

    fn refresh_status(&mut self) {
        let load = self.admission.load_avg();
        if let Some(event) = self.status.refresh(load) {
            self.emit(event);
        }
    }

    fn emit(&mut self, event: ProgressEvent) {
        if let Err(e) = self.output.write_event(&event) {
            warn!("Failed to write progress event: {}", e);
        }
    }
}

/// Exit status of a task, without its settings.
#[derive(Debug, Clone, Copy)]
struct ExitOutcome {
    returncode: i32,
    stage: FailureStage,
    postinst_failed: bool,
}

async fn maybe_tick(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

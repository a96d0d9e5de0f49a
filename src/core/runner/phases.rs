//! Task futures.
//!
//! Each started task runs as its own tokio task. It owns an [`ExitGuard`]
//! holding its build settings and reports back to the scheduler loop only
//! through the guard and slot requests.

use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::queue::QueueName;
use super::task::{
    CancelToken, EventSender, ExitGuard, PrefetchReporter, PrefetchWatch, RETURNCODE_CANCELLED,
    SlotPermit, acquire_slot,
};
use super::traits::{Phase, PhaseExecutor};
use crate::core::operations::{BuildSettings, FailureStage};
use crate::package::{Operation, Package, PkgRef};

/// Work waiting in one of the scheduler queues.
#[derive(Debug)]
pub enum QueuedTask {
    Prefetch(PrefetchTask),
    Build(BuildTask),
    Merge(MergeTask),
    /// A phase waiting for a slot in a serialization queue.
    Slot(oneshot::Sender<SlotPermit>),
}

/// Fetches a package's files ahead of its build.
#[derive(Debug)]
pub struct PrefetchTask {
    pub pkg: PkgRef,
    pub reporter: PrefetchReporter,
}

/// Builds a package from source or extracts a binary package.
#[derive(Debug)]
pub struct BuildTask {
    pub pkg: PkgRef,
    pub settings: BuildSettings,
    /// The package's prefetcher, if one was already started.
    pub prefetch: Option<PrefetchWatch>,
    pub index: usize,
    pub total: usize,
}

/// Merges a built package, or uninstalls an installed one.
#[derive(Debug)]
pub struct MergeTask {
    pub pkg: PkgRef,
    pub settings: BuildSettings,
}

/// Option bits the task futures need.
#[derive(Debug, Clone, Copy, Default)]
pub struct PhasePlan {
    pub fetch_only: bool,
    pub buildpkg: bool,
    pub buildpkg_only: bool,
    /// Queue serializing the setup phase.
    pub setup_queue: Option<QueueName>,
}

impl PhasePlan {
    /// Whether merging `pkg` has nothing to do.
    pub fn merge_is_noop(&self, pkg: &Package) -> bool {
        match pkg.operation() {
            Operation::Nomerge => true,
            Operation::Uninstall => false,
            Operation::Merge => self.fetch_only || self.buildpkg_only,
        }
    }

    /// Phases after the fetch of a build job, with the queue each must hold
    /// a slot in.
    pub fn build_steps(&self, pkg: &Package) -> Vec<(Phase, Option<QueueName>)> {
        if self.fetch_only {
            return Vec::new();
        }
        if pkg.built() {
            return vec![(Phase::Setup, self.setup_queue), (Phase::Extract, None)];
        }
        let mut steps = vec![
            (Phase::Setup, self.setup_queue),
            (Phase::Unpack, pkg.live().then_some(QueueName::Unpack)),
            (Phase::Compile, None),
            (Phase::Install, None),
        ];
        if self.buildpkg || self.buildpkg_only {
            steps.push((Phase::Package, None));
        }
        steps
    }
}

/// What every task future shares.
#[derive(Clone)]
pub struct PhaseContext {
    pub executor: Arc<dyn PhaseExecutor>,
    pub events: EventSender,
    pub plan: PhasePlan,
}

impl std::fmt::Debug for PhaseContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhaseContext")
            .field("plan", &self.plan)
            .finish_non_exhaustive()
    }
}

impl PhaseContext {
    async fn run(
        &self,
        pkg: &Package,
        phase: Phase,
        settings: &BuildSettings,
        cancel: &mut CancelToken,
    ) -> i32 {
        if cancel.is_cancelled() {
            return RETURNCODE_CANCELLED;
        }
        match self.executor.run_phase(pkg, phase, settings, cancel).await {
            Ok(outcome) => outcome.returncode,
            Err(e) => {
                warn!("Unable to run {} phase of {}: {:#}", phase, pkg.cpv(), e);
                1
            }
        }
    }

    async fn run_locked(
        &self,
        pkg: &Package,
        phase: Phase,
        queue: QueueName,
        settings: &BuildSettings,
        cancel: &mut CancelToken,
    ) -> i32 {
        let permit = tokio::select! {
            permit = acquire_slot(&self.events, queue) => permit,
            _ = cancel.cancelled() => None,
        };
        let Some(_permit) = permit else {
            return RETURNCODE_CANCELLED;
        };
        debug!("{} phase of {} holds the {} slot", phase, pkg.cpv(), queue);
        self.run(pkg, phase, settings, cancel).await
    }
}

/// Runs the pre-merge checks of one package.
///
/// Hands the settings back so the scheduler can release them.
pub async fn run_pretend(
    ctx: PhaseContext,
    pkg: PkgRef,
    settings: BuildSettings,
    mut cancel: CancelToken,
) -> (i32, BuildSettings) {
    let returncode = ctx.run(&pkg, Phase::Pretend, &settings, &mut cancel).await;
    (returncode, settings)
}

/// Runs a prefetcher to completion.
pub async fn run_prefetch(
    ctx: PhaseContext,
    pkg: PkgRef,
    reporter: PrefetchReporter,
    guard: ExitGuard,
    mut cancel: CancelToken,
) {
    let Some(settings) = guard.settings() else {
        return;
    };
    let returncode = ctx.run(&pkg, Phase::Fetch, settings, &mut cancel).await;
    reporter.done(returncode == 0);
    guard.finish(returncode, FailureStage::Fetch, false);
}

/// Runs a build job to completion.
pub async fn run_build(
    ctx: PhaseContext,
    pkg: PkgRef,
    prefetch: Option<PrefetchWatch>,
    guard: ExitGuard,
    mut cancel: CancelToken,
) {
    let Some(settings) = guard.settings() else {
        return;
    };
    let (returncode, stage) = build_phases(&ctx, &pkg, settings, prefetch, &mut cancel).await;
    guard.finish(returncode, stage, false);
}

async fn build_phases(
    ctx: &PhaseContext,
    pkg: &Package,
    settings: &BuildSettings,
    prefetch: Option<PrefetchWatch>,
    cancel: &mut CancelToken,
) -> (i32, FailureStage) {
    let prefetched = match prefetch {
        Some(mut prefetch) => {
            tokio::select! {
                ok = prefetch.finished() => ok,
                _ = cancel.cancelled() => return (RETURNCODE_CANCELLED, FailureStage::Fetch),
            }
        }
        None => false,
    };

    if prefetched {
        debug!("Files of {} already fetched", pkg.cpv());
    } else {
        let returncode = ctx.run(pkg, Phase::Fetch, settings, cancel).await;
        if returncode != 0 {
            return (returncode, FailureStage::Fetch);
        }
    }

    for (phase, queue) in ctx.plan.build_steps(pkg) {
        let returncode = match queue {
            Some(queue) => ctx.run_locked(pkg, phase, queue, settings, cancel).await,
            None => ctx.run(pkg, phase, settings, cancel).await,
        };
        if returncode != 0 {
            return (returncode, FailureStage::Build);
        }
    }
    (0, FailureStage::Build)
}

/// Runs a merge or uninstall to completion.
pub async fn run_merge(ctx: PhaseContext, pkg: PkgRef, guard: ExitGuard, mut cancel: CancelToken) {
    let Some(settings) = guard.settings() else {
        return;
    };
    let (returncode, postinst_failed) = merge_phases(&ctx, &pkg, settings, &mut cancel).await;
    guard.finish(returncode, FailureStage::Install, postinst_failed);
}

async fn merge_phases(
    ctx: &PhaseContext,
    pkg: &Package,
    settings: &BuildSettings,
    cancel: &mut CancelToken,
) -> (i32, bool) {
    if ctx.plan.merge_is_noop(pkg) {
        return (0, false);
    }
    if pkg.operation() == Operation::Uninstall {
        return (ctx.run(pkg, Phase::Unmerge, settings, cancel).await, false);
    }

    let returncode = ctx.run(pkg, Phase::Merge, settings, cancel).await;
    if returncode != 0 {
        return (returncode, false);
    }
    // The package is in place at this point; a failing postinst only gets reported.
    let postinst = ctx.run(pkg, Phase::Postinst, settings, cancel).await;
    (0, postinst != 0)
}

//! Task runtime plumbing.
//!
//! Running tasks talk to the scheduler loop only through
//! [`SchedulerEvent`]s on one unbounded channel. Every task owns an
//! [`ExitGuard`] that posts its exit exactly once, even when the task
//! future panics, and hands its build settings back with it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, oneshot, watch};

use super::queue::QueueName;
use crate::core::operations::BuildSettings;
use crate::core::operations::FailureStage;

/// Return code reported for a task that vanished without an exit status.
pub const RETURNCODE_ABORTED: i32 = 128 + 6;

/// Return code reported for a task that was cancelled.
pub const RETURNCODE_CANCELLED: i32 = 128 + 15;

/// Identifier of a queued or running task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Hands out task identifiers.
#[derive(Debug, Default)]
pub struct TaskIdGen(AtomicU64);

impl TaskIdGen {
    pub fn next(&self) -> TaskId {
        TaskId(self.0.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// How a task ended.
#[derive(Debug)]
pub struct TaskExit {
    pub returncode: i32,
    /// Stage that failed when `returncode` is non-zero.
    pub stage: FailureStage,
    /// Set when only the post-install step failed.
    pub postinst_failed: bool,
    /// The settings the task ran with, to be returned to the pool.
    pub settings: Option<BuildSettings>,
}

impl TaskExit {
    pub fn is_success(&self) -> bool {
        self.returncode == 0
    }
}

/// Messages posted to the scheduler loop.
#[derive(Debug)]
pub enum SchedulerEvent {
    /// A started task ended.
    TaskExited { id: TaskId, exit: TaskExit },
    /// A phase asks for a slot in a serialization queue.
    SlotRequested {
        queue: QueueName,
        reply: oneshot::Sender<SlotPermit>,
    },
    /// A slot was given back.
    SlotReleased { queue: QueueName, id: TaskId },
    /// SIGINT or SIGTERM arrived.
    Terminate { signal: i32 },
    /// SIGCONT arrived.
    Continued,
}

/// Sending half of the scheduler event channel.
pub type EventSender = mpsc::UnboundedSender<SchedulerEvent>;

/// Posts a task's exit when finished or dropped.
#[derive(Debug)]
pub struct ExitGuard {
    id: TaskId,
    events: EventSender,
    settings: Option<BuildSettings>,
    sent: bool,
}

impl ExitGuard {
    pub fn new(id: TaskId, events: EventSender, settings: BuildSettings) -> Self {
        Self {
            id,
            events,
            settings: Some(settings),
            sent: false,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// The settings the task runs with.
    pub fn settings(&self) -> Option<&BuildSettings> {
        self.settings.as_ref()
    }

    pub fn settings_mut(&mut self) -> Option<&mut BuildSettings> {
        self.settings.as_mut()
    }

    /// Posts the exit.
    pub fn finish(mut self, returncode: i32, stage: FailureStage, postinst_failed: bool) {
        self.send(returncode, stage, postinst_failed);
    }

    fn send(&mut self, returncode: i32, stage: FailureStage, postinst_failed: bool) {
        if self.sent {
            return;
        }
        self.sent = true;
        let exit = TaskExit {
            returncode,
            stage,
            postinst_failed,
            settings: self.settings.take(),
        };
        // The loop is gone only after every task exited or the run aborted.
        let _ = self.events.send(SchedulerEvent::TaskExited { id: self.id, exit });
    }
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.send(RETURNCODE_ABORTED, FailureStage::Build, false);
    }
}

/// A slot in a serialization queue, released on drop.
#[derive(Debug)]
pub struct SlotPermit {
    queue: QueueName,
    id: TaskId,
    events: EventSender,
}

impl SlotPermit {
    pub fn new(queue: QueueName, id: TaskId, events: EventSender) -> Self {
        Self { queue, id, events }
    }

    pub fn queue(&self) -> QueueName {
        self.queue
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        let _ = self.events.send(SchedulerEvent::SlotReleased {
            queue: self.queue,
            id: self.id,
        });
    }
}

/// Asks the scheduler for a slot in `queue` and waits until it is granted.
///
/// Returns `None` when the scheduler dropped the request, e.g. because the
/// run is being terminated.
pub async fn acquire_slot(events: &EventSender, queue: QueueName) -> Option<SlotPermit> {
    let (reply, granted) = oneshot::channel();
    events
        .send(SchedulerEvent::SlotRequested { queue, reply })
        .ok()?;
    granted.await.ok()
}

/// Requests cancellation of one task.
#[derive(Debug, Clone)]
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }
}

/// Observes cancellation inside a task.
#[derive(Debug, Clone)]
pub struct CancelToken(watch::Receiver<bool>);

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once cancellation is requested.
    ///
    /// Never resolves if the handle is dropped without cancelling.
    pub async fn cancelled(&mut self) {
        if self.0.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Creates a connected cancel handle and token.
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle(tx), CancelToken(rx))
}

/// Progress of a prefetcher: `None` while running, then whether it succeeded.
pub type PrefetchStatus = Option<bool>;

/// Watches a started prefetcher from the build that needs its files.
#[derive(Debug, Clone)]
pub struct PrefetchWatch(watch::Receiver<PrefetchStatus>);

impl PrefetchWatch {
    /// Waits for the prefetcher to end and returns whether it succeeded.
    pub async fn finished(&mut self) -> bool {
        match self.0.wait_for(Option::is_some).await {
            Ok(status) => (*status).unwrap_or(false),
            Err(_) => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.0.borrow().is_none()
    }
}

/// Reporting half of a prefetcher's status.
#[derive(Debug)]
pub struct PrefetchReporter(watch::Sender<PrefetchStatus>);

impl PrefetchReporter {
    pub fn done(&self, success: bool) {
        self.0.send_replace(Some(success));
    }
}

pub fn prefetch_pair() -> (PrefetchReporter, PrefetchWatch) {
    let (tx, rx) = watch::channel(None);
    (PrefetchReporter(tx), PrefetchWatch(rx))
}

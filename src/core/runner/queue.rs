//! Named task queues with a concurrency limit.
//!
//! A [`TaskQueue`] only does bookkeeping: [`schedule`](TaskQueue::schedule)
//! moves pending tasks to the running set and hands them back to the owner,
//! which starts them. When a started task exits the owner calls
//! [`finish`](TaskQueue::finish) before handling the exit, so the handler
//! sees the freed slot and can schedule more work right away.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::future::Future;

use tokio::sync::watch;

use super::task::TaskId;
use crate::core::operations::MaxJobs;
use crate::error::SchedulingError;

/// The queues of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    /// Prefetchers, one at a time.
    Fetch,
    /// Unpack phases of live packages, one at a time.
    Unpack,
    /// Build and extract jobs.
    Jobs,
    /// Merges, uninstalls and setup phases.
    Merge,
    /// Setup phases when merges run in parallel.
    EbuildLocks,
}

impl QueueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Fetch => "fetch",
            QueueName::Unpack => "unpack",
            QueueName::Jobs => "jobs",
            QueueName::Merge => "merge",
            QueueName::EbuildLocks => "ebuild_locks",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// FIFO of pending tasks plus the set of running ones.
#[derive(Debug)]
pub struct TaskQueue<T> {
    name: QueueName,
    max_jobs: MaxJobs,
    pending: VecDeque<(TaskId, T)>,
    running: HashSet<TaskId>,
    size: watch::Sender<usize>,
}

impl<T> TaskQueue<T> {
    pub fn new(name: QueueName, max_jobs: MaxJobs) -> Self {
        let (size, _) = watch::channel(0);
        Self {
            name,
            max_jobs,
            pending: VecDeque::new(),
            running: HashSet::new(),
            size,
        }
    }

    pub fn name(&self) -> QueueName {
        self.name
    }

    /// Appends a task.
    pub fn add(&mut self, id: TaskId, task: T) {
        self.pending.push_back((id, task));
        self.publish();
    }

    /// Puts a task in front of everything pending.
    pub fn add_front(&mut self, id: TaskId, task: T) {
        self.pending.push_front((id, task));
        self.publish();
    }

    /// Starts pending tasks while the limit allows.
    ///
    /// Returns the tasks that are now running; the caller must start them.
    pub fn schedule(&mut self) -> Vec<(TaskId, T)> {
        let mut started = Vec::new();
        while self.max_jobs.allows(self.running.len()) {
            let Some((id, task)) = self.pending.pop_front() else {
                break;
            };
            self.running.insert(id);
            started.push((id, task));
        }
        started
    }

    /// Marks a running task as exited.
    pub fn finish(&mut self, id: TaskId) -> Result<(), SchedulingError> {
        if !self.running.remove(&id) {
            return Err(SchedulingError::NotRunning {
                task_id: id.get(),
                queue: self.name.to_string(),
            });
        }
        self.publish();
        Ok(())
    }

    /// Drops every pending task, returning them to the caller.
    ///
    /// Running tasks are left alone; their owner cancels them.
    pub fn clear(&mut self) -> Vec<(TaskId, T)> {
        let dropped = self.pending.drain(..).collect();
        self.publish();
        dropped
    }

    /// Withdraws the first pending task matching `pred`.
    pub fn remove<F>(&mut self, mut pred: F) -> Option<(TaskId, T)>
    where
        F: FnMut(TaskId, &T) -> bool,
    {
        let index = self.pending.iter().position(|(id, task)| pred(*id, task))?;
        let removed = self.pending.remove(index);
        self.publish();
        removed
    }

    /// Pending tasks in start order.
    pub fn pending(&self) -> impl Iterator<Item = &T> {
        self.pending.iter().map(|(_, task)| task)
    }

    pub fn running_len(&self) -> usize {
        self.running.len()
    }

    /// Pending plus running tasks.
    pub fn len(&self) -> usize {
        self.pending.len() + self.running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves once nothing is pending or running.
    ///
    /// The future does not borrow the queue.
    pub fn wait(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.size.subscribe();
        async move {
            let _ = rx.wait_for(|size| *size == 0).await;
        }
    }

    fn publish(&self) {
        self.size.send_replace(self.len());
    }
}

/// All queues of one scheduler.
#[derive(Debug)]
pub struct TaskQueues<T> {
    pub fetch: TaskQueue<T>,
    pub unpack: TaskQueue<T>,
    pub jobs: TaskQueue<T>,
    pub merge: TaskQueue<T>,
    pub ebuild_locks: TaskQueue<T>,
}

impl<T> TaskQueues<T> {
    /// Creates the queues. Merges run `merge_jobs` at a time.
    pub fn new(max_jobs: MaxJobs, merge_jobs: MaxJobs) -> Self {
        Self {
            fetch: TaskQueue::new(QueueName::Fetch, MaxJobs::ONE),
            unpack: TaskQueue::new(QueueName::Unpack, MaxJobs::ONE),
            jobs: TaskQueue::new(QueueName::Jobs, max_jobs),
            merge: TaskQueue::new(QueueName::Merge, merge_jobs),
            ebuild_locks: TaskQueue::new(QueueName::EbuildLocks, MaxJobs::ONE),
        }
    }

    pub fn get_mut(&mut self, name: QueueName) -> &mut TaskQueue<T> {
        match name {
            QueueName::Fetch => &mut self.fetch,
            QueueName::Unpack => &mut self.unpack,
            QueueName::Jobs => &mut self.jobs,
            QueueName::Merge => &mut self.merge,
            QueueName::EbuildLocks => &mut self.ebuild_locks,
        }
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut TaskQueue<T>> {
        [
            &mut self.merge,
            &mut self.jobs,
            &mut self.ebuild_locks,
            &mut self.fetch,
            &mut self.unpack,
        ]
        .into_iter()
    }
}
